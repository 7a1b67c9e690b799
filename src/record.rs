//! Lot and stage record types
//!
//! `LotRecord` is what the store hands back: possibly partial, stages keyed by
//! name. `AggregateRecord` is what callers render: total over every schema
//! field, built by [`crate::assembler::assemble`].

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::gate::StageStatus;
use crate::lot_id::LotId;
use crate::schema::{FieldMap, StageKind};

/// Base lot attributes, captured once by the creation transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: LotId,
    /// Base attributes keyed by `LOT_SCHEMA` store keys.
    #[serde(default, deserialize_with = "lenient_fields")]
    pub fields: FieldMap,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Lot {
    pub fn new(lot_id: LotId, fields: FieldMap) -> Self {
        Self {
            lot_id,
            fields,
            active: true,
        }
    }
}

/// Fields written for one stage of one lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    #[serde(default)]
    pub fields: FieldMap,
}

/// A lot as read from the store. Stages never written are simply absent.
///
/// Decoding is lenient: stage keys outside the pipeline are dropped and
/// scalar values are read as text, so one odd record never sinks a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawLotRecord")]
pub struct LotRecord {
    pub lot: Lot,
    pub stages: BTreeMap<StageKind, FieldMap>,
}

#[derive(Deserialize)]
struct RawLotRecord {
    lot: Lot,
    #[serde(default)]
    stages: BTreeMap<String, JsonValue>,
}

impl From<RawLotRecord> for LotRecord {
    fn from(raw: RawLotRecord) -> Self {
        let lot_id = &raw.lot.lot_id;
        let mut stages = BTreeMap::new();
        for (key, value) in raw.stages {
            let Ok(stage) = key.parse::<StageKind>() else {
                debug!(%lot_id, stage = %key, "Ignoring unknown stage in store record");
                continue;
            };
            match value {
                JsonValue::Object(map) => {
                    stages.insert(stage, coerce_fields(lot_id, map.into_iter()));
                }
                JsonValue::Null => {
                    stages.insert(stage, FieldMap::new());
                }
                other => {
                    debug!(%lot_id, %stage, value = %other, "Ignoring stage that is not an object");
                }
            }
        }
        Self { lot: raw.lot, stages }
    }
}

/// Text rendering of a stored scalar. Nested values have no field meaning.
fn scalar_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Null => Some(String::new()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

fn coerce_fields(
    lot_id: &LotId,
    entries: impl Iterator<Item = (String, JsonValue)>,
) -> FieldMap {
    let mut fields = FieldMap::new();
    for (key, value) in entries {
        match scalar_text(value) {
            Some(text) => {
                fields.insert(key, text);
            }
            None => debug!(%lot_id, field = %key, "Ignoring nested value in store record"),
        }
    }
    fields
}

fn lenient_fields<'de, D>(deserializer: D) -> Result<FieldMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, JsonValue>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| scalar_text(value).map(|text| (key, text)))
        .collect())
}

impl LotRecord {
    pub fn new(lot: Lot) -> Self {
        Self {
            lot,
            stages: BTreeMap::new(),
        }
    }

    pub fn lot_id(&self) -> &LotId {
        &self.lot.lot_id
    }

    /// Stage records present in this snapshot, in pipeline order.
    pub fn stage_records(&self) -> Vec<StageRecord> {
        self.stages
            .iter()
            .map(|(stage, fields)| StageRecord {
                stage: *stage,
                fields: fields.clone(),
            })
            .collect()
    }
}

/// One stage as rendered: every schema field present, plus derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageView {
    pub stage: StageKind,
    pub title: String,
    pub fields: FieldMap,
    pub status: StageStatus,
}

/// Base lot fields merged with every stage sub-record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub lot_id: LotId,
    pub active: bool,
    pub base: FieldMap,
    /// All nine stages in pipeline order.
    pub stages: Vec<StageView>,
}

impl AggregateRecord {
    pub fn stage(&self, stage: StageKind) -> Option<&StageView> {
        self.stages.iter().find(|v| v.stage == stage)
    }

    /// Status of a stage in this snapshot. Missing views count as unwritten.
    pub fn status(&self, stage: StageKind) -> StageStatus {
        self.stage(stage)
            .map(|v| v.status)
            .unwrap_or(StageStatus::Unwritten)
    }

    pub fn sealed_stages(&self) -> Vec<StageKind> {
        self.stages
            .iter()
            .filter(|v| v.status == StageStatus::Sealed)
            .map(|v| v.stage)
            .collect()
    }

    /// Case-insensitive substring match over the id, base values and stage values.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let hit = |value: &str| value.to_lowercase().contains(&needle);
        hit(self.lot_id.as_str())
            || self.base.values().any(|v| hit(v))
            || self
                .stages
                .iter()
                .any(|s| s.fields.values().any(|v| hit(v)))
    }
}

/// Filter aggregates by free text, keeping order.
pub fn search(aggregates: Vec<AggregateRecord>, text: &str) -> Vec<AggregateRecord> {
    aggregates.into_iter().filter(|a| a.matches(text)).collect()
}
