//! Record Assembler
//!
//! Merges base lot fields with whatever stage records exist into one total
//! [`AggregateRecord`]. Never fails: absent stages become all-empty views,
//! absent keys become empty strings, keys outside the schema are dropped.

use tracing::debug;

use crate::gate::stage_status;
use crate::record::{AggregateRecord, Lot, LotRecord, StageRecord, StageView};
use crate::schema::{FieldMap, FieldSet, StageKind, LOT_SCHEMA};

/// Project `recorded` onto `schema`: every schema key present, nothing else.
fn project(schema: &FieldSet, recorded: &FieldMap) -> FieldMap {
    schema
        .keys()
        .map(|key| {
            let value = recorded.get(key).cloned().unwrap_or_default();
            (key.to_string(), value)
        })
        .collect()
}

/// Build the aggregate for a lot from its stage records.
///
/// Deterministic. When the same stage appears more than once, records are
/// folded in slice order and a later non-blank value replaces an earlier one.
pub fn assemble(lot: &Lot, stage_records: &[StageRecord]) -> AggregateRecord {
    let mut merged: std::collections::BTreeMap<StageKind, FieldMap> = Default::default();
    for record in stage_records {
        let slot = merged.entry(record.stage).or_default();
        for (key, value) in &record.fields {
            if !value.trim().is_empty() || !slot.contains_key(key) {
                slot.insert(key.clone(), value.clone());
            }
        }
    }

    let stages = StageKind::ALL
        .into_iter()
        .map(|stage| {
            let schema = stage.schema();
            let recorded = merged.remove(&stage).unwrap_or_default();
            let dropped = recorded
                .keys()
                .filter(|k| !schema.keys().any(|key| key == k.as_str()))
                .count();
            if dropped > 0 {
                debug!(lot_id = %lot.lot_id, %stage, dropped, "Ignoring keys outside stage schema");
            }
            let fields = project(schema, &recorded);
            StageView {
                stage,
                title: schema.title.to_string(),
                status: stage_status(schema, &fields),
                fields,
            }
        })
        .collect();

    AggregateRecord {
        lot_id: lot.lot_id.clone(),
        active: lot.active,
        base: project(&LOT_SCHEMA, &lot.fields),
        stages,
    }
}

/// Assemble straight from a store snapshot.
pub fn assemble_record(record: &LotRecord) -> AggregateRecord {
    assemble(&record.lot, &record.stage_records())
}
