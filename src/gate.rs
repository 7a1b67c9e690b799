//! Stage Write Gate
//!
//! Decides, for a (lot, stage) pair, whether a write may be attempted, and
//! checks field completeness before anything is submitted.
//!
//! ## States
//!
//! ```text
//! Unwritten ──► Writable ──► Sealed (terminal)
//! ```
//!
//! Status is never stored. It is recomputed from each fresh read:
//! a stage is `Sealed` iff every required field is present and non-blank.
//! Nothing returns from `Sealed`.
//!
//! The seal check is advisory at read time. Two sessions may both observe
//! `Writable` and both submit; the store decides what happens to the second
//! write, and the next refresh shows the truth.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::record::AggregateRecord;
use crate::schema::{FieldMap, FieldSet, StageKind};

/// Derived write status of one stage of one lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No field of the stage carries a value.
    Unwritten,
    /// Some values present, at least one required field still blank.
    Writable,
    /// Every required field is filled. Terminal.
    Sealed,
}

impl StageStatus {
    pub fn can_write(&self) -> bool {
        !matches!(self, Self::Sealed)
    }
}

pub(crate) fn is_blank(value: Option<&String>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Status of a stage given the values currently recorded for it.
pub fn stage_status(schema: &FieldSet, recorded: &FieldMap) -> StageStatus {
    let all_required = schema
        .required_fields()
        .all(|key| !is_blank(recorded.get(key)));
    if all_required {
        return StageStatus::Sealed;
    }
    let any_value = schema.keys().any(|key| !is_blank(recorded.get(key)));
    if any_value {
        StageStatus::Writable
    } else {
        StageStatus::Unwritten
    }
}

/// Whether `stage` may be written, judged on the given snapshot only.
pub fn can_write(snapshot: &AggregateRecord, stage: StageKind) -> bool {
    match snapshot.stage(stage) {
        Some(view) => stage_status(stage.schema(), &view.fields).can_write(),
        None => true,
    }
}

/// Stages a front end may offer for entry, in pipeline order.
pub fn writable_stages(snapshot: &AggregateRecord) -> Vec<StageKind> {
    StageKind::ALL
        .into_iter()
        .filter(|stage| can_write(snapshot, *stage))
        .collect()
}

/// Check a submission against a schema. Fails closed.
///
/// Keys may be store keys or English names. On success returns the
/// submission re-keyed by store key with values trimmed; that map is what
/// gets sent to the store. A field given under both spellings must not
/// carry two different non-blank values.
pub fn validate(schema: &FieldSet, submitted: &FieldMap) -> Result<FieldMap, ValidationError> {
    let mut normalized = FieldMap::new();
    let mut unknown = Vec::new();
    let mut conflicting = Vec::new();

    for (key, value) in submitted {
        let Some(spec) = schema.resolve(key) else {
            unknown.push(key.clone());
            continue;
        };
        let value = value.trim();
        // Both the key and the English name may be present; keep the non-blank one.
        match normalized.get(spec.key) {
            Some(existing) if !existing.is_empty() && value.is_empty() => {}
            Some(existing) if !existing.is_empty() && existing != value => {
                conflicting.push(spec.key);
            }
            _ => {
                normalized.insert(spec.key.to_string(), value.to_string());
            }
        }
    }

    if !unknown.is_empty() {
        return Err(ValidationError::UnknownFields { fields: unknown });
    }

    if !conflicting.is_empty() {
        let fields = schema
            .keys()
            .filter(|key| conflicting.contains(key))
            .map(str::to_string)
            .collect();
        return Err(ValidationError::ConflictingFields { fields });
    }

    let missing: Vec<String> = schema
        .required_fields()
        .filter(|key| is_blank(normalized.get(*key)))
        .map(str::to_string)
        .collect();

    if !missing.is_empty() {
        return Err(ValidationError::MissingFields { fields: missing });
    }

    Ok(normalized)
}

/// [`validate`] against a stage schema.
pub fn validate_stage(stage: StageKind, submitted: &FieldMap) -> Result<FieldMap, ValidationError> {
    validate(stage.schema(), submitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::get_schema;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_status_transitions() {
        let secado = get_schema(StageKind::Secado);
        assert_eq!(stage_status(secado, &FieldMap::new()), StageStatus::Unwritten);
        assert_eq!(
            stage_status(secado, &fields(&[("metodoSecado", "sol")])),
            StageStatus::Writable
        );
        assert_eq!(
            stage_status(
                secado,
                &fields(&[
                    ("metodoSecado", "sol"),
                    ("humedadFinal", "11%"),
                    ("fechaSecado", "2025-02-20"),
                ])
            ),
            StageStatus::Sealed
        );
    }

    #[test]
    fn test_whitespace_does_not_seal() {
        let trillado = get_schema(StageKind::Trillado);
        let recorded = fields(&[("fechaTrillado", "2025-03-01"), ("cantidadTrillada", "  ")]);
        assert_eq!(stage_status(trillado, &recorded), StageStatus::Writable);
    }

    #[test]
    fn test_validate_reports_blank_required_field() {
        let err = validate_stage(
            StageKind::Trillado,
            &fields(&[("fechaTrillado", "2025-03-01"), ("cantidadTrillada", "")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields {
                fields: vec!["cantidadTrillada".into()]
            }
        );
    }

    #[test]
    fn test_validate_reports_missing_in_schema_order() {
        let err = validate_stage(StageKind::Empaque, &FieldMap::new()).unwrap_err();
        assert_eq!(err.missing(), ["tipoEmpaque", "pesoLote", "fechaEmpaque"]);
    }

    #[test]
    fn test_validate_accepts_english_names_and_trims() {
        let normalized = validate_stage(
            StageKind::Trillado,
            &fields(&[("millingDate", " 2025-03-01 "), ("milledQuantity", "300 kg")]),
        )
        .unwrap();
        assert_eq!(normalized, fields(&[
            ("cantidadTrillada", "300 kg"),
            ("fechaTrillado", "2025-03-01"),
        ]));
    }

    #[test]
    fn test_validate_rejects_unknown_keys() {
        let err = validate_stage(
            StageKind::Trillado,
            &fields(&[
                ("fechaTrillado", "2025-03-01"),
                ("cantidadTrillada", "300 kg"),
                ("tostado", "medio"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownFields {
                fields: vec!["tostado".into()]
            }
        );
    }

    #[test]
    fn test_validate_key_and_name_prefer_non_blank() {
        let normalized = validate_stage(
            StageKind::Trillado,
            &fields(&[
                ("cantidadTrillada", "300 kg"),
                ("fechaTrillado", "2025-03-01"),
                ("milledQuantity", ""),
            ]),
        )
        .unwrap();
        assert_eq!(normalized["cantidadTrillada"], "300 kg");
    }

    #[test]
    fn test_validate_key_and_name_with_different_values_conflict() {
        let err = validate_stage(
            StageKind::Trillado,
            &fields(&[
                ("cantidadTrillada", "300 kg"),
                ("milledQuantity", "250 kg"),
                ("fechaTrillado", "2025-03-01"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::ConflictingFields {
                fields: vec!["cantidadTrillada".to_string()]
            }
        );

        // Same value under both spellings is not a conflict.
        let normalized = validate_stage(
            StageKind::Trillado,
            &fields(&[
                ("cantidadTrillada", "300 kg"),
                ("milledQuantity", " 300 kg "),
                ("fechaTrillado", "2025-03-01"),
            ]),
        )
        .unwrap();
        assert_eq!(normalized["cantidadTrillada"], "300 kg");
    }
}
