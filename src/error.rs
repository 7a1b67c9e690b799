//! Error taxonomy for the lot pipeline
//!
//! Three layers, each `thiserror`-derived:
//!
//! ```text
//! ValidationError → recovered locally, never reaches the store
//! StoreError      → raised by a LotStore backend or the StoreClient
//! TraceError      → what callers of LotTrace see
//! ```
//!
//! A write against a sealed stage is not an error; it comes back as
//! `SubmitOutcome::StageSealed`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lot_id::LotId;

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Field-completeness failures reported before any store contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    /// Required fields that were absent or blank, in schema order.
    #[error("Missing required fields: {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },

    /// Submitted keys that match no field of the target schema.
    #[error("Unknown fields: {}", fields.join(", "))]
    UnknownFields { fields: Vec<String> },

    /// Fields given under both store key and English name with different values.
    #[error("Conflicting values for fields: {}", fields.join(", "))]
    ConflictingFields { fields: Vec<String> },
}

impl ValidationError {
    pub fn missing(&self) -> &[String] {
        match self {
            Self::MissingFields { fields } => fields,
            Self::UnknownFields { .. } | Self::ConflictingFields { .. } => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors raised at the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No connection has been established with the backing ledger.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lot not found: {0}")]
    NotFound(LotId),

    /// Resource estimation failed; nothing was submitted.
    #[error("Cost estimation failed: {0}")]
    EstimationFailed(String),

    /// The ledger refused the write (node rejection, budget exhausted, duplicate seal).
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// Confirmation did not arrive within the bounded wait.
    #[error("Confirmation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The write was submitted but the backend went away before confirming it.
    #[error("Confirmation lost: {0}")]
    ConfirmationLost(String),

    /// Transport-level failure talking to the backend.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend answered with something that could not be decoded.
    #[error("Malformed store response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            StoreError::Malformed(e.to_string())
        } else {
            StoreError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// TraceError
// ---------------------------------------------------------------------------

/// Caller-facing error taxonomy.
#[derive(Debug, Error)]
pub enum TraceError {
    /// No backing store reachable; fatal to all operations until reconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cost estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),

    #[error("Confirmation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Submitted, then the store dropped out while confirming.
    #[error("Confirmation lost: {0}")]
    ConfirmationLost(String),

    #[error("Lot not found: {0}")]
    NotFound(LotId),

    /// Unknown stage name; a programmer error on the caller side.
    #[error("Invalid stage kind: {0}")]
    InvalidStageKind(String),

    /// Every generated lot id collided with an existing lot.
    #[error("Could not generate a free lot id after {attempts} attempts")]
    LotIdExhausted { attempts: u32 },
}

impl TraceError {
    /// True when the write may or may not have landed on the ledger.
    ///
    /// Only the next full refresh can tell.
    pub fn is_uncertain(&self) -> bool {
        matches!(
            self,
            Self::EstimationFailed(_)
                | Self::WriteRejected(_)
                | Self::Timeout(_)
                | Self::ConfirmationLost(_)
        )
    }

    /// Short machine-readable code, used by the REST surface and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Validation(_) => "validation_error",
            Self::EstimationFailed(_) => "estimation_failed",
            Self::WriteRejected(_) => "write_rejected",
            Self::Timeout(_) => "timeout",
            Self::ConfirmationLost(_) => "confirmation_lost",
            Self::NotFound(_) => "not_found",
            Self::InvalidStageKind(_) => "invalid_stage_kind",
            Self::LotIdExhausted { .. } => "lot_id_exhausted",
        }
    }
}

impl From<StoreError> for TraceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => TraceError::Connection(msg),
            StoreError::Transport(msg) => TraceError::Connection(msg),
            StoreError::NotFound(id) => TraceError::NotFound(id),
            StoreError::EstimationFailed(msg) => TraceError::EstimationFailed(msg),
            StoreError::Rejected(msg) => TraceError::WriteRejected(msg),
            StoreError::Malformed(msg) => {
                TraceError::Connection(format!("malformed store response: {msg}"))
            }
            StoreError::Timeout(after) => TraceError::Timeout(after),
            StoreError::ConfirmationLost(msg) => TraceError::ConfirmationLost(msg),
        }
    }
}

/// Convenience for stage-name parsing failures.
impl From<crate::schema::UnknownStage> for TraceError {
    fn from(e: crate::schema::UnknownStage) -> Self {
        TraceError::InvalidStageKind(e.0)
    }
}

/// Result type for caller-facing operations
pub type Result<T> = std::result::Result<T, TraceError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
