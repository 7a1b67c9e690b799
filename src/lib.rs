//! Coffee Trace - append-once lot traceability
//!
//! Tracks coffee lots through nine processing stages, from harvest to social
//! impact. Each stage of each lot is written at most once to a ledger-backed
//! store and is sealed as soon as every required field carries a value.
//!
//! ## Pipeline
//! Every write flows through the same protocol:
//! precondition -> validate -> estimate -> submit -> confirm -> resync
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coffee_trace::{FieldMap, InMemoryLotStore, LotId, LotTrace, StageKind, TraceConfig};
//!
//! # async fn demo() -> coffee_trace::Result<()> {
//! let trace = LotTrace::new(Arc::new(InMemoryLotStore::new()), TraceConfig::default());
//! trace.connect().await?;
//!
//! let lot = LotId::new("LOT2502417").unwrap();
//! let fields: FieldMap = [("metodoSecado", "sol"), ("humedadFinal", "11%"), ("fechaSecado", "2025-02-20")]
//!     .into_iter()
//!     .map(|(k, v)| (k.to_string(), v.to_string()))
//!     .collect();
//! let outcome = trace.submit_stage(&lot, StageKind::Secado, &fields).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Stage schemas and identifiers
pub mod lot_id;
pub mod schema;

// Records, gate and assembly
pub mod assembler;
pub mod gate;
pub mod record;

// Ledger access and the write protocol
pub mod orchestrator;
pub mod store;

pub mod config;

// REST surface
#[cfg(feature = "server")]
pub mod api;

pub use assembler::{assemble, assemble_record};
pub use config::{ConfigLoader, TraceConfig};
pub use error::{Result, StoreError, TraceError, ValidationError};
pub use gate::{can_write, stage_status, validate, validate_stage, writable_stages, StageStatus};
pub use lot_id::LotId;
pub use orchestrator::{Ack, CreatedLot, LotIdGenerator, LotTrace, SubmitOutcome};
pub use record::{search, AggregateRecord, Lot, LotRecord, StageRecord, StageView};
pub use schema::{get_schema, get_schema_by_name, FieldMap, FieldSet, FieldSpec, StageKind, LOT_SCHEMA};
pub use store::{
    ConnectionHandle, HttpLotStore, InMemoryLotStore, LotStore, Receipt, StoreClient, StoreFaults,
};
