//! Write Transaction Orchestrator
//!
//! [`LotTrace`] is the caller-facing facade. Every write runs the same
//! linear protocol:
//!
//! ```text
//! precondition ─► validate ─► estimate ─► submit(budget) ─► confirm ─► resync
//!      │              │           │            │               │
//!   StageSealed   Validation  Estimation   WriteRejected    Timeout
//!                                                     ConfirmationLost
//! ```
//!
//! Steps short-circuit on the first failure. Nothing is retried here;
//! resubmitting is always safe because a sealed stage is refused at the
//! first step.
//!
//! The snapshot cache only serves the precondition check. Reads through
//! [`LotTrace::get_aggregate`] and [`LotTrace::list_aggregates`] always go
//! to the store and replace what is cached.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::assembler::assemble_record;
use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::gate;
use crate::lot_id::LotId;
use crate::record::{self, AggregateRecord, Lot};
use crate::schema::{FieldMap, StageKind, LOT_SCHEMA};
use crate::store::{ConnectionHandle, LotStore, Receipt, StoreClient};

/// Source of candidate lot ids.
pub type LotIdGenerator = Arc<dyn Fn() -> LotId + Send + Sync>;

/// Acknowledgement of a confirmed stage write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub lot_id: LotId,
    pub stage: StageKind,
    pub receipt: Receipt,
    /// Fresh aggregate read after confirmation. `None` if that read failed;
    /// the write itself is confirmed either way.
    pub aggregate: Option<AggregateRecord>,
}

/// Result of [`LotTrace::submit_stage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Committed(Ack),
    /// The stage was already sealed; nothing was sent to the store.
    StageSealed { lot_id: LotId, stage: StageKind },
}

impl SubmitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// A lot accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedLot {
    pub lot_id: LotId,
    pub receipt: Receipt,
}

/// Caller-facing traceability API over a lot store.
pub struct LotTrace {
    client: StoreClient,
    config: TraceConfig,
    snapshots: RwLock<HashMap<LotId, AggregateRecord>>,
    generate_id: LotIdGenerator,
}

impl LotTrace {
    pub fn new(backend: Arc<dyn LotStore>, config: TraceConfig) -> Self {
        Self {
            client: StoreClient::new(backend, config.confirm_timeout()),
            config,
            snapshots: RwLock::new(HashMap::new()),
            generate_id: Arc::new(LotId::generate),
        }
    }

    /// Replace the lot id source (deterministic ids in tests and demos).
    pub fn with_id_generator(mut self, generate_id: LotIdGenerator) -> Self {
        self.generate_id = generate_id;
        self
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<ConnectionHandle> {
        Ok(self.client.connect().await?)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fresh aggregate for one lot.
    pub async fn get_aggregate(&self, lot_id: &LotId) -> Result<AggregateRecord> {
        let record = self.client.read_lot(lot_id).await.map_err(|e| {
            debug!(%lot_id, error = %e, "Lot read failed");
            e
        })?;
        let aggregate = assemble_record(&record);
        self.snapshots
            .write()
            .await
            .insert(lot_id.clone(), aggregate.clone());
        Ok(aggregate)
    }

    /// Fresh aggregates for every lot, in store order.
    pub async fn list_aggregates(&self) -> Result<Vec<AggregateRecord>> {
        let records = self.client.list_lots().await?;
        let aggregates: Vec<AggregateRecord> = records.iter().map(assemble_record).collect();

        let mut snapshots = self.snapshots.write().await;
        snapshots.clear();
        for aggregate in &aggregates {
            snapshots.insert(aggregate.lot_id.clone(), aggregate.clone());
        }
        debug!(lots = aggregates.len(), "Listed aggregates");
        Ok(aggregates)
    }

    /// [`list_aggregates`](Self::list_aggregates) filtered by free text.
    pub async fn search(&self, text: &str) -> Result<Vec<AggregateRecord>> {
        Ok(record::search(self.list_aggregates().await?, text))
    }

    /// Stages of a lot that can still be written, from a fresh read.
    pub async fn writable_stages(&self, lot_id: &LotId) -> Result<Vec<StageKind>> {
        let aggregate = self.get_aggregate(lot_id).await?;
        Ok(gate::writable_stages(&aggregate))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Record one stage of a lot.
    pub async fn submit_stage(
        &self,
        lot_id: &LotId,
        stage: StageKind,
        fields: &FieldMap,
    ) -> Result<SubmitOutcome> {
        // 1. Precondition
        let snapshot = self.snapshot(lot_id).await?;
        if !gate::can_write(&snapshot, stage) {
            info!(%lot_id, %stage, "Stage already sealed; nothing submitted");
            return Ok(SubmitOutcome::StageSealed {
                lot_id: lot_id.clone(),
                stage,
            });
        }

        // 2. Validate
        let normalized = gate::validate_stage(stage, fields).map_err(|e| {
            debug!(%lot_id, %stage, error = %e, "Stage submission failed validation");
            e
        })?;

        // 3-5. Estimate, submit, confirm
        let receipt = match self
            .client
            .write_stage(lot_id, stage, normalized, self.config.stage_cost_multiplier)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => return Err(self.write_failed(lot_id, e.into()).await),
        };

        // 6. Resync
        let aggregate = self.resync(lot_id).await;
        if let Some(aggregate) = &aggregate {
            if aggregate.status(stage) != gate::StageStatus::Sealed {
                warn!(%lot_id, %stage, "Confirmed stage not sealed on fresh read");
            }
        }
        info!(%lot_id, %stage, tx_hash = %receipt.tx_hash, "Stage recorded");
        Ok(SubmitOutcome::Committed(Ack {
            lot_id: lot_id.clone(),
            stage,
            receipt,
            aggregate,
        }))
    }

    /// [`submit_stage`](Self::submit_stage) with the stage given by name.
    pub async fn submit_stage_named(
        &self,
        lot_id: &LotId,
        stage: &str,
        fields: &FieldMap,
    ) -> Result<SubmitOutcome> {
        let stage: StageKind = stage.parse()?;
        self.submit_stage(lot_id, stage, fields).await
    }

    /// Register a new lot with its base attributes.
    pub async fn create_lot(&self, base_fields: &FieldMap) -> Result<CreatedLot> {
        let normalized = gate::validate(&LOT_SCHEMA, base_fields)?;
        let lot_id = self.free_lot_id().await?;

        let lot = Lot::new(lot_id.clone(), normalized);
        let receipt = match self
            .client
            .create_lot(lot, self.config.create_cost_multiplier)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => return Err(self.write_failed(&lot_id, e.into()).await),
        };

        self.resync(&lot_id).await;
        info!(%lot_id, tx_hash = %receipt.tx_hash, "Lot created");
        Ok(CreatedLot { lot_id, receipt })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Latest snapshot of a lot: cached if present, else read fresh.
    async fn snapshot(&self, lot_id: &LotId) -> Result<AggregateRecord> {
        if let Some(cached) = self.snapshots.read().await.get(lot_id) {
            return Ok(cached.clone());
        }
        self.get_aggregate(lot_id).await
    }

    /// A candidate id not present in the current lot list.
    async fn free_lot_id(&self) -> Result<LotId> {
        let existing: HashSet<LotId> = self
            .client
            .list_lots()
            .await?
            .into_iter()
            .map(|record| record.lot.lot_id)
            .collect();

        let attempts = self.config.lot_id_attempts;
        for attempt in 1..=attempts {
            let candidate = (self.generate_id)();
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
            debug!(%candidate, attempt, "Generated lot id already in use");
        }
        Err(TraceError::LotIdExhausted { attempts })
    }

    /// Forget what we believed about a lot after an uncertain outcome.
    async fn write_failed(&self, lot_id: &LotId, error: TraceError) -> TraceError {
        if error.is_uncertain() {
            self.snapshots.write().await.remove(lot_id);
            warn!(%lot_id, code = error.code(), error = %error, "Write outcome uncertain; next read decides");
        } else {
            warn!(%lot_id, code = error.code(), error = %error, "Write failed");
        }
        error
    }

    /// Refresh a lot after a confirmed write. A failed read drops the cached
    /// snapshot instead of failing the confirmed write.
    async fn resync(&self, lot_id: &LotId) -> Option<AggregateRecord> {
        match self.get_aggregate(lot_id).await {
            Ok(aggregate) => Some(aggregate),
            Err(e) => {
                warn!(%lot_id, error = %e, "Refresh after confirmed write failed");
                self.snapshots.write().await.remove(lot_id);
                None
            }
        }
    }
}
