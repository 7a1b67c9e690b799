//! Lot Record Store
//!
//! [`LotStore`] is the seam to whatever ledger persists lots and stage
//! records. Backends implement six primitives; [`StoreClient`] layers the
//! connection contract and the write protocol on top:
//!
//! ```text
//! connect ─► read_lot / list_lots
//!        └─► estimate_cost ─► submit(budget) ─► confirm (bounded wait)
//! ```
//!
//! Backends:
//! - [`memory::InMemoryLotStore`]: deterministic ledger simulation with
//!   fault injection, for tests and demos
//! - [`http::HttpLotStore`]: JSON gateway in front of the real ledger

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lot_id::LotId;
use crate::record::{Lot, LotRecord};
use crate::schema::{FieldMap, StageKind};

pub use http::HttpLotStore;
pub use memory::{CallCounts, InMemoryLotStore, StoreFaults};

/// Established connection to a ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub endpoint: String,
    pub network: String,
    pub connected_at: DateTime<Utc>,
}

/// A write the ledger is asked to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteRequest {
    CreateLot {
        lot: Lot,
    },
    AppendStage {
        lot_id: LotId,
        stage: StageKind,
        fields: FieldMap,
    },
}

impl WriteRequest {
    pub fn lot_id(&self) -> &LotId {
        match self {
            Self::CreateLot { lot } => &lot.lot_id,
            Self::AppendStage { lot_id, .. } => lot_id,
        }
    }

    /// Short label for logs: `create` or the stage key.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateLot { .. } => "create",
            Self::AppendStage { stage, .. } => stage.as_str(),
        }
    }
}

/// A submitted write awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub tx_hash: String,
    pub budget: u64,
}

/// Proof that the ledger durably accepted a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub cost_used: u64,
    pub budget: u64,
}

/// Backend primitives. The orchestrator only ever goes through [`StoreClient`].
#[async_trait]
pub trait LotStore: Send + Sync {
    async fn connect(&self) -> Result<ConnectionHandle, StoreError>;

    /// `Ok(None)` when the lot does not exist.
    async fn read_lot(&self, lot_id: &LotId) -> Result<Option<LotRecord>, StoreError>;

    /// Full current set; no paging at this layer.
    async fn list_lots(&self) -> Result<Vec<LotRecord>, StoreError>;

    /// Resources the write is expected to consume.
    async fn estimate_cost(&self, request: &WriteRequest) -> Result<u64, StoreError>;

    async fn submit(&self, request: &WriteRequest, budget: u64)
        -> Result<PendingWrite, StoreError>;

    /// Resolves once the write is durable. May wait indefinitely;
    /// the client bounds it.
    async fn confirm(&self, pending: &PendingWrite) -> Result<Receipt, StoreError>;
}

/// Budget handed to `submit`: the estimate scaled by `multiplier`, rounded up.
pub fn budget_for(estimate: u64, multiplier: f64) -> u64 {
    let scaled = (estimate as f64 * multiplier.max(1.0)).ceil();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

/// Connection-aware client over a [`LotStore`] backend.
pub struct StoreClient {
    backend: Arc<dyn LotStore>,
    connection: RwLock<Option<ConnectionHandle>>,
    confirm_timeout: Duration,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn LotStore>, confirm_timeout: Duration) -> Self {
        Self {
            backend,
            connection: RwLock::new(None),
            confirm_timeout,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Establish (or re-establish) the backend connection.
    pub async fn connect(&self) -> Result<ConnectionHandle, StoreError> {
        let handle = self.backend.connect().await?;
        info!(endpoint = %handle.endpoint, network = %handle.network, "Connected to lot store");
        *self.connection.write().await = Some(handle.clone());
        Ok(handle)
    }

    pub async fn connection(&self) -> Option<ConnectionHandle> {
        self.connection.read().await.clone()
    }

    async fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connection.read().await.is_some() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "no connection established with the lot store".to_string(),
            ))
        }
    }

    /// Drop the handle when the backend reports itself unreachable.
    async fn observe<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(StoreError::Unavailable(reason)) = &result {
            warn!(%reason, "Lot store became unavailable; connection dropped");
            *self.connection.write().await = None;
        }
        result
    }

    pub async fn read_lot(&self, lot_id: &LotId) -> Result<LotRecord, StoreError> {
        self.ensure_connected().await?;
        let result = self.backend.read_lot(lot_id).await;
        self.observe(result)
            .await?
            .ok_or_else(|| StoreError::NotFound(lot_id.clone()))
    }

    pub async fn list_lots(&self) -> Result<Vec<LotRecord>, StoreError> {
        self.ensure_connected().await?;
        let result = self.backend.list_lots().await;
        self.observe(result).await
    }

    /// Estimate a write. Any backend failure other than unavailability is
    /// reported as [`StoreError::EstimationFailed`].
    pub async fn estimate_cost(&self, request: &WriteRequest) -> Result<u64, StoreError> {
        self.ensure_connected().await?;
        let result = self.backend.estimate_cost(request).await;
        match self.observe(result).await {
            Ok(cost) => Ok(cost),
            Err(StoreError::Unavailable(reason)) => Err(StoreError::Unavailable(reason)),
            Err(StoreError::EstimationFailed(reason)) => Err(StoreError::EstimationFailed(reason)),
            Err(other) => Err(StoreError::EstimationFailed(other.to_string())),
        }
    }

    /// Append a stage record: estimate, submit, confirm.
    pub async fn write_stage(
        &self,
        lot_id: &LotId,
        stage: StageKind,
        fields: FieldMap,
        multiplier: f64,
    ) -> Result<Receipt, StoreError> {
        let request = WriteRequest::AppendStage {
            lot_id: lot_id.clone(),
            stage,
            fields,
        };
        self.write(&request, multiplier).await
    }

    /// Create a lot: estimate, submit, confirm.
    pub async fn create_lot(&self, lot: Lot, multiplier: f64) -> Result<Receipt, StoreError> {
        self.write(&WriteRequest::CreateLot { lot }, multiplier).await
    }

    async fn write(&self, request: &WriteRequest, multiplier: f64) -> Result<Receipt, StoreError> {
        let lot_id = request.lot_id();
        let op = request.label();

        let estimate = self.estimate_cost(request).await?;
        let budget = budget_for(estimate, multiplier);
        debug!(%lot_id, op, estimate, budget, "Cost estimated");

        let submitted = self.backend.submit(request, budget).await;
        let pending = match self.observe(submitted).await {
            Ok(pending) => pending,
            Err(StoreError::Unavailable(reason)) => return Err(StoreError::Unavailable(reason)),
            Err(StoreError::Rejected(reason)) => return Err(StoreError::Rejected(reason)),
            Err(other) => return Err(StoreError::Rejected(other.to_string())),
        };
        debug!(%lot_id, op, tx_hash = %pending.tx_hash, "Write submitted");

        let confirmed =
            match tokio::time::timeout(self.confirm_timeout, self.backend.confirm(&pending)).await {
                Ok(result) => self.observe(result).await,
                Err(_) => {
                    warn!(
                        %lot_id,
                        op,
                        tx_hash = %pending.tx_hash,
                        timeout_ms = self.confirm_timeout.as_millis() as u64,
                        "Confirmation wait timed out; outcome unknown until next refresh"
                    );
                    return Err(StoreError::Timeout(self.confirm_timeout));
                }
            };

        // Past submit the write may already be on the ledger.
        let receipt = match confirmed {
            Ok(receipt) => receipt,
            Err(
                StoreError::Unavailable(reason)
                | StoreError::Transport(reason)
                | StoreError::Malformed(reason),
            ) => {
                warn!(%lot_id, op, tx_hash = %pending.tx_hash, %reason, "Confirmation lost after submit");
                return Err(StoreError::ConfirmationLost(reason));
            }
            Err(StoreError::Timeout(after)) => return Err(StoreError::Timeout(after)),
            Err(StoreError::Rejected(reason)) => return Err(StoreError::Rejected(reason)),
            Err(other) => return Err(StoreError::Rejected(other.to_string())),
        };
        info!(
            %lot_id,
            op,
            tx_hash = %receipt.tx_hash,
            block = receipt.block_number,
            cost_used = receipt.cost_used,
            "Write confirmed"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_for_rounds_up() {
        assert_eq!(budget_for(21_000, 1.0), 21_000);
        assert_eq!(budget_for(21_001, 1.5), 31_502);
        assert_eq!(budget_for(10, 2.0), 20);
    }

    #[test]
    fn test_budget_for_never_shrinks_estimate() {
        assert_eq!(budget_for(500, 0.5), 500);
        assert_eq!(budget_for(u64::MAX, 2.0), u64::MAX);
    }

    #[test]
    fn test_write_request_wire_tag() {
        let request = WriteRequest::AppendStage {
            lot_id: LotId::new("LOT2502417").unwrap(),
            stage: StageKind::Secado,
            fields: FieldMap::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], "append_stage");
        assert_eq!(json["stage"], "secado");
        assert_eq!(request.label(), "secado");
    }

    #[tokio::test]
    async fn test_client_refuses_before_connect() {
        let store = Arc::new(InMemoryLotStore::new());
        let client = StoreClient::new(store.clone(), Duration::from_secs(1));
        let err = client.list_lots().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls().await.list, 0);

        client.connect().await.unwrap();
        assert!(client.list_lots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_drops_connection_when_backend_unreachable() {
        let store = Arc::new(InMemoryLotStore::new());
        let client = StoreClient::new(store.clone(), Duration::from_secs(1));
        client.connect().await.unwrap();

        store
            .set_faults(StoreFaults {
                unreachable: true,
                ..Default::default()
            })
            .await;
        assert!(matches!(
            client.list_lots().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(client.connection().await.is_none());
    }

    /// Delegates to the in-memory ledger but never manages to confirm.
    struct LosesConfirmation(Arc<InMemoryLotStore>);

    #[async_trait]
    impl LotStore for LosesConfirmation {
        async fn connect(&self) -> Result<ConnectionHandle, StoreError> {
            self.0.connect().await
        }
        async fn read_lot(&self, lot_id: &LotId) -> Result<Option<LotRecord>, StoreError> {
            self.0.read_lot(lot_id).await
        }
        async fn list_lots(&self) -> Result<Vec<LotRecord>, StoreError> {
            self.0.list_lots().await
        }
        async fn estimate_cost(&self, request: &WriteRequest) -> Result<u64, StoreError> {
            self.0.estimate_cost(request).await
        }
        async fn submit(
            &self,
            request: &WriteRequest,
            budget: u64,
        ) -> Result<PendingWrite, StoreError> {
            self.0.submit(request, budget).await
        }
        async fn confirm(&self, _pending: &PendingWrite) -> Result<Receipt, StoreError> {
            Err(StoreError::Unavailable("node dropped".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_during_confirm_is_confirmation_lost() {
        let ledger = Arc::new(InMemoryLotStore::new());
        let client = StoreClient::new(
            Arc::new(LosesConfirmation(ledger.clone())),
            Duration::from_secs(1),
        );
        client.connect().await.unwrap();

        let lot_id = LotId::new("LOT2502417").unwrap();
        let err = client
            .create_lot(Lot::new(lot_id.clone(), FieldMap::new()), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConfirmationLost(ref r) if r == "node dropped"));
        assert!(client.connection().await.is_none());
        assert!(ledger.snapshot(&lot_id).await.is_some(), "the write still landed");
    }
}
