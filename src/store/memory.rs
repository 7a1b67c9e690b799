//! In-memory ledger simulation.
//!
//! Behaves like the on-chain store from the caller's side: writes are
//! estimated, submitted against a budget and confirmed by hash, a sealed
//! stage cannot be recorded twice, and every primitive can be made to fail.
//! Call counters let tests assert which primitives were touched.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ConnectionHandle, LotStore, PendingWrite, Receipt, WriteRequest};
use crate::error::StoreError;
use crate::gate::{stage_status, StageStatus};
use crate::lot_id::LotId;
use crate::record::LotRecord;

/// Fixed overhead of any write.
const BASE_COST: u64 = 21_000;
/// Cost per byte of submitted key and value text.
const COST_PER_BYTE: u64 = 16;

/// Failure modes the simulated ledger can be switched into.
#[derive(Debug, Clone, Default)]
pub struct StoreFaults {
    /// Every primitive reports the ledger as unreachable.
    pub unreachable: bool,
    /// `estimate_cost` fails with this reason.
    pub fail_estimate: Option<String>,
    /// `submit` refuses with this reason.
    pub reject_submit: Option<String>,
    /// `confirm` waits this long before answering.
    pub confirm_delay: Option<Duration>,
    /// Submitted writes never land and `confirm` never resolves.
    pub drop_submissions: bool,
    /// Accept a second write to an already sealed stage (the later values win).
    pub allow_reseal: bool,
}

/// How often each primitive was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub read: usize,
    pub list: usize,
    pub estimate: usize,
    pub submit: usize,
    pub confirm: usize,
}

impl CallCounts {
    /// Calls on the write path (estimate, submit, confirm).
    pub fn writes(&self) -> usize {
        self.estimate + self.submit + self.confirm
    }

    pub fn total(&self) -> usize {
        self.connect + self.read + self.list + self.writes()
    }
}

#[derive(Default)]
struct Ledger {
    lots: BTreeMap<LotId, LotRecord>,
    receipts: HashMap<String, Receipt>,
    block: u64,
    nonce: u64,
    faults: StoreFaults,
    calls: CallCounts,
}

impl Ledger {
    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.faults.unreachable {
            Err(StoreError::Unavailable("ledger node unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Refuse writes the contract would revert.
    fn preflight(&self, request: &WriteRequest) -> Result<(), StoreError> {
        match request {
            WriteRequest::CreateLot { lot } => {
                if self.lots.contains_key(&lot.lot_id) {
                    return Err(StoreError::Rejected(format!(
                        "lot {} already exists",
                        lot.lot_id
                    )));
                }
            }
            WriteRequest::AppendStage { lot_id, stage, .. } => {
                let record = self
                    .lots
                    .get(lot_id)
                    .ok_or_else(|| StoreError::Rejected(format!("unknown lot {lot_id}")))?;
                let sealed = record
                    .stages
                    .get(stage)
                    .map(|fields| stage_status(stage.schema(), fields) == StageStatus::Sealed)
                    .unwrap_or(false);
                if sealed && !self.faults.allow_reseal {
                    return Err(StoreError::Rejected(format!(
                        "stage {stage} of lot {lot_id} is already recorded"
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, request: &WriteRequest) {
        match request {
            WriteRequest::CreateLot { lot } => {
                self.lots
                    .insert(lot.lot_id.clone(), LotRecord::new(lot.clone()));
            }
            WriteRequest::AppendStage {
                lot_id,
                stage,
                fields,
            } => {
                if let Some(record) = self.lots.get_mut(lot_id) {
                    let slot = record.stages.entry(*stage).or_default();
                    for (key, value) in fields {
                        slot.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// Cost the simulated ledger charges for a write.
pub fn write_cost(request: &WriteRequest) -> u64 {
    let bytes: usize = match request {
        WriteRequest::CreateLot { lot } => {
            lot.lot_id.as_str().len()
                + lot
                    .fields
                    .iter()
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>()
        }
        WriteRequest::AppendStage {
            lot_id,
            stage,
            fields,
        } => {
            lot_id.as_str().len()
                + stage.as_str().len()
                + fields.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
        }
    };
    BASE_COST + COST_PER_BYTE * bytes as u64
}

fn tx_hash(request: &WriteRequest, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    // Serializing plain maps and strings cannot fail.
    if let Ok(payload) = serde_json::to_vec(request) {
        hasher.update(payload);
    }
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Lot store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryLotStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryLotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with existing records.
    pub fn with_records(records: impl IntoIterator<Item = LotRecord>) -> Self {
        let lots = records
            .into_iter()
            .map(|record| (record.lot_id().clone(), record))
            .collect();
        Self {
            ledger: RwLock::new(Ledger {
                lots,
                ..Default::default()
            }),
        }
    }

    /// Insert or replace a record without going through the write path.
    pub async fn seed(&self, record: LotRecord) {
        let mut ledger = self.ledger.write().await;
        ledger.lots.insert(record.lot_id().clone(), record);
    }

    pub async fn set_faults(&self, faults: StoreFaults) {
        self.ledger.write().await.faults = faults;
    }

    pub async fn calls(&self) -> CallCounts {
        self.ledger.read().await.calls
    }

    pub async fn reset_calls(&self) {
        self.ledger.write().await.calls = CallCounts::default();
    }

    /// Current ledger contents for a lot, bypassing counters and faults.
    pub async fn snapshot(&self, lot_id: &LotId) -> Option<LotRecord> {
        self.ledger.read().await.lots.get(lot_id).cloned()
    }
}

#[async_trait]
impl LotStore for InMemoryLotStore {
    async fn connect(&self) -> Result<ConnectionHandle, StoreError> {
        let mut ledger = self.ledger.write().await;
        ledger.calls.connect += 1;
        ledger.check_reachable()?;
        Ok(ConnectionHandle {
            endpoint: "memory://ledger".to_string(),
            network: "in-memory".to_string(),
            connected_at: Utc::now(),
        })
    }

    async fn read_lot(&self, lot_id: &LotId) -> Result<Option<LotRecord>, StoreError> {
        let mut ledger = self.ledger.write().await;
        ledger.calls.read += 1;
        ledger.check_reachable()?;
        Ok(ledger.lots.get(lot_id).cloned())
    }

    async fn list_lots(&self) -> Result<Vec<LotRecord>, StoreError> {
        let mut ledger = self.ledger.write().await;
        ledger.calls.list += 1;
        ledger.check_reachable()?;
        Ok(ledger.lots.values().cloned().collect())
    }

    async fn estimate_cost(&self, request: &WriteRequest) -> Result<u64, StoreError> {
        let mut ledger = self.ledger.write().await;
        ledger.calls.estimate += 1;
        ledger.check_reachable()?;
        if let Some(reason) = &ledger.faults.fail_estimate {
            return Err(StoreError::EstimationFailed(reason.clone()));
        }
        Ok(write_cost(request))
    }

    async fn submit(
        &self,
        request: &WriteRequest,
        budget: u64,
    ) -> Result<PendingWrite, StoreError> {
        let mut ledger = self.ledger.write().await;
        ledger.calls.submit += 1;
        ledger.check_reachable()?;
        if let Some(reason) = &ledger.faults.reject_submit {
            return Err(StoreError::Rejected(reason.clone()));
        }
        let cost = write_cost(request);
        if budget < cost {
            return Err(StoreError::Rejected(format!(
                "budget {budget} below required cost {cost}"
            )));
        }
        ledger.preflight(request)?;

        ledger.nonce += 1;
        let hash = tx_hash(request, ledger.nonce);
        if ledger.faults.drop_submissions {
            debug!(tx_hash = %hash, "Submission accepted and dropped");
            return Ok(PendingWrite {
                tx_hash: hash,
                budget,
            });
        }

        ledger.apply(request);
        ledger.block += 1;
        let receipt = Receipt {
            tx_hash: hash.clone(),
            block_number: ledger.block,
            cost_used: cost,
            budget,
        };
        ledger.receipts.insert(hash.clone(), receipt);
        debug!(tx_hash = %hash, block = ledger.block, "Write mined");
        Ok(PendingWrite {
            tx_hash: hash,
            budget,
        })
    }

    async fn confirm(&self, pending: &PendingWrite) -> Result<Receipt, StoreError> {
        let delay = {
            let mut ledger = self.ledger.write().await;
            ledger.calls.confirm += 1;
            ledger.check_reachable()?;
            ledger.faults.confirm_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let receipt = self.ledger.read().await.receipts.get(&pending.tx_hash).cloned();
        match receipt {
            Some(receipt) => Ok(receipt),
            // Never mined: stays pending for as long as anyone waits.
            None => std::future::pending().await,
        }
    }
}
