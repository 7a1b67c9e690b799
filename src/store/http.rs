//! HTTP ledger gateway client.
//!
//! Talks JSON to a gateway sitting in front of the ledger node:
//!
//! | Primitive       | Request                        |
//! |-----------------|--------------------------------|
//! | `connect`       | `GET  /health`                 |
//! | `read_lot`      | `GET  /lots/{lot_id}`          |
//! | `list_lots`     | `GET  /lots`                   |
//! | `estimate_cost` | `POST /estimate`               |
//! | `submit`        | `POST /transactions`           |
//! | `confirm`       | `GET  /transactions/{hash}` (polled) |

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, trace};

use super::{ConnectionHandle, LotStore, PendingWrite, Receipt, WriteRequest};
use crate::error::StoreError;
use crate::lot_id::LotId;
use crate::record::LotRecord;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    network: String,
}

#[derive(Debug, Deserialize)]
struct EstimateResponse {
    cost: u64,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    request: &'a WriteRequest,
    budget: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

/// State of a submitted transaction as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TxStatus {
    Pending,
    Confirmed { block_number: u64, cost_used: u64 },
    Failed { reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// Lot store backed by the ledger gateway.
pub struct HttpLotStore {
    client: Client,
    base_url: Url,
    poll_interval: Duration,
}

impl HttpLotStore {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(client, base_url, poll_interval)
    }

    /// Use a preconfigured client (proxy, TLS roots, timeouts).
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim())
            .map_err(|e| StoreError::Transport(format!("invalid gateway url {raw}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Transport(format!(
                "gateway url {raw} cannot carry a path"
            )));
        }
        Ok(Self {
            client,
            base_url,
            poll_interval,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Gateway URL for `segments`, each percent-encoded as a single segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Unreachable gateways surface as `Unavailable`; anything else as the
/// generic reqwest mapping.
fn send_error(e: reqwest::Error) -> StoreError {
    if e.is_connect() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::from(e)
    }
}

/// Map a non-success status to a store error, keeping the gateway's message.
async fn status_error(response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    classify(status, message)
}

fn classify(status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            StoreError::Unavailable(message)
        }
        s if s.is_client_error() => StoreError::Rejected(format!("{s}: {message}")),
        s => StoreError::Transport(format!("{s}: {message}")),
    }
}

#[async_trait]
impl LotStore for HttpLotStore {
    async fn connect(&self) -> Result<ConnectionHandle, StoreError> {
        let response = self
            .client
            .get(self.url(&["health"]))
            .send()
            .await
            .map_err(send_error)?;
        if !response.status().is_success() {
            return Err(match status_error(response).await {
                StoreError::Rejected(m) | StoreError::Transport(m) => StoreError::Unavailable(m),
                other => other,
            });
        }
        let health: HealthResponse = response.json().await?;
        Ok(ConnectionHandle {
            endpoint: self.base_url().to_string(),
            network: health.network,
            connected_at: Utc::now(),
        })
    }

    async fn read_lot(&self, lot_id: &LotId) -> Result<Option<LotRecord>, StoreError> {
        let response = self
            .client
            .get(self.url(&["lots", lot_id.as_str()]))
            .send()
            .await
            .map_err(send_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn list_lots(&self) -> Result<Vec<LotRecord>, StoreError> {
        let response = self
            .client
            .get(self.url(&["lots"]))
            .send()
            .await
            .map_err(send_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn estimate_cost(&self, request: &WriteRequest) -> Result<u64, StoreError> {
        let response = self
            .client
            .post(self.url(&["estimate"]))
            .json(request)
            .send()
            .await
            .map_err(send_error)?;
        if !response.status().is_success() {
            return Err(match status_error(response).await {
                StoreError::Unavailable(m) => StoreError::Unavailable(m),
                other => StoreError::EstimationFailed(other.to_string()),
            });
        }
        let estimate: EstimateResponse = response.json().await?;
        Ok(estimate.cost)
    }

    async fn submit(
        &self,
        request: &WriteRequest,
        budget: u64,
    ) -> Result<PendingWrite, StoreError> {
        let response = self
            .client
            .post(self.url(&["transactions"]))
            .json(&SubmitBody { request, budget })
            .send()
            .await
            .map_err(send_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let submitted: SubmitResponse = response.json().await?;
        debug!(tx_hash = %submitted.tx_hash, "Gateway accepted transaction");
        Ok(PendingWrite {
            tx_hash: submitted.tx_hash,
            budget,
        })
    }

    async fn confirm(&self, pending: &PendingWrite) -> Result<Receipt, StoreError> {
        let url = self.url(&["transactions", pending.tx_hash.as_str()]);
        loop {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(send_error)?;
            // Not yet indexed by the gateway counts as pending.
            let status = if response.status() == StatusCode::NOT_FOUND {
                TxStatus::Pending
            } else if response.status().is_success() {
                response.json().await?
            } else {
                return Err(status_error(response).await);
            };

            match status {
                TxStatus::Pending => {
                    trace!(tx_hash = %pending.tx_hash, "Transaction pending");
                    sleep(self.poll_interval).await;
                }
                TxStatus::Confirmed {
                    block_number,
                    cost_used,
                } => {
                    return Ok(Receipt {
                        tx_hash: pending.tx_hash.clone(),
                        block_number,
                        cost_used,
                        budget: pending.budget,
                    })
                }
                TxStatus::Failed { reason } => return Err(StoreError::Rejected(reason)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining_ignores_extra_slashes() {
        let store = HttpLotStore::new("http://ledger:8545/", Duration::from_millis(10)).unwrap();
        assert_eq!(store.base_url(), "http://ledger:8545");
        assert_eq!(store.url(&["lots"]).as_str(), "http://ledger:8545/lots");
        assert_eq!(
            store.url(&["lots", "LOT2502417"]).as_str(),
            "http://ledger:8545/lots/LOT2502417"
        );

        let nested = HttpLotStore::new("http://gw.local/ledger/", Duration::from_millis(10)).unwrap();
        assert_eq!(
            nested.url(&["transactions", "0xabc"]).as_str(),
            "http://gw.local/ledger/transactions/0xabc"
        );
    }

    #[test]
    fn test_legacy_lot_ids_stay_one_path_segment() {
        let store = HttpLotStore::new("http://ledger:8545", Duration::from_millis(10)).unwrap();
        let url = store.url(&["lots", "Lote #001"]);
        assert_eq!(url.path(), "/lots/Lote%20%23001");
        assert_eq!(url.fragment(), None);
        assert_eq!(url.query(), None);

        let slashed = store.url(&["lots", "finca/7?x"]);
        assert_eq!(slashed.path(), "/lots/finca%2F7%3Fx");
    }

    #[test]
    fn test_invalid_gateway_url_is_refused() {
        assert!(matches!(
            HttpLotStore::new("ledger without scheme", Duration::from_millis(10)),
            Err(StoreError::Transport(_))
        ));
        assert!(HttpLotStore::new("mailto:ops@finca.co", Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_tx_status_decoding() {
        let pending: TxStatus = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(pending, TxStatus::Pending);

        let confirmed: TxStatus = serde_json::from_str(
            r#"{"status":"confirmed","block_number":812,"cost_used":23456}"#,
        )
        .unwrap();
        assert_eq!(
            confirmed,
            TxStatus::Confirmed {
                block_number: 812,
                cost_used: 23456
            }
        );

        let failed: TxStatus =
            serde_json::from_str(r#"{"status":"failed","reason":"out of gas"}"#).unwrap();
        assert_eq!(
            failed,
            TxStatus::Failed {
                reason: "out of gas".into()
            }
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "node syncing".into()),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify(StatusCode::CONFLICT, "stage already recorded".into()),
            StoreError::Rejected(_)
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
            StoreError::Transport(_)
        ));
    }

    #[test]
    fn test_submit_body_shape() {
        let request = WriteRequest::AppendStage {
            lot_id: LotId::new("LOT2502417").unwrap(),
            stage: crate::schema::StageKind::Trillado,
            fields: Default::default(),
        };
        let body = serde_json::to_value(SubmitBody {
            request: &request,
            budget: 42_000,
        })
        .unwrap();
        assert_eq!(body["budget"], 42_000);
        assert_eq!(body["request"]["op"], "append_stage");
        assert_eq!(body["request"]["stage"], "trillado");
    }
}

/// The adapter against a stand-in gateway served on a local port.
#[cfg(all(test, feature = "server"))]
mod gateway_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use reqwest::Client;
    use serde_json::{json, Value as JsonValue};

    use super::HttpLotStore;
    use crate::error::StoreError;
    use crate::lot_id::LotId;
    use crate::record::Lot;
    use crate::schema::{FieldMap, StageKind};
    use crate::store::{LotStore, PendingWrite, WriteRequest};

    #[derive(Default)]
    struct Gateway {
        polls: AtomicUsize,
    }

    fn lot_json(lot_id: &str) -> JsonValue {
        json!({
            "lot": { "lot_id": lot_id, "fields": { "producto": "Café Gourmet Lumora" } },
            "stages": { "secado": { "metodoSecado": "sol" } }
        })
    }

    async fn read_lot(Path(lot_id): Path<String>) -> (StatusCode, Json<JsonValue>) {
        if lot_id == "Lote #001" {
            (StatusCode::OK, Json(lot_json(&lot_id)))
        } else {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "no such lot" })))
        }
    }

    async fn submit(Json(body): Json<JsonValue>) -> (StatusCode, Json<JsonValue>) {
        if body["request"]["stage"] == "secado" {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "error": "stage secado of lot LOT2502417 is already recorded" })),
            );
        }
        (StatusCode::OK, Json(json!({ "tx_hash": "0xabc" })))
    }

    /// Unknown first, then pending, then mined.
    async fn tx_status(
        State(gateway): State<Arc<Gateway>>,
        Path(hash): Path<String>,
    ) -> (StatusCode, Json<JsonValue>) {
        if hash == "0xfail" {
            return (
                StatusCode::OK,
                Json(json!({ "status": "failed", "reason": "out of gas" })),
            );
        }
        match gateway.polls.fetch_add(1, Ordering::SeqCst) {
            0 => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown transaction" })),
            ),
            1 => (StatusCode::OK, Json(json!({ "status": "pending" }))),
            _ => (
                StatusCode::OK,
                Json(json!({ "status": "confirmed", "block_number": 7, "cost_used": 21_000 })),
            ),
        }
    }

    fn healthy_gateway(state: Arc<Gateway>) -> Router {
        Router::new()
            .route("/health", get(|| async { Json(json!({ "network": "testnet" })) }))
            .route(
                "/lots",
                get(|| async {
                    Json(json!([
                        lot_json("LOT2502417"),
                        { "lot": { "lot_id": "LOT2502418" }, "stages": { "tostado": {} } }
                    ]))
                }),
            )
            .route("/lots/:lot_id", get(read_lot))
            .route("/estimate", post(|| async { Json(json!({ "cost": 21_000 })) }))
            .route("/transactions", post(submit))
            .route("/transactions/:hash", get(tx_status))
            .with_state(state)
    }

    fn syncing_gateway() -> Router {
        let syncing = || async { (StatusCode::SERVICE_UNAVAILABLE, "node syncing") };
        Router::new()
            .route("/health", get(syncing))
            .route("/lots", get(syncing))
    }

    async fn serve(router: Router) -> HttpLotStore {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        let client = Client::builder().no_proxy().build().unwrap();
        HttpLotStore::with_client(client, format!("http://{addr}"), Duration::from_millis(5))
            .unwrap()
    }

    fn create_request() -> WriteRequest {
        WriteRequest::CreateLot {
            lot: Lot::new(LotId::new("LOT2502417").unwrap(), FieldMap::new()),
        }
    }

    #[tokio::test]
    async fn test_gateway_reads_and_listing() {
        let store = serve(healthy_gateway(Arc::default())).await;

        let handle = store.connect().await.unwrap();
        assert_eq!(handle.network, "testnet");
        assert_eq!(handle.endpoint, store.base_url());

        let legacy = LotId::new("Lote #001").unwrap();
        let record = store.read_lot(&legacy).await.unwrap().expect("legacy lot");
        assert_eq!(record.lot_id(), &legacy);
        assert!(record.stages.contains_key(&StageKind::Secado));

        let missing = LotId::new("LOT0000000").unwrap();
        assert_eq!(store.read_lot(&missing).await.unwrap(), None);

        let lots = store.list_lots().await.unwrap();
        assert_eq!(lots.len(), 2);
        assert!(lots[1].stages.is_empty(), "foreign stage dropped");
    }

    #[tokio::test]
    async fn test_gateway_confirm_polls_until_mined() {
        let gateway = Arc::new(Gateway::default());
        let store = serve(healthy_gateway(gateway.clone())).await;
        let request = create_request();

        assert_eq!(store.estimate_cost(&request).await.unwrap(), 21_000);
        let pending = store.submit(&request, 31_500).await.unwrap();
        assert_eq!(pending.tx_hash, "0xabc");

        let receipt = store.confirm(&pending).await.unwrap();
        assert_eq!(receipt.block_number, 7);
        assert_eq!(receipt.cost_used, 21_000);
        assert_eq!(receipt.budget, 31_500);
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gateway_refusals_are_rejections() {
        let store = serve(healthy_gateway(Arc::default())).await;

        let append = WriteRequest::AppendStage {
            lot_id: LotId::new("LOT2502417").unwrap(),
            stage: StageKind::Secado,
            fields: FieldMap::new(),
        };
        match store.submit(&append, 30_000).await {
            Err(StoreError::Rejected(reason)) => assert!(reason.contains("already recorded")),
            other => panic!("expected a rejection, got {other:?}"),
        }

        let failed = PendingWrite {
            tx_hash: "0xfail".to_string(),
            budget: 30_000,
        };
        match store.confirm(&failed).await {
            Err(StoreError::Rejected(reason)) => assert_eq!(reason, "out of gas"),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_syncing_gateway_is_unavailable() {
        let store = serve(syncing_gateway()).await;
        match store.connect().await {
            Err(StoreError::Unavailable(reason)) => assert_eq!(reason, "node syncing"),
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert!(matches!(
            store.list_lots().await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
