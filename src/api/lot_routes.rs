//! Lot and stage endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::error::TraceError;
use crate::lot_id::LotId;
use crate::orchestrator::{LotTrace, SubmitOutcome};
use crate::schema::{FieldMap, StageKind, LOT_SCHEMA};

type ApiResponse = (StatusCode, Json<JsonValue>);

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct LotsQuery {
    /// Return just this lot (the back-office lookup box).
    pub lot: Option<String>,
    /// Free-text filter over ids and field values.
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FieldsRequest {
    #[serde(default)]
    pub fields: FieldMap,
}

// ============================================================================
// Error Mapping
// ============================================================================

/// HTTP status for a caller-facing error.
pub fn status_for(error: &TraceError) -> StatusCode {
    match error {
        TraceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TraceError::NotFound(_) => StatusCode::NOT_FOUND,
        TraceError::InvalidStageKind(_) => StatusCode::BAD_REQUEST,
        TraceError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        TraceError::EstimationFailed(_) | TraceError::WriteRejected(_) => StatusCode::BAD_GATEWAY,
        TraceError::Timeout(_) | TraceError::ConfirmationLost(_) => StatusCode::GATEWAY_TIMEOUT,
        TraceError::LotIdExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: TraceError) -> ApiResponse {
    debug!(code = error.code(), error = %error, "Request failed");
    let mut body = json!({
        "error": error.code(),
        "message": error.to_string(),
        "uncertain": error.is_uncertain(),
    });
    if let TraceError::Validation(details) = &error {
        body["details"] = json!(details);
    }
    (status_for(&error), Json(body))
}

fn parse_lot_id(raw: &str) -> Result<LotId, ApiResponse> {
    LotId::new(raw).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_lot_id", "message": "lot id must not be blank" })),
        )
    })
}

// ============================================================================
// Route Handlers
// ============================================================================

/// GET /api/lots
async fn list_lots(
    State(trace): State<Arc<LotTrace>>,
    Query(query): Query<LotsQuery>,
) -> ApiResponse {
    if let Some(raw) = query.lot.as_deref() {
        return get_lot(State(trace), Path(raw.to_string())).await;
    }
    let result = match query.search.as_deref() {
        Some(text) => trace.search(text).await,
        None => trace.list_aggregates().await,
    };
    match result {
        Ok(lots) => (StatusCode::OK, Json(json!({ "count": lots.len(), "lots": lots }))),
        Err(e) => error_response(e),
    }
}

/// GET /api/lots/:lot_id
async fn get_lot(State(trace): State<Arc<LotTrace>>, Path(lot_id): Path<String>) -> ApiResponse {
    let lot_id = match parse_lot_id(&lot_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match trace.get_aggregate(&lot_id).await {
        Ok(aggregate) => (StatusCode::OK, Json(json!(aggregate))),
        Err(e) => error_response(e),
    }
}

/// POST /api/lots
async fn create_lot(
    State(trace): State<Arc<LotTrace>>,
    Json(req): Json<FieldsRequest>,
) -> ApiResponse {
    match trace.create_lot(&req.fields).await {
        Ok(created) => (StatusCode::CREATED, Json(json!(created))),
        Err(e) => error_response(e),
    }
}

/// POST /api/lots/:lot_id/stages/:stage
async fn submit_stage(
    State(trace): State<Arc<LotTrace>>,
    Path((lot_id, stage)): Path<(String, String)>,
    Json(req): Json<FieldsRequest>,
) -> ApiResponse {
    let lot_id = match parse_lot_id(&lot_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match trace.submit_stage_named(&lot_id, &stage, &req.fields).await {
        Ok(outcome @ SubmitOutcome::Committed(_)) => (StatusCode::OK, Json(json!(outcome))),
        Ok(outcome @ SubmitOutcome::StageSealed { .. }) => {
            (StatusCode::CONFLICT, Json(json!(outcome)))
        }
        Err(e) => error_response(e),
    }
}

/// GET /api/stages
/// Base lot schema plus every stage schema, in pipeline order
async fn list_stages() -> ApiResponse {
    let stages: Vec<JsonValue> = StageKind::ALL
        .into_iter()
        .map(|stage| {
            let mut described = json!(stage.schema().describe());
            described["stage"] = json!(stage);
            described
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({ "lot": LOT_SCHEMA.describe(), "stages": stages })),
    )
}

// ============================================================================
// Router Factory
// ============================================================================

/// Create lot router with all endpoints
pub fn create_lot_router(trace: Arc<LotTrace>) -> Router {
    Router::new()
        .route("/api/lots", get(list_lots).post(create_lot))
        .route("/api/lots/:lot_id", get(get_lot))
        .route("/api/lots/:lot_id/stages/:stage", post(submit_stage))
        .route("/api/stages", get(list_stages))
        .with_state(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceConfig;
    use crate::record::{Lot, LotRecord};
    use crate::store::InMemoryLotStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn seeded_record() -> LotRecord {
        let fields = [
            ("producto", "Café Gourmet Lumora"),
            ("caficultor", "Pedro Perez"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        LotRecord::new(Lot::new(LotId::new("LOT2502417").unwrap(), fields))
    }

    async fn app() -> Router {
        let store = Arc::new(InMemoryLotStore::with_records([seeded_record()]));
        let trace = LotTrace::new(store, TraceConfig::default());
        trace.connect().await.unwrap();
        create_lot_router(Arc::new(trace))
    }

    async fn body_json(resp: axum::response::Response) -> JsonValue {
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .expect("Failed to read response body");
        serde_json::from_slice(&bytes).expect("Failed to parse JSON")
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_by_query_parameter() {
        let resp = app().await.oneshot(get_request("/api/lots?lot=LOT2502417")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["lot_id"], "LOT2502417");
        assert_eq!(json["base"]["origen"], "");
        assert_eq!(json["stages"].as_array().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_unknown_lot_is_404() {
        let resp = app().await.oneshot(get_request("/api/lots/LOT9901000")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_search_filters_listing() {
        let app = app().await;
        let hit = body_json(app.clone().oneshot(get_request("/api/lots?search=pedro")).await.unwrap()).await;
        assert_eq!(hit["count"], 1);
        let miss = body_json(app.oneshot(get_request("/api/lots?search=nadie")).await.unwrap()).await;
        assert_eq!(miss["count"], 0);
    }

    #[tokio::test]
    async fn test_stage_submission_then_conflict() {
        let app = app().await;
        let body = json!({ "fields": {
            "metodoSecado": "sol",
            "humedadFinal": "11%",
            "fechaSecado": "2025-02-20"
        }});
        let first = app
            .clone()
            .oneshot(post_json("/api/lots/LOT2502417/stages/secado", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_json(first).await["outcome"], "committed");

        let second = app
            .oneshot(post_json("/api/lots/LOT2502417/stages/secado", body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(second).await["outcome"], "stage_sealed");
    }

    #[tokio::test]
    async fn test_missing_fields_is_422_with_details() {
        let resp = app()
            .await
            .oneshot(post_json(
                "/api/lots/LOT2502417/stages/trillado",
                json!({ "fields": { "fechaTrillado": "2025-03-01", "cantidadTrillada": "" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert_eq!(json["details"]["kind"], "missing_fields");
        assert_eq!(json["details"]["fields"][0], "cantidadTrillada");
    }

    #[tokio::test]
    async fn test_unknown_stage_is_400() {
        let resp = app()
            .await
            .oneshot(post_json("/api/lots/LOT2502417/stages/tostado", json!({ "fields": {} })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_lot_returns_created() {
        let fields = json!({
            "producto": "Café Gourmet Lumora",
            "caficultor": "Ana Gómez",
            "origen": "Nariño",
            "tamanoFinca": "3 ha",
            "variedad": "Castillo",
            "altitud": "1800 msnm",
            "metodoCosecha": "manual",
            "fechaCosecha": "2025-02-14",
            "cantidad": "900 kg"
        });
        let resp = app()
            .await
            .oneshot(post_json("/api/lots", json!({ "fields": fields })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert!(json["lot_id"].as_str().unwrap().starts_with("LOT"));
        assert!(json["receipt"]["tx_hash"].as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_stage_catalogue() {
        let json = body_json(app().await.oneshot(get_request("/api/stages")).await.unwrap()).await;
        let stages = json["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 9);
        assert_eq!(stages[0]["stage"], "cosecha");
        assert_eq!(stages[5]["stage"], "clasificacionGrano");
        assert_eq!(json["lot"]["required_fields"].as_array().unwrap().len(), 9);
    }

    #[test]
    fn test_uncertain_outcomes_map_to_gateway_errors() {
        use std::time::Duration;
        assert_eq!(
            status_for(&TraceError::Timeout(Duration::from_secs(60))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&TraceError::ConfirmationLost("node dropped".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&TraceError::WriteRejected("nonce too low".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&TraceError::Connection("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
