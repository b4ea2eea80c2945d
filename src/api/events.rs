//! Lifecycle event ingestion endpoints.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::ingestion::{IngestOutcome, IngestReceipt};
use crate::models::EventType;

pub async fn execution_reported(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    ingest(&state, EventType::ExecutionReported, &body).await
}

pub async fn position_closed(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    ingest(&state, EventType::PositionClosed, &body).await
}

pub async fn economics_reconciled(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    ingest(&state, EventType::EconomicsReconciled, &body).await
}

/// Unparseable bodies are still receipted; they fail validation as a
/// non-object payload.
fn raw_payload(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

async fn ingest(state: &AppState, event_type: EventType, body: &[u8]) -> Result<Response, ApiError> {
    let outcome = state.gateway.ingest(event_type, raw_payload(body)).await?;
    Ok(outcome_response(outcome))
}

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Accepted { result, .. } => (StatusCode::OK, Json(result)).into_response(),
        IngestOutcome::Duplicate {
            first_seen_at,
            previous_result,
            payload_mismatch,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "duplicate",
                "first_seen_at": first_seen_at,
                "previous_result": previous_result,
                "payload_mismatch": payload_mismatch,
            })),
        )
            .into_response(),
        IngestOutcome::Pending {
            first_seen_at,
            payload_mismatch,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "pending",
                "first_seen_at": first_seen_at,
                "payload_mismatch": payload_mismatch,
            })),
        )
            .into_response(),
        IngestOutcome::Rejected { errors } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "status": "rejected",
                "errors": errors,
            })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct ReceiptQuery {
    limit: Option<usize>,
}

pub async fn list_receipts(
    State(state): State<AppState>,
    Query(params): Query<ReceiptQuery>,
) -> Result<Json<Vec<IngestReceipt>>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    Ok(Json(state.gateway.receipts(limit).await?))
}
