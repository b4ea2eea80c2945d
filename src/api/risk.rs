//! Pre-trade risk decisions and exposure reads.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::error::LedgerError;
use crate::ingestion::RiskDecisionRecord;
use crate::shadow_ledger::{ClientExposureSummary, ExposureLimits, ShadowLedgerEntry};

pub async fn create_decision(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<RiskDecisionRecord>, ApiError> {
    Ok(Json(state.gateway.decide(&body).await?))
}

pub async fn client_positions(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<ShadowLedgerEntry>>, ApiError> {
    Ok(Json(state.shadow.positions(&client_id).await?))
}

pub async fn client_summary(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<ClientExposureSummary>, ApiError> {
    Ok(Json(state.shadow.client_exposure_summary(&client_id).await?))
}

pub async fn set_client_limits(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(limits): Json<ExposureLimits>,
) -> Result<Json<ExposureLimits>, ApiError> {
    state.shadow.set_limits(&client_id, &limits).await?;
    Ok(Json(state.shadow.limits(&client_id).await?))
}

/// `POST /api/exposure/:client_id/consistency`
///
/// 200 when live rows match the chain replay, 409 with the first
/// divergence otherwise. A divergence halts the client's exposure partition.
pub async fn client_consistency(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.shadow.check_consistency(&client_id).await {
        Ok(report) => Ok(Json(json!({ "consistent": true, "report": report })).into_response()),
        Err(err @ (LedgerError::AggregationInconsistency { .. }
        | LedgerError::ChainIntegrityViolation { .. })) => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "consistent": false,
                "error": err.to_string(),
                "partition_halted": true,
            })),
        )
            .into_response()),
        Err(err) => Err(err.into()),
    }
}
