//! Audit views over hash chains and idempotency records. Everything here is
//! read-only except partition verification, which halts on a violation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use super::{ApiError, AppState};
use crate::error::LedgerError;
use crate::hash_chain::PartitionHead;
use crate::idempotency::IdempotencyStatus;
use crate::models::{ChainStream, IdempotencyKey};

fn stream(raw: &str) -> Result<ChainStream, ApiError> {
    ChainStream::from_str(raw).ok_or_else(|| ApiError::NotFound(format!("unknown chain stream {raw}")))
}

pub async fn list_partitions(
    State(state): State<AppState>,
    Path(raw_stream): Path<String>,
) -> Result<Json<Vec<PartitionHead>>, ApiError> {
    Ok(Json(state.chain.partitions(stream(&raw_stream)?).await?))
}

pub async fn partition_entries(
    State(state): State<AppState>,
    Path((raw_stream, partition)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let stream = stream(&raw_stream)?;
    let head = state
        .chain
        .head(stream, &partition)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no {stream} partition {partition}")))?;
    let entries = state.chain.entries(stream, &partition).await?;
    Ok(Json(json!({
        "head": head,
        "count": entries.len(),
        "entries": entries,
    }))
    .into_response())
}

/// `POST /api/chain/:stream/:partition/verify`
///
/// 200 with the report when the partition verifies, 409 naming the first
/// divergent row otherwise. Not a pure read: a violation halts the partition,
/// and automated writes to it fail until an operator releases it.
pub async fn verify_partition(
    State(state): State<AppState>,
    Path((raw_stream, partition)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let stream = stream(&raw_stream)?;
    match state.chain.verify(stream, &partition).await {
        Ok(report) => Ok(Json(json!({ "ok": true, "report": report })).into_response()),
        Err(LedgerError::ChainIntegrityViolation {
            sequence, reason, ..
        }) => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "ok": false,
                "stream": stream,
                "partition": partition,
                "sequence": sequence,
                "reason": reason,
            })),
        )
            .into_response()),
        Err(err) => Err(err.into()),
    }
}

pub async fn idempotency_record(
    State(state): State<AppState>,
    Path((source, event_type, event_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let key = IdempotencyKey::new(source, event_type, event_id);
    let response = match state.idempotency.lookup(&key).await? {
        Some(record) => Json(json!(record)).into_response(),
        None => Json(json!({ "key": key, "status": IdempotencyStatus::New })).into_response(),
    };
    Ok(response)
}
