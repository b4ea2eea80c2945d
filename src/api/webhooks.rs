use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::webhooks::Webhook;

#[derive(Deserialize)]
pub struct RegisterWebhook {
    url: String,
    #[serde(default)]
    events: Vec<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterWebhook>,
) -> Result<(StatusCode, Json<Webhook>), ApiError> {
    let hook = state.webhooks.register(&req.url, req.events).await?;
    Ok((StatusCode::CREATED, Json(hook)))
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Webhook>> {
    Json(state.webhooks.list())
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.webhooks.remove(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("webhook {id} not found")))
    }
}
