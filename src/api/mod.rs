//! HTTP surface.

pub mod audit;
pub mod error;
pub mod events;
pub mod risk;
pub mod webhooks;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::Serialize;

use crate::hash_chain::ChainLedger;
use crate::idempotency::IdempotencyStore;
use crate::ingestion::IngestionGateway;
use crate::shadow_ledger::ShadowLedger;
use crate::storage::LedgerDb;
use crate::webhooks::WebhookRegistry;

pub use error::ApiError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: LedgerDb,
    pub gateway: IngestionGateway,
    pub chain: ChainLedger,
    pub shadow: ShadowLedger,
    pub idempotency: IdempotencyStore,
    pub webhooks: WebhookRegistry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/events/execution-reported", post(events::execution_reported))
        .route("/api/events/position-closed", post(events::position_closed))
        .route("/api/events/economics-reconciled", post(events::economics_reconciled))
        .route("/api/receipts", get(events::list_receipts))
        .route("/api/risk/decisions", post(risk::create_decision))
        .route("/api/exposure/:client_id", get(risk::client_positions))
        .route("/api/exposure/:client_id/summary", get(risk::client_summary))
        .route("/api/exposure/:client_id/limits", put(risk::set_client_limits))
        // Checks that halt the partition on failure are POST, not GET
        .route("/api/exposure/:client_id/consistency", post(risk::client_consistency))
        .route(
            "/api/idempotency/:source/:event_type/:event_id",
            get(audit::idempotency_record),
        )
        .route("/api/chain/:stream/partitions", get(audit::list_partitions))
        .route("/api/chain/:stream/:partition", get(audit::partition_entries))
        .route("/api/chain/:stream/:partition/verify", post(audit::verify_partition))
        .route("/api/webhooks", post(webhooks::register).get(webhooks::list))
        .route("/api/webhooks/:id", delete(webhooks::remove))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, code, database) = match state.db.ping().await {
        Ok(()) => ("healthy", StatusCode::OK, "ok"),
        Err(_) => ("degraded", StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
        }),
    )
}
