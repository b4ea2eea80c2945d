//! BrokerOps Ledger server
//!
//! Lifecycle ingestion gateway, risk decision endpoint and read-only audit
//! views over one SQLite ledger.

use anyhow::{Context, Result};
use axum::{middleware, Router};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brokerops_ledger::{
    api::{self, AppState},
    config::Config,
    emitter::QueuedEmitter,
    hash_chain::ChainLedger,
    idempotency::IdempotencyStore,
    ingestion::{GatewayConfig, IngestionGateway},
    middleware::request_logging,
    policy,
    shadow_ledger::ShadowLedger,
    storage::LedgerDb,
    webhooks::{WebhookDispatcher, WebhookRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env();
    info!("🚀 BrokerOps ledger starting (v{})", env!("CARGO_PKG_VERSION"));

    let db = LedgerDb::open(&config.database_path, config.db_busy_timeout)
        .with_context(|| format!("Failed to open ledger database at {}", config.database_path))?;
    info!("💾 Ledger database: {}", db.path());

    let idempotency = IdempotencyStore::new(db.clone(), config.pending_lease);
    let shadow = ShadowLedger::new(db.clone(), config.default_limits.clone());
    let chain = ChainLedger::new(db.clone());
    let policy = policy::from_config(config.policy_url.as_deref(), config.policy_timeout)
        .context("Failed to build policy client")?;

    let webhooks = WebhookRegistry::load(db.clone())
        .await
        .context("Failed to load webhook registry")?;
    info!("🔗 {} webhook(s) registered", webhooks.list().len());

    let (emitter, emit_rx) = QueuedEmitter::new(config.emit_queue_capacity);
    let dispatcher = WebhookDispatcher::new(
        webhooks.clone(),
        db.clone(),
        config.emit_timeout,
        config.redelivery_max_attempts,
    )
    .context("Failed to build webhook dispatcher")?;
    let _dispatch_task = dispatcher.clone().spawn(emit_rx);
    let _redelivery_task = dispatcher.spawn_redelivery(config.redelivery_poll);

    let gateway = IngestionGateway::new(
        db.clone(),
        idempotency.clone(),
        shadow.clone(),
        policy,
        Arc::new(emitter),
        GatewayConfig {
            duplicate_wait: config.duplicate_wait,
        },
    );

    let state = AppState {
        db,
        gateway,
        chain,
        shadow,
        idempotency,
        webhooks,
    };

    let app: Router = api::router(state)
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("👋 BrokerOps ledger stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brokerops_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
