//! HTTP contract of the ledger API, exercised in-process through the router.

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use brokerops_ledger::{
    api::{self, AppState},
    emitter::QueuedEmitter,
    hash_chain::ChainLedger,
    idempotency::IdempotencyStore,
    ingestion::{GatewayConfig, IngestionGateway},
    policy::UnconfiguredPolicyEngine,
    shadow_ledger::{ExposureLimits, ShadowLedger},
    storage::LedgerDb,
    webhooks::WebhookRegistry,
};

async fn app() -> Router {
    app_with_db().await.0
}

async fn app_with_db() -> (Router, LedgerDb) {
    let db = LedgerDb::open_in_memory().unwrap();
    let idempotency = IdempotencyStore::new(db.clone(), Duration::from_secs(30));
    let shadow = ShadowLedger::new(
        db.clone(),
        ExposureLimits {
            max_gross_exposure: dec!(1000000),
            max_net_exposure: dec!(500000),
        },
    );
    // Receiver dropped: refused emissions go to the outbox, never to the caller
    let (emitter, _rx) = QueuedEmitter::new(16);
    let gateway = IngestionGateway::new(
        db.clone(),
        idempotency.clone(),
        shadow.clone(),
        Arc::new(UnconfiguredPolicyEngine),
        Arc::new(emitter),
        GatewayConfig::default(),
    );
    let webhooks = WebhookRegistry::load(db.clone()).await.unwrap();

    let router = api::router(AppState {
        chain: ChainLedger::new(db.clone()),
        db: db.clone(),
        gateway,
        shadow,
        idempotency,
        webhooks,
    });
    (router, db)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn execution() -> Value {
    json!({
        "source_system": "oms",
        "exec_id": "E-1",
        "decision_token": "dt-1",
        "trace_id": "trace-1",
        "client_id": "C1",
        "symbol": "X",
        "side": "BUY",
        "qty": "100",
        "price": "51",
        "executed_at": "2026-03-02T14:30:00Z"
    })
}

#[tokio::test]
async fn health_reports_database() {
    let app = app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "ok");
}

#[tokio::test]
async fn execution_accepted_then_duplicate() {
    let app = app().await;
    let uri = "/api/events/execution-reported";

    let (status, first) = send(&app, Method::POST, uri, Some(execution())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "accepted");
    assert_eq!(first["exposure"]["delta"], "5100");

    let (status, second) = send(&app, Method::POST, uri, Some(execution())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["payload_mismatch"], false);
    assert_eq!(second["previous_result"], first);

    let mut changed = execution();
    changed["qty"] = json!("99");
    let (status, third) = send(&app, Method::POST, uri, Some(changed)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(third["payload_mismatch"], true);

    let (status, record) = send(&app, Method::GET, "/api/idempotency/oms/execution.reported/E-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "SUCCESS");
    assert_eq!(record["attempts"], 1);
}

#[tokio::test]
async fn invalid_event_is_rejected_and_receipted() {
    let app = app().await;
    let mut bad = execution();
    bad["qty"] = json!("-1");
    bad.as_object_mut().unwrap().remove("symbol");

    let (status, body) = send(&app, Method::POST, "/api/events/execution-reported", Some(bad)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "rejected");
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["field"].as_str())
        .collect();
    assert!(fields.contains(&"qty"));
    assert!(fields.contains(&"symbol"));

    // Never marked seen
    let (_, record) = send(&app, Method::GET, "/api/idempotency/oms/execution.reported/E-1", None).await;
    assert_eq!(record["status"], "NEW");

    let (status, receipts) = send(&app, Method::GET, "/api/receipts?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipts[0]["outcome"], "rejected");
}

#[tokio::test]
async fn unparseable_body_is_rejected() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/events/position-closed")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn chain_views_and_verification() {
    let app = app().await;
    send(&app, Method::POST, "/api/events/execution-reported", Some(execution())).await;

    let (status, partitions) = send(&app, Method::GET, "/api/chain/audit/partitions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(partitions[0]["partition_key"], "trace-1");

    let (status, view) = send(&app, Method::GET, "/api/chain/exposure/C1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["count"], 1);
    assert_eq!(view["entries"][0]["prev_hash"], "genesis");

    let (status, verified) = send(&app, Method::POST, "/api/chain/audit/trace-1/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verified["ok"], true);
    assert_eq!(verified["report"]["rows"], 1);

    let (status, _) = send(&app, Method::GET, "/api/chain/audit/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, "/api/chain/ledger/partitions", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exposure_views() {
    let app = app().await;
    send(&app, Method::POST, "/api/events/execution-reported", Some(execution())).await;

    let (status, positions) = send(&app, Method::GET, "/api/exposure/C1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(positions[0]["symbol"], "X");
    assert_eq!(positions[0]["net_exposure"], "5100");

    let (status, limits) = send(
        &app,
        Method::PUT,
        "/api/exposure/C1/limits",
        Some(json!({ "max_gross_exposure": "1000", "max_net_exposure": "1000" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(limits["max_gross_exposure"], "1000");

    let (status, summary) = send(&app, Method::GET, "/api/exposure/C1/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["gross_limit_breached"], true);

    let (status, consistency) = send(&app, Method::POST, "/api/exposure/C1/consistency", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(consistency["consistent"], true);
}

#[tokio::test]
async fn halting_checks_are_not_plain_reads() {
    let app = app().await;
    send(&app, Method::POST, "/api/events/execution-reported", Some(execution())).await;

    let (status, _) = send(&app, Method::GET, "/api/chain/audit/trace-1/verify", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let (status, _) = send(&app, Method::GET, "/api/exposure/C1/consistency", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn failed_verification_halts_partition() {
    let (app, db) = app_with_db().await;
    send(&app, Method::POST, "/api/events/execution-reported", Some(execution())).await;
    {
        let conn = db.lock().await;
        conn.execute_batch("DROP TRIGGER audit_events_no_update").unwrap();
        conn.execute(
            "UPDATE audit_events SET fields_json = replace(fields_json, '\"qty\":\"100\"', '\"qty\":\"1\"')
             WHERE partition_key = 'trace-1'",
            [],
        )
        .unwrap();
    }

    let (status, body) = send(&app, Method::POST, "/api/chain/audit/trace-1/verify", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["ok"], false);
    assert_eq!(body["sequence"], 1);

    let (_, partitions) = send(&app, Method::GET, "/api/chain/audit/partitions", None).await;
    assert_eq!(partitions[0]["halted"], true);

    let mut next = execution();
    next["exec_id"] = json!("E-2");
    let (status, body) = send(&app, Method::POST, "/api/events/execution-reported", Some(next)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "PARTITION_HALTED");
}

#[tokio::test]
async fn unavailable_idempotency_store_returns_503() {
    let (app, db) = app_with_db().await;
    {
        let conn = db.lock().await;
        conn.execute_batch("DROP TABLE idempotency_keys").unwrap();
    }

    let (status, body) = send(&app, Method::POST, "/api/events/execution-reported", Some(execution())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "IDEMPOTENCY_UNAVAILABLE");

    // Nothing was written past the failed dedup check
    let (_, partitions) = send(&app, Method::GET, "/api/chain/audit/partitions", None).await;
    assert_eq!(partitions, json!([]));
    let (_, partitions) = send(&app, Method::GET, "/api/chain/exposure/partitions", None).await;
    assert_eq!(partitions, json!([]));
    let (_, positions) = send(&app, Method::GET, "/api/exposure/C1", None).await;
    assert_eq!(positions, json!([]));
}

#[tokio::test]
async fn decision_fails_closed_without_policy_service() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/risk/decisions",
        Some(json!({ "client_id": "C1", "symbol": "X", "side": "BUY", "qty": 10, "price": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"]["allow"], false);
    assert_eq!(body["decision"]["reason_code"], "POLICY_SERVICE_UNAVAILABLE");
    assert!(body["authorization"].is_null());

    let (status, _) = send(&app, Method::POST, "/api/risk/decisions", Some(json!({ "symbol": "X" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn webhook_registration_lifecycle() {
    let app = app().await;
    let (status, hook) = send(
        &app,
        Method::POST,
        "/api/webhooks",
        Some(json!({ "url": "http://127.0.0.1:9/hook", "events": ["execution.reported"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = hook["id"].as_str().unwrap().to_string();

    let (_, listed) = send(&app, Method::GET, "/api/webhooks", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::POST, "/api/webhooks", Some(json!({ "url": "ftp://x" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app, Method::DELETE, &format!("/api/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &format!("/api/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
