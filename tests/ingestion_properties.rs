//! End-to-end properties of the ingestion core: dedup, chain integrity and
//! shadow ledger consistency, driven through the public gateway API.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::Receiver;

use brokerops_ledger::{
    emitter::{EmittedEvent, QueuedEmitter},
    hash_chain::ChainLedger,
    idempotency::{IdempotencyStatus, IdempotencyStore},
    ingestion::{GatewayConfig, IngestOutcome, IngestionGateway},
    models::{ChainStream, EventType, IdempotencyKey},
    policy::{PolicyDecision, PolicyEngine, PolicyRequest},
    shadow_ledger::{replay, ExposureLimits, ShadowLedger},
    storage::LedgerDb,
    LedgerError, LedgerResult,
};

struct AllowAll;

#[async_trait::async_trait]
impl PolicyEngine for AllowAll {
    async fn evaluate(&self, _request: &PolicyRequest<'_>) -> LedgerResult<PolicyDecision> {
        Ok(PolicyDecision {
            allow: true,
            reason_code: "OK".into(),
            rule_id: "allow-all".into(),
            policy_version: "test".into(),
        })
    }
}

struct Harness {
    db: LedgerDb,
    gateway: IngestionGateway,
    shadow: ShadowLedger,
    chain: ChainLedger,
    idempotency: IdempotencyStore,
    _events: Receiver<EmittedEvent>,
}

fn harness(db: LedgerDb) -> Harness {
    let (emitter, events) = QueuedEmitter::new(1024);
    let shadow = ShadowLedger::new(
        db.clone(),
        ExposureLimits {
            max_gross_exposure: dec!(1000000),
            max_net_exposure: dec!(500000),
        },
    );
    let idempotency = IdempotencyStore::new(db.clone(), Duration::from_secs(30));
    let gateway = IngestionGateway::new(
        db.clone(),
        idempotency.clone(),
        shadow.clone(),
        Arc::new(AllowAll),
        Arc::new(emitter),
        GatewayConfig {
            duplicate_wait: Duration::from_secs(2),
        },
    );
    Harness {
        chain: ChainLedger::new(db.clone()),
        db,
        gateway,
        shadow,
        idempotency,
        _events: events,
    }
}

fn execution(exec_id: &str, side: &str, qty: &str, price: &str) -> Value {
    json!({
        "source_system": "oms",
        "exec_id": exec_id,
        "decision_token": format!("dt-{exec_id}"),
        "trace_id": "trace-1",
        "client_id": "C1",
        "symbol": "X",
        "side": side,
        "qty": qty,
        "price": price,
        "executed_at": "2026-03-02T14:30:00Z"
    })
}

fn close(close_id: &str, qty: &str) -> Value {
    json!({
        "source_system": "oms",
        "close_id": close_id,
        "decision_token": format!("dt-{close_id}"),
        "trace_id": "trace-1",
        "client_id": "C1",
        "symbol": "X",
        "side": "SELL",
        "qty": qty,
        "price": "52",
        "closed_at": "2026-03-02T15:00:00Z",
        "realized_pnl": "10.5"
    })
}

#[tokio::test]
async fn same_key_n_times_writes_once() {
    let h = harness(LedgerDb::open_in_memory().unwrap());
    let payload = execution("E-100", "BUY", "10", "20");

    let mut accepted = Vec::new();
    let mut duplicates = Vec::new();
    for _ in 0..5 {
        match h
            .gateway
            .ingest(EventType::ExecutionReported, payload.clone())
            .await
            .unwrap()
        {
            IngestOutcome::Accepted { result, .. } => accepted.push(result),
            IngestOutcome::Duplicate {
                previous_result,
                payload_mismatch,
                ..
            } => {
                assert!(!payload_mismatch);
                duplicates.push(previous_result);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(accepted.len(), 1);
    assert_eq!(duplicates.len(), 4);
    assert!(duplicates.iter().all(|d| d == &accepted[0]));

    let audit = h.chain.entries(ChainStream::Audit, "trace-1").await.unwrap();
    assert_eq!(audit.len(), 1);
    let exposure = h.chain.entries(ChainStream::Exposure, "C1").await.unwrap();
    assert_eq!(exposure.len(), 1);

    let key = IdempotencyKey::new("oms", "execution.reported", "E-100");
    assert_eq!(
        h.idempotency.status(&key).await.unwrap(),
        IdempotencyStatus::Success
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_conflicting_payloads_process_once() {
    let h = harness(LedgerDb::open_in_memory().unwrap());
    let a = execution("E-200", "BUY", "10", "20");
    let b = execution("E-200", "BUY", "11", "20");

    let (ra, rb) = tokio::join!(
        h.gateway.ingest(EventType::ExecutionReported, a),
        h.gateway.ingest(EventType::ExecutionReported, b),
    );
    let outcomes = [ra.unwrap(), rb.unwrap()];

    let accepted = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Accepted { .. }))
        .count();
    assert_eq!(accepted, 1);
    assert!(outcomes.iter().any(|o| matches!(
        o,
        IngestOutcome::Duplicate {
            payload_mismatch: true,
            ..
        }
    )));

    let exposure = h.chain.entries(ChainStream::Exposure, "C1").await.unwrap();
    assert_eq!(exposure.len(), 1);
}

#[tokio::test]
async fn authorize_then_fill_moves_pending_to_realized() {
    let h = harness(LedgerDb::open_in_memory().unwrap());
    let decision = h
        .gateway
        .decide(&json!({
            "client_id": "C1",
            "symbol": "X",
            "side": "BUY",
            "qty": 100,
            "price": 50
        }))
        .await
        .unwrap();
    assert!(decision.decision.allow);

    let pending = h.shadow.position("C1", "X").await.unwrap().unwrap();
    assert_eq!(pending.position.pending_exposure, dec!(5000));

    let mut fill = execution("E-300", "BUY", "100", "51");
    fill["decision_token"] = json!(decision.decision_token);
    h.gateway
        .ingest(EventType::ExecutionReported, fill)
        .await
        .unwrap();

    let entry = h.shadow.position("C1", "X").await.unwrap().unwrap();
    assert_eq!(entry.position.pending_exposure, Decimal::ZERO);
    assert_eq!(entry.position.gross_exposure, dec!(5100));
    assert_eq!(entry.position.net_exposure, dec!(5100));
}

#[tokio::test]
async fn live_rows_equal_chain_replay() {
    let h = harness(LedgerDb::open_in_memory().unwrap());
    let script = [
        (EventType::ExecutionReported, execution("E-1", "BUY", "100", "50")),
        (EventType::ExecutionReported, execution("E-2", "BUY", "20", "49.5")),
        (EventType::ExecutionReported, execution("E-3", "SELL", "30", "51.25")),
        (EventType::PositionClosed, close("K-1", "40")),
        (EventType::ExecutionReported, execution("E-4", "SELL", "100", "52")),
        (EventType::PositionClosed, close("K-2", "500")),
    ];
    for (event_type, payload) in script {
        let outcome = h.gateway.ingest(event_type, payload).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    h.shadow.check_consistency("C1").await.unwrap();

    let entries = h.chain.entries(ChainStream::Exposure, "C1").await.unwrap();
    let replayed = replay(&entries).unwrap();
    let live = h.shadow.position("C1", "X").await.unwrap().unwrap();
    assert_eq!(replayed["X"], live.position);
    assert!(live.position.holds_invariant());

    // Every recorded step kept gross >= |net|
    for entry in &entries {
        let after = &entry.fields["exposure_after"];
        let gross: Decimal = after["gross_exposure"].as_str().unwrap().parse().unwrap();
        let net: Decimal = after["net_exposure"].as_str().unwrap().parse().unwrap();
        assert!(gross >= net.abs(), "row {} broke the invariant", entry.sequence);
    }
}

#[tokio::test]
async fn tampered_audit_row_halts_partition() {
    let h = harness(LedgerDb::open_in_memory().unwrap());
    for id in ["E-1", "E-2", "E-3"] {
        h.gateway
            .ingest(EventType::ExecutionReported, execution(id, "BUY", "1", "10"))
            .await
            .unwrap();
    }
    {
        let conn = h.db.lock().await;
        conn.execute_batch("DROP TRIGGER audit_events_no_update").unwrap();
        conn.execute(
            "UPDATE audit_events SET fields_json = replace(fields_json, '\"qty\":\"1\"', '\"qty\":\"9\"')
             WHERE partition_key = 'trace-1' AND sequence = 2",
            [],
        )
        .unwrap();
    }

    match h.chain.verify(ChainStream::Audit, "trace-1").await {
        Err(LedgerError::ChainIntegrityViolation { sequence, .. }) => assert_eq!(sequence, 2),
        other => panic!("expected violation at row 2, got {other:?}"),
    }

    // Automated processing for the partition stops; the key stays retryable
    let err = h
        .gateway
        .ingest(EventType::ExecutionReported, execution("E-4", "BUY", "1", "10"))
        .await
        .unwrap_err();
    assert!(err.is_integrity_failure());
    let key = IdempotencyKey::new("oms", "execution.reported", "E-4");
    assert_eq!(
        h.idempotency.status(&key).await.unwrap(),
        IdempotencyStatus::Failed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_instances_share_one_ledger() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let first = harness(LedgerDb::open(&path, Duration::from_secs(10)).unwrap());
    let second = harness(LedgerDb::open(&path, Duration::from_secs(10)).unwrap());

    let mut tasks = Vec::new();
    for (n, gateway) in [(0, first.gateway.clone()), (1, second.gateway.clone())] {
        tasks.push(tokio::spawn(async move {
            let mut accepted = 0;
            for i in 0..10 {
                // Ids 0..5 are delivered to both instances
                let id = if i < 5 { format!("E-shared-{i}") } else { format!("E-{n}-{i}") };
                let outcome = gateway
                    .ingest(EventType::ExecutionReported, execution(&id, "BUY", "1", "10"))
                    .await
                    .unwrap();
                if matches!(outcome, IngestOutcome::Accepted { .. }) {
                    accepted += 1;
                }
            }
            accepted
        }));
    }
    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }

    // 5 shared ids once each plus 5 unique ids per instance
    assert_eq!(total, 15);
    let report = first.chain.verify(ChainStream::Exposure, "C1").await.unwrap();
    assert_eq!(report.rows, 15);
    second.shadow.check_consistency("C1").await.unwrap();
    let entry = first.shadow.position("C1", "X").await.unwrap().unwrap();
    assert_eq!(entry.position.net_quantity, dec!(15));
}
