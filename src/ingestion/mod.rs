//! Ingestion Gateway
//!
//! Per event: `RECEIVED -> VALIDATED -> RESERVED -> PROCESSING -> SUCCESS | FAILED`,
//! or a terminal `REJECTED` / `DUPLICATE`.
//!
//! PROCESSING is one `BEGIN IMMEDIATE` transaction: audit chain append,
//! shadow ledger fold (executions and closes only) and the idempotency
//! SUCCESS mark commit together or not at all. Emission happens after commit;
//! an event the queue refuses is parked in the emit outbox by a separate
//! write.

pub mod validation;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::emitter::{EmittedEvent, EventSink, Outbox};
use crate::error::{FieldError, LedgerError, LedgerResult};
use crate::hash_chain::{self, AppendReceipt};
use crate::idempotency::{IdempotencyStatus, IdempotencyStore, Reservation};
use crate::models::{
    decimal_text, timestamp_text, ChainStream, EventType, ExposureStep, ExposureStepKind,
    IdempotencyKey, LifecycleEvent,
};
use crate::policy::{evaluate_fail_closed, PolicyDecision, PolicyEngine, PolicyRequest};
use crate::shadow_ledger::{self, ClientExposureSummary, FoldReceipt, ShadowLedger};
use crate::storage::{parse_timestamp, LedgerDb};

pub use validation::{parse_proposal, validate, OrderProposal};

pub const RISK_DECISION_EVENT: &str = "risk.decision";

const POLL_INITIAL: Duration = Duration::from_millis(25);
const POLL_MAX: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a duplicate waits on an in-flight first delivery.
    pub duplicate_wait: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            duplicate_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted {
        event_id: String,
        decision_token: String,
        result: Value,
    },
    Duplicate {
        first_seen_at: DateTime<Utc>,
        previous_result: Value,
        payload_mismatch: bool,
    },
    /// The first delivery is still processing; retry later.
    Pending {
        first_seen_at: DateTime<Utc>,
        payload_mismatch: bool,
    },
    Rejected {
        errors: Vec<FieldError>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskDecisionRecord {
    pub decision_token: String,
    pub trace_id: String,
    pub order: OrderProposal,
    pub decision: PolicyDecision,
    pub exposure: ClientExposureSummary,
    pub audit: AppendReceipt,
    pub authorization: Option<FoldReceipt>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub declared_type: String,
    pub raw_payload: Value,
    pub outcome: String,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct IngestionGateway {
    db: LedgerDb,
    idempotency: IdempotencyStore,
    shadow: ShadowLedger,
    policy: Arc<dyn PolicyEngine>,
    sink: Arc<dyn EventSink>,
    outbox: Outbox,
    config: GatewayConfig,
}

impl IngestionGateway {
    pub fn new(
        db: LedgerDb,
        idempotency: IdempotencyStore,
        shadow: ShadowLedger,
        policy: Arc<dyn PolicyEngine>,
        sink: Arc<dyn EventSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            outbox: Outbox::new(db.clone()),
            db,
            idempotency,
            shadow,
            policy,
            sink,
            config,
        }
    }

    /// Run one inbound lifecycle event through the state machine.
    pub async fn ingest(&self, event_type: EventType, payload: Value) -> LedgerResult<IngestOutcome> {
        let received_at = Utc::now();
        let receipt_id = self.record_receipt(event_type.as_str(), &payload, received_at).await?;

        let event = match validate(event_type, &payload) {
            Ok(event) => event,
            Err(errors) => {
                debug!(event_type = %event_type, errors = errors.len(), "event rejected");
                let detail = serde_json::to_string(&errors).ok();
                self.finish_receipt(receipt_id, "rejected", detail.as_deref()).await;
                return Ok(IngestOutcome::Rejected { errors });
            }
        };

        let key = event.idempotency_key();
        let reservation = match self.reserve_or_wait(&key, &payload).await {
            Ok(r) => r,
            Err(err) => {
                self.finish_receipt(receipt_id, "failed", Some(&err.to_string())).await;
                return Err(err);
            }
        };

        let attempt = match reservation {
            Reservation::Acquired { attempt, payload_mismatch, .. } => {
                if payload_mismatch {
                    warn!(key = %key, "reprocessing a failed key with a different payload");
                }
                attempt
            }
            Reservation::Duplicate {
                first_seen_at,
                previous_result,
                payload_mismatch,
            } => {
                info!(key = %key, payload_mismatch, "duplicate delivery");
                self.finish_receipt(receipt_id, "duplicate", None).await;
                return Ok(IngestOutcome::Duplicate {
                    first_seen_at,
                    previous_result,
                    payload_mismatch,
                });
            }
            Reservation::InFlight {
                first_seen_at,
                payload_mismatch,
            } => {
                self.finish_receipt(receipt_id, "pending", None).await;
                return Ok(IngestOutcome::Pending {
                    first_seen_at,
                    payload_mismatch,
                });
            }
        };

        let written = {
            let mut conn = self.db.lock().await;
            write_event(&mut conn, &event, &key, attempt, received_at)
        };

        let result = match written {
            Ok(result) => result,
            Err(err) => {
                error!(key = %key, error = %err, "event processing failed");
                let failure = json!({ "status": "failed", "error": err.to_string() });
                if let Err(mark_err) = self
                    .idempotency
                    .complete(&key, attempt, IdempotencyStatus::Failed, &failure)
                    .await
                {
                    warn!(key = %key, error = %mark_err, "could not mark idempotency key FAILED");
                }
                self.finish_receipt(receipt_id, "failed", Some(&err.to_string())).await;
                return Err(err);
            }
        };

        self.finish_receipt(receipt_id, "accepted", None).await;
        info!(
            key = %key,
            trace_id = event.trace_id(),
            "✅ event accepted"
        );
        self.emit(EmittedEvent::new(
            event_type.as_str(),
            event.trace_id(),
            json!({
                "event": event.audit_fields(received_at),
                "result": result,
            }),
        ))
        .await;

        Ok(IngestOutcome::Accepted {
            event_id: event.event_id(),
            decision_token: event.decision_token().to_string(),
            result,
        })
    }

    /// Reserve, polling with backoff while another handler holds the key.
    async fn reserve_or_wait(&self, key: &IdempotencyKey, payload: &Value) -> LedgerResult<Reservation> {
        let deadline = Instant::now() + self.config.duplicate_wait;
        let mut backoff = POLL_INITIAL;
        loop {
            let reservation = self.idempotency.reserve(key, payload).await?;
            if !matches!(reservation, Reservation::InFlight { .. }) || Instant::now() >= deadline {
                return Ok(reservation);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }

    /// Pre-trade risk decision. The policy engine is consulted outside the
    /// write transaction; the decision row and the authorization fold commit
    /// together.
    pub async fn decide(&self, payload: &Value) -> LedgerResult<RiskDecisionRecord> {
        let order = parse_proposal(payload).map_err(LedgerError::Validation)?;
        let exposure = self.shadow.client_exposure_summary(&order.client_id).await?;

        let decision = evaluate_fail_closed(
            self.policy.as_ref(),
            &PolicyRequest {
                order: &order,
                exposure: &exposure,
            },
        )
        .await;

        let decision_token = Uuid::new_v4().to_string();
        let trace_id = order.trace_id.clone().unwrap_or_else(|| decision_token.clone());
        let decided_at = Utc::now();

        let fields = json!({
            "decision_token": decision_token,
            "client_id": order.client_id,
            "account_id": order.account_id,
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "qty": decimal_text(&order.qty),
            "price": decimal_text(&order.price),
            "allow": decision.allow,
            "reason_code": decision.reason_code,
            "rule_id": decision.rule_id,
            "policy_version": decision.policy_version,
            "gross_exposure": decimal_text(&exposure.gross_exposure),
            "net_exposure": decimal_text(&exposure.net_exposure),
            "gross_limit_breached": exposure.gross_limit_breached,
            "net_limit_breached": exposure.net_limit_breached,
            "decided_at": timestamp_text(&decided_at),
        });

        let (audit, authorization) = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let audit = hash_chain::append(&tx, ChainStream::Audit, &trace_id, RISK_DECISION_EVENT, &fields)?;
            let authorization = if decision.allow {
                let step = ExposureStep {
                    kind: ExposureStepKind::Authorized,
                    client_id: order.client_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: order.qty,
                    price: order.price,
                };
                Some(shadow_ledger::apply_step(&tx, &step, &decision_token, &decision_token)?)
            } else {
                None
            };
            tx.commit()?;
            (audit, authorization)
        };

        info!(
            client_id = %order.client_id,
            symbol = %order.symbol,
            allow = decision.allow,
            reason = %decision.reason_code,
            decision_token = %decision_token,
            "risk decision recorded"
        );

        let record = RiskDecisionRecord {
            decision_token,
            trace_id,
            order,
            decision,
            exposure,
            audit,
            authorization,
            decided_at,
        };
        self.emit(EmittedEvent::new(
            RISK_DECISION_EVENT,
            record.trace_id.clone(),
            serde_json::to_value(&record)?,
        ))
        .await;
        Ok(record)
    }

    /// Runs after commit. A refused event goes to the outbox; only a failed
    /// outbox write loses it.
    async fn emit(&self, event: EmittedEvent) {
        let Err(err) = self.sink.emit(event.clone()) else {
            return;
        };
        warn!(event_type = %event.event_type, error = %err, "⚠️ emit queue refused event, parking in outbox");
        if let Err(park_err) = self.outbox.park(&event, &err.to_string()).await {
            error!(
                event_type = %event.event_type,
                trace_id = %event.trace_id,
                error = %park_err,
                "🛑 event lost: outbox write failed"
            );
        }
    }

    async fn record_receipt(
        &self,
        declared_type: &str,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO ingest_receipts (received_at, declared_type, raw_payload, outcome)
             VALUES (?1, ?2, ?3, 'received')",
            params![
                timestamp_text(&received_at),
                declared_type,
                serde_json::to_string(payload)?,
            ],
        )
        .map_err(|e| LedgerError::IdempotencyUnavailable(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn finish_receipt(&self, id: i64, outcome: &str, detail: Option<&str>) {
        let conn = self.db.lock().await;
        if let Err(err) = conn.execute(
            "UPDATE ingest_receipts SET outcome = ?1, detail = ?2, updated_at = ?3 WHERE id = ?4",
            params![outcome, detail, timestamp_text(&Utc::now()), id],
        ) {
            warn!(receipt = id, error = %err, "could not update ingest receipt");
        }
    }

    pub async fn receipts(&self, limit: usize) -> LedgerResult<Vec<IngestReceipt>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, received_at, declared_type, raw_payload, outcome, detail
             FROM ingest_receipts ORDER BY id DESC LIMIT ?1",
        )?;
        let raws = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter()
            .map(|(id, received_at, declared_type, raw_payload, outcome, detail)| {
                Ok(IngestReceipt {
                    id,
                    received_at: parse_timestamp("ingest_receipts", "received_at", &received_at)?,
                    declared_type,
                    raw_payload: serde_json::from_str(&raw_payload)?,
                    outcome,
                    detail,
                })
            })
            .collect()
    }
}

/// The PROCESSING step. Everything here commits atomically.
fn write_event(
    conn: &mut Connection,
    event: &LifecycleEvent,
    key: &IdempotencyKey,
    attempt: u32,
    received_at: DateTime<Utc>,
) -> LedgerResult<Value> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let audit = hash_chain::append(
        &tx,
        ChainStream::Audit,
        event.trace_id(),
        event.event_type().as_str(),
        &event.audit_fields(received_at),
    )?;

    let event_id = event.event_id();
    let fold = event
        .exposure_step()
        .map(|step| shadow_ledger::apply_step(&tx, &step, &event_id, event.decision_token()))
        .transpose()?;

    let result = json!({
        "status": "accepted",
        "event_id": event_id,
        "decision_token": event.decision_token(),
        "audit": {
            "partition": audit.partition_key,
            "sequence": audit.sequence,
            "hash": audit.hash,
        },
        "exposure": fold.as_ref().map(|f| json!({
            "client_id": f.client_id,
            "symbol": f.symbol,
            "step": f.step.as_str(),
            "delta": decimal_text(&f.delta),
            "sequence": f.chain.sequence,
            "hash": f.chain.hash,
        })),
    });

    IdempotencyStore::complete_in(&tx, key, attempt, IdempotencyStatus::Success, &result)?;
    tx.commit()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::QueuedEmitter;
    use crate::hash_chain::ChainLedger;
    use crate::policy::UnconfiguredPolicyEngine;
    use crate::shadow_ledger::ExposureLimits;
    use rust_decimal_macros::dec;

    struct AllowAll;

    #[async_trait::async_trait]
    impl PolicyEngine for AllowAll {
        async fn evaluate(&self, _request: &PolicyRequest<'_>) -> LedgerResult<PolicyDecision> {
            Ok(PolicyDecision {
                allow: true,
                reason_code: "OK".into(),
                rule_id: "default".into(),
                policy_version: "test-1".into(),
            })
        }
    }

    fn gateway(
        policy: Arc<dyn PolicyEngine>,
        duplicate_wait: Duration,
    ) -> (IngestionGateway, LedgerDb, tokio::sync::mpsc::Receiver<EmittedEvent>) {
        gateway_with_queue(policy, duplicate_wait, 64)
    }

    fn gateway_with_queue(
        policy: Arc<dyn PolicyEngine>,
        duplicate_wait: Duration,
        queue_capacity: usize,
    ) -> (IngestionGateway, LedgerDb, tokio::sync::mpsc::Receiver<EmittedEvent>) {
        let db = LedgerDb::open_in_memory().unwrap();
        let (emitter, rx) = QueuedEmitter::new(queue_capacity);
        let shadow = ShadowLedger::new(
            db.clone(),
            ExposureLimits {
                max_gross_exposure: dec!(1000000),
                max_net_exposure: dec!(500000),
            },
        );
        let gw = IngestionGateway::new(
            db.clone(),
            IdempotencyStore::new(db.clone(), Duration::from_secs(30)),
            shadow,
            policy,
            Arc::new(emitter),
            GatewayConfig { duplicate_wait },
        );
        (gw, db, rx)
    }

    fn execution(exec_id: &str, qty: u32) -> Value {
        json!({
            "source_system": "oms",
            "exec_id": exec_id,
            "decision_token": "dt-1",
            "trace_id": "trace-1",
            "client_id": "C1",
            "symbol": "X",
            "side": "BUY",
            "qty": qty,
            "price": "51",
            "executed_at": "2026-03-02T14:30:00Z"
        })
    }

    #[tokio::test]
    async fn test_accept_then_duplicate_mirrors_result() {
        let (gw, _db, mut rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let first = gw
            .ingest(EventType::ExecutionReported, execution("E-1", 100))
            .await
            .unwrap();
        let IngestOutcome::Accepted { result, event_id, .. } = first else {
            panic!("expected acceptance");
        };
        assert_eq!(event_id, "E-1");
        assert_eq!(result["exposure"]["delta"], "5100");

        let second = gw
            .ingest(EventType::ExecutionReported, execution("E-1", 100))
            .await
            .unwrap();
        match second {
            IngestOutcome::Duplicate {
                previous_result,
                payload_mismatch,
                ..
            } => {
                assert_eq!(previous_result, result);
                assert!(!payload_mismatch);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        let emitted = rx.recv().await.unwrap();
        assert_eq!(emitted.event_type, "execution.reported");
        assert_eq!(emitted.trace_id, "trace-1");
        // Duplicates are not re-emitted
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_seen() {
        let (gw, _db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let mut bad = execution("E-2", 100);
        bad["side"] = json!("HOLD");
        let outcome = gw.ingest(EventType::ExecutionReported, bad).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Rejected { .. }));

        let key = IdempotencyKey::new("oms", "execution.reported", "E-2");
        assert_eq!(gw.idempotency.status(&key).await.unwrap(), IdempotencyStatus::New);

        let receipts = gw.receipts(10).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].outcome, "rejected");
        assert_eq!(receipts[0].raw_payload["side"], "HOLD");
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_reports_pending() {
        let (gw, _db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(60));
        let key = IdempotencyKey::new("oms", "execution.reported", "E-3");
        gw.idempotency.reserve(&key, &execution("E-3", 1)).await.unwrap();

        let outcome = gw
            .ingest(EventType::ExecutionReported, execution("E-3", 1))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Pending { .. }));
    }

    #[tokio::test]
    async fn test_failed_processing_is_retryable() {
        let (gw, db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let chain = ChainLedger::new(db.clone());
        chain.halt(ChainStream::Audit, "trace-1", "manual review").await.unwrap();

        let err = gw
            .ingest(EventType::ExecutionReported, execution("E-4", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PartitionHalted { .. }));

        let key = IdempotencyKey::new("oms", "execution.reported", "E-4");
        assert_eq!(gw.idempotency.status(&key).await.unwrap(), IdempotencyStatus::Failed);
        // Nothing leaked into the shadow ledger
        assert!(gw.shadow.position("C1", "X").await.unwrap().is_none());

        chain.release(ChainStream::Audit, "trace-1").await.unwrap();
        let retry = gw
            .ingest(EventType::ExecutionReported, execution("E-4", 10))
            .await
            .unwrap();
        assert!(matches!(retry, IngestOutcome::Accepted { .. }));
        let record = gw.idempotency.lookup(&key).await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_overflowing_fold_fails_the_key() {
        let (gw, db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        gw.ingest(EventType::ExecutionReported, execution("E-10", 1))
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE shadow_ledger SET gross_exposure = '79228162514264337593543950335'
                 WHERE client_id = 'C1'",
                [],
            )
            .unwrap();
        }

        let err = gw
            .ingest(EventType::ExecutionReported, execution("E-11", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ArithmeticOverflow { .. }));

        let key = IdempotencyKey::new("oms", "execution.reported", "E-11");
        assert_eq!(gw.idempotency.status(&key).await.unwrap(), IdempotencyStatus::Failed);
        let chain = ChainLedger::new(db.clone());
        assert_eq!(chain.entries(ChainStream::Audit, "trace-1").await.unwrap().len(), 1);
        assert_eq!(chain.entries(ChainStream::Exposure, "C1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_quantity_is_rejected_not_folded() {
        let (gw, _db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let mut huge = execution("E-12", 1);
        huge["qty"] = json!("79228162514264337593543950335");
        huge["price"] = json!("2");
        let outcome = gw.ingest(EventType::ExecutionReported, huge).await.unwrap();
        let IngestOutcome::Rejected { errors } = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(errors[0].field, "qty");
        assert!(gw.shadow.position("C1", "X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refused_emission_lands_in_outbox() {
        let (gw, _db, mut rx) = gateway_with_queue(Arc::new(AllowAll), Duration::from_millis(100), 1);
        for id in ["E-20", "E-21"] {
            let outcome = gw
                .ingest(EventType::ExecutionReported, execution(id, 1))
                .await
                .unwrap();
            assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        }

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.payload["event"]["exec_id"], "E-20");
        let parked = gw.outbox.pending(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].event.event_type, "execution.reported");
        assert_eq!(parked[0].event.payload["event"]["exec_id"], "E-21");
        assert_eq!(parked[0].last_error, "delivery to emit-queue failed: emit queue full");
    }

    #[tokio::test]
    async fn test_unavailable_idempotency_store_fails_closed() {
        let (gw, db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        {
            let conn = db.lock().await;
            conn.execute_batch("DROP TABLE idempotency_keys").unwrap();
        }

        let err = gw
            .ingest(EventType::ExecutionReported, execution("E-30", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyUnavailable(_)));

        let chain = ChainLedger::new(db.clone());
        assert!(chain.partitions(ChainStream::Audit).await.unwrap().is_empty());
        assert!(chain.partitions(ChainStream::Exposure).await.unwrap().is_empty());
        assert!(gw.shadow.position("C1", "X").await.unwrap().is_none());
        let receipts = gw.receipts(1).await.unwrap();
        assert_eq!(receipts[0].outcome, "failed");
    }

    #[tokio::test]
    async fn test_decision_allow_reserves_pending_exposure() {
        let (gw, _db, mut rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let record = gw
            .decide(&json!({
                "client_id": "C1",
                "symbol": "X",
                "side": "BUY",
                "qty": 100,
                "price": 50
            }))
            .await
            .unwrap();
        assert!(record.decision.allow);
        assert_eq!(record.trace_id, record.decision_token);
        let auth = record.authorization.unwrap();
        assert_eq!(auth.after.pending_exposure, dec!(5000));

        let emitted = rx.recv().await.unwrap();
        assert_eq!(emitted.event_type, RISK_DECISION_EVENT);
    }

    #[tokio::test]
    async fn test_decision_fails_closed_without_policy() {
        let (gw, _db, _rx) = gateway(Arc::new(UnconfiguredPolicyEngine), Duration::from_millis(100));
        let record = gw
            .decide(&json!({
                "client_id": "C1",
                "symbol": "X",
                "side": "BUY",
                "qty": 1,
                "price": 1,
                "trace_id": "trace-7"
            }))
            .await
            .unwrap();
        assert!(!record.decision.allow);
        assert!(record.decision.is_fail_closed());
        assert!(record.authorization.is_none());
        assert_eq!(record.audit.partition_key, "trace-7");
        assert!(gw.shadow.position("C1", "X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decision_rejects_bad_proposal() {
        let (gw, _db, _rx) = gateway(Arc::new(AllowAll), Duration::from_millis(100));
        let err = gw.decide(&json!({ "client_id": "C1" })).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
