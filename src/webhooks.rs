//! Webhook registry and delivery worker.
//!
//! The `webhooks` table is the source of truth; the in-memory list is a
//! read-through cache loaded at start and reloaded after every write.
//! Deliveries are best-effort at-least-once: failures are parked in
//! `failed_deliveries` and retried by a periodic sweep. The same sweep fans
//! out events that never made it onto the emit queue (see `emitter::Outbox`).
//! Rows that use up their attempt budget stay parked for an operator and are
//! listed by `exhausted_deliveries`.

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::emitter::{EmittedEvent, Outbox};
use crate::error::{FieldError, LedgerError, LedgerResult};
use crate::models::timestamp_text;
use crate::storage::{parse_timestamp, LedgerDb};

/// Subscribes to every event type.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub created_at: chrono::DateTime<Utc>,
}

impl Webhook {
    pub fn wants(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == WILDCARD || e == event_type)
    }
}

#[derive(Clone)]
pub struct WebhookRegistry {
    db: LedgerDb,
    cache: Arc<RwLock<Vec<Webhook>>>,
}

impl WebhookRegistry {
    /// Open the registry and warm the cache from storage.
    pub async fn load(db: LedgerDb) -> LedgerResult<Self> {
        let registry = Self {
            db,
            cache: Arc::new(RwLock::new(Vec::new())),
        };
        registry.reload().await?;
        Ok(registry)
    }

    pub async fn reload(&self) -> LedgerResult<()> {
        let hooks = {
            let conn = self.db.lock().await;
            let mut stmt = conn.prepare_cached(
                "SELECT id, url, events_json, created_at FROM webhooks ORDER BY created_at ASC",
            )?;
            let raws = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raws.into_iter()
                .map(|(id, url, events_json, created_at)| {
                    Ok(Webhook {
                        id,
                        url,
                        events: serde_json::from_str(&events_json)?,
                        created_at: parse_timestamp("webhooks", "created_at", &created_at)?,
                    })
                })
                .collect::<LedgerResult<Vec<_>>>()?
        };

        let count = hooks.len();
        *self.cache.write() = hooks;
        debug!(count, "webhook cache reloaded");
        Ok(())
    }

    pub async fn register(&self, url: &str, events: Vec<String>) -> LedgerResult<Webhook> {
        let url = url.trim();
        let mut errors = Vec::new();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(FieldError::new("url", "must be an http(s) URL"));
        }
        if events.is_empty() || events.iter().any(|e| e.trim().is_empty()) {
            errors.push(FieldError::new("events", "must list at least one event type"));
        }
        if !errors.is_empty() {
            return Err(LedgerError::Validation(errors));
        }

        let hook = Webhook {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            events,
            created_at: Utc::now(),
        };
        {
            let conn = self.db.lock().await;
            conn.execute(
                "INSERT INTO webhooks (id, url, events_json, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    hook.id,
                    hook.url,
                    serde_json::to_string(&hook.events)?,
                    timestamp_text(&hook.created_at),
                ],
            )?;
        }
        self.reload().await?;
        info!(id = %hook.id, url = %hook.url, "🔗 webhook registered");
        Ok(hook)
    }

    /// Returns false when no webhook had that id.
    pub async fn remove(&self, id: &str) -> LedgerResult<bool> {
        let removed = {
            let conn = self.db.lock().await;
            conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])?
        };
        self.reload().await?;
        if removed > 0 {
            info!(id, "webhook removed");
        }
        Ok(removed > 0)
    }

    pub fn list(&self) -> Vec<Webhook> {
        self.cache.read().clone()
    }

    pub fn subscribers(&self, event_type: &str) -> Vec<Webhook> {
        self.cache
            .read()
            .iter()
            .filter(|h| h.wants(event_type))
            .cloned()
            .collect()
    }
}

const SWEEP_BATCH: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedeliveryStats {
    /// Outbox events handed to their subscribers this sweep.
    pub outbox_dispatched: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub still_failing: usize,
    /// Rows that used their last attempt this sweep.
    pub exhausted: usize,
}

/// A parked delivery that is no longer retried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedDelivery {
    pub id: i64,
    pub webhook_id: String,
    pub url: String,
    pub event: EmittedEvent,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: chrono::DateTime<Utc>,
    pub last_attempt_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    registry: WebhookRegistry,
    db: LedgerDb,
    outbox: Outbox,
    client: Client,
    max_attempts: u32,
}

impl WebhookDispatcher {
    pub fn new(
        registry: WebhookRegistry,
        db: LedgerDb,
        timeout: Duration,
        max_attempts: u32,
    ) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("brokerops-ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::DeliveryFailure {
                target: "http-client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            registry,
            outbox: Outbox::new(db.clone()),
            db,
            client,
            max_attempts,
        })
    }

    /// Drain the emit queue until every sender is dropped.
    pub fn spawn(self, mut rx: mpsc::Receiver<EmittedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.dispatch(&event).await;
            }
            info!("emit queue closed, webhook dispatcher stopping");
        })
    }

    pub fn spawn_redelivery(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.redeliver_failed().await {
                    Ok(stats) if stats.attempted > 0 || stats.outbox_dispatched > 0 => info!(
                        outbox = stats.outbox_dispatched,
                        attempted = stats.attempted,
                        delivered = stats.delivered,
                        still_failing = stats.still_failing,
                        exhausted = stats.exhausted,
                        "webhook redelivery sweep"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "webhook redelivery sweep failed"),
                }
            }
        })
    }

    /// Fan one event out to its subscribers. Failures are parked, not raised.
    pub async fn dispatch(&self, event: &EmittedEvent) {
        for hook in self.registry.subscribers(&event.event_type) {
            if let Err(err) = self.deliver(&hook.url, event).await {
                warn!(
                    webhook = %hook.id,
                    event_type = %event.event_type,
                    error = %err,
                    "⚠️ webhook delivery failed"
                );
                if let Err(store_err) = self.park(&hook, event, &err.to_string()).await {
                    warn!(error = %store_err, "could not record failed delivery");
                }
            }
        }
    }

    async fn deliver(&self, url: &str, event: &EmittedEvent) -> LedgerResult<()> {
        let failure = |reason: String| LedgerError::DeliveryFailure {
            target: url.to_string(),
            reason,
        };
        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failure(format!("status {}", response.status())));
        }
        debug!(url, event_type = %event.event_type, "webhook delivered");
        Ok(())
    }

    async fn park(&self, hook: &Webhook, event: &EmittedEvent, reason: &str) -> LedgerResult<()> {
        let now = timestamp_text(&Utc::now());
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO failed_deliveries (webhook_id, url, event_json, attempts, last_error, created_at, last_attempt_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
            params![hook.id, hook.url, serde_json::to_string(event)?, reason, now],
        )?;
        Ok(())
    }

    /// Fan out outbox events, then retry parked deliveries that still have
    /// attempts left.
    pub async fn redeliver_failed(&self) -> LedgerResult<RedeliveryStats> {
        let mut stats = RedeliveryStats::default();

        // Per-subscriber failures land in failed_deliveries like any dispatch
        for entry in self.outbox.pending(SWEEP_BATCH).await? {
            self.dispatch(&entry.event).await;
            self.outbox.remove(entry.id).await?;
            stats.outbox_dispatched += 1;
        }

        let pending = {
            let conn = self.db.lock().await;
            let mut stmt = conn.prepare_cached(
                "SELECT id, webhook_id, url, event_json, attempts FROM failed_deliveries
                 WHERE attempts < ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![self.max_attempts, SWEEP_BATCH as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (id, webhook_id, url, event_json, attempts) in pending {
            stats.attempted += 1;
            let event: EmittedEvent = serde_json::from_str(&event_json)?;
            let outcome = self.deliver(&url, &event).await;

            let conn = self.db.lock().await;
            match outcome {
                Ok(()) => {
                    conn.execute("DELETE FROM failed_deliveries WHERE id = ?1", params![id])?;
                    stats.delivered += 1;
                }
                Err(err) => {
                    conn.execute(
                        "UPDATE failed_deliveries
                         SET attempts = attempts + 1, last_error = ?1, last_attempt_at = ?2
                         WHERE id = ?3",
                        params![err.to_string(), timestamp_text(&Utc::now()), id],
                    )?;
                    stats.still_failing += 1;
                    if attempts + 1 >= self.max_attempts {
                        stats.exhausted += 1;
                        warn!(
                            delivery = id,
                            webhook = %webhook_id,
                            event_type = %event.event_type,
                            trace_id = %event.trace_id,
                            attempts = attempts + 1,
                            error = %err,
                            "⚠️ webhook delivery exhausted its attempts, no further retries"
                        );
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Parked deliveries that will not be retried again, oldest first.
    pub async fn exhausted_deliveries(&self) -> LedgerResult<Vec<FailedDelivery>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, webhook_id, url, event_json, attempts, last_error, created_at, last_attempt_at
             FROM failed_deliveries WHERE attempts >= ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![self.max_attempts], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, webhook_id, url, event_json, attempts, last_error, created_at, last_attempt_at)| {
                    Ok(FailedDelivery {
                        id,
                        webhook_id,
                        url,
                        event: serde_json::from_str(&event_json)?,
                        attempts,
                        last_error,
                        created_at: parse_timestamp("failed_deliveries", "created_at", &created_at)?,
                        last_attempt_at: parse_timestamp(
                            "failed_deliveries",
                            "last_attempt_at",
                            &last_attempt_at,
                        )?,
                    })
                },
            )
            .collect()
    }

    pub async fn failed_count(&self) -> LedgerResult<i64> {
        let conn = self.db.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM failed_deliveries", [], |row| row.get(0))?)
    }
}
