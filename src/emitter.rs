//! Emit-event sink.
//!
//! Ingestion hands events to a bounded queue and moves on; delivery happens
//! on a separate worker (see `webhooks::WebhookDispatcher`). A full or closed
//! queue is a `DeliveryFailure`, never a reason to undo a committed ledger
//! write: the caller parks the event in the [`Outbox`] after commit and the
//! redelivery sweep fans it out later.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{LedgerError, LedgerResult};
use crate::models::timestamp_text;
use crate::storage::LedgerDb;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub trace_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EmittedEvent {
    pub fn new(event_type: impl Into<String>, trace_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            trace_id: trace_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub trait EventSink: Send + Sync {
    /// Must not block on delivery.
    fn emit(&self, event: EmittedEvent) -> LedgerResult<()>;
}

#[derive(Clone)]
pub struct QueuedEmitter {
    tx: mpsc::Sender<EmittedEvent>,
}

impl QueuedEmitter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EmittedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for QueuedEmitter {
    fn emit(&self, event: EmittedEvent) -> LedgerResult<()> {
        self.tx.try_send(event).map_err(|err| {
            let reason = match &err {
                TrySendError::Full(_) => "emit queue full",
                TrySendError::Closed(_) => "emit queue closed",
            };
            LedgerError::DeliveryFailure {
                target: "emit-queue".to_string(),
                reason: reason.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub event: EmittedEvent,
    pub last_error: String,
}

/// Durable holding area for events the queue refused.
#[derive(Clone)]
pub struct Outbox {
    db: LedgerDb,
}

impl Outbox {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    pub async fn park(&self, event: &EmittedEvent, reason: &str) -> LedgerResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO emit_outbox (event_json, last_error, created_at) VALUES (?1, ?2, ?3)",
            params![
                serde_json::to_string(event)?,
                reason,
                timestamp_text(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest first.
    pub async fn pending(&self, limit: usize) -> LedgerResult<Vec<OutboxEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_json, last_error FROM emit_outbox ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, event_json, last_error)| {
                Ok(OutboxEntry {
                    id,
                    event: serde_json::from_str(&event_json)?,
                    last_error,
                })
            })
            .collect()
    }

    pub async fn remove(&self, id: i64) -> LedgerResult<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM emit_outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn count(&self) -> LedgerResult<i64> {
        let conn = self.db.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM emit_outbox", [], |row| row.get(0))?)
    }
}
