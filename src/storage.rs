//! SQLite handle shared by the idempotency store, the hash-chain ledger and the
//! shadow ledger.
//!
//! - WAL journal so audit readers do not block the ingestion writer
//! - Every write path opens `BEGIN IMMEDIATE`, which takes SQLite's writer
//!   lock up front; this is what serializes chain appends across processes
//!   sharing the file
//! - `busy_timeout` bounds how long a writer waits for that lock

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    source_system TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_id TEXT NOT NULL,
    status TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    result_json TEXT,
    attempts INTEGER NOT NULL DEFAULT 1,
    locked_at TEXT,
    completed_at TEXT,
    PRIMARY KEY (source_system, event_type, event_id)
);

CREATE TABLE IF NOT EXISTS ingest_receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    received_at TEXT NOT NULL,
    declared_type TEXT NOT NULL,
    raw_payload TEXT NOT NULL,
    outcome TEXT NOT NULL DEFAULT 'received',
    detail TEXT,
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_ingest_receipts_received
    ON ingest_receipts(received_at DESC);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_key TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    hash_alg TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (partition_key, sequence),
    UNIQUE (partition_key, prev_hash)
);

CREATE TABLE IF NOT EXISTS exposure_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_key TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    hash_alg TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (partition_key, sequence),
    UNIQUE (partition_key, prev_hash)
);

CREATE TRIGGER IF NOT EXISTS audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS exposure_events_no_update
BEFORE UPDATE ON exposure_events
BEGIN
    SELECT RAISE(ABORT, 'exposure_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS exposure_events_no_delete
BEFORE DELETE ON exposure_events
BEGIN
    SELECT RAISE(ABORT, 'exposure_events is append-only');
END;

CREATE TABLE IF NOT EXISTS chain_heads (
    stream TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    last_sequence INTEGER NOT NULL,
    last_hash TEXT NOT NULL,
    halted INTEGER NOT NULL DEFAULT 0,
    halted_reason TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (stream, partition_key)
);

CREATE TABLE IF NOT EXISTS shadow_ledger (
    client_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    net_quantity TEXT NOT NULL,
    avg_cost_basis TEXT NOT NULL,
    gross_exposure TEXT NOT NULL,
    net_exposure TEXT NOT NULL,
    pending_exposure TEXT NOT NULL,
    last_sequence INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (client_id, symbol)
);

CREATE TABLE IF NOT EXISTS client_limits (
    client_id TEXT PRIMARY KEY,
    max_gross_exposure TEXT NOT NULL,
    max_net_exposure TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhooks (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    events_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS failed_deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id TEXT NOT NULL,
    url TEXT NOT NULL,
    event_json TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    last_error TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_attempt_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS emit_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_json TEXT NOT NULL,
    last_error TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Shared connection. Cloning is cheap; all clones serialize on one mutex.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
    path: Arc<str>,
}

impl LedgerDb {
    pub fn open(db_path: &str, busy_timeout: Duration) -> LedgerResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn, db_path, busy_timeout)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:", Duration::from_secs(5))
    }

    fn init(conn: Connection, db_path: &str, busy_timeout: Duration) -> LedgerResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(path = db_path, "ledger database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Arc::from(db_path),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Liveness check for the health endpoint.
    pub async fn ping(&self) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

pub(crate) fn parse_decimal(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> LedgerResult<Decimal> {
    Decimal::from_str(raw).map_err(|_| LedgerError::CorruptValue {
        table,
        column,
        value: raw.to_string(),
    })
}

pub(crate) fn parse_timestamp(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| LedgerError::CorruptValue {
            table,
            column,
            value: raw.to_string(),
        })
}
