//! Idempotency Store
//!
//! Durable dedup table keyed by `(source_system, event_type, event_id)`.
//! Exactly one caller wins a reservation; everyone else sees the terminal
//! result, or `InFlight` while the winner's lease is live. The first-seen
//! result always wins over a different payload hash for the same key.
//!
//! `payload_hash` is written once, at first sight. Re-acquiring a FAILED key
//! or an expired lease keeps it, so every later delivery is compared against
//! the original payload rather than the most recent retry.
//!
//! Every storage failure here is reported as `IdempotencyUnavailable` so the
//! gateway fails closed instead of skipping dedup.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::hash_chain::canonical_json;
use crate::models::{timestamp_text, IdempotencyKey};
use crate::storage::{parse_timestamp, LedgerDb};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    /// No record exists for the key.
    New,
    Pending,
    Success,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::New => "NEW",
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Success => "SUCCESS",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(IdempotencyStatus::New),
            "PENDING" => Some(IdempotencyStatus::Pending),
            "SUCCESS" => Some(IdempotencyStatus::Success),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IdempotencyStatus::Success | IdempotencyStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub status: IdempotencyStatus,
    pub first_seen_at: DateTime<Utc>,
    pub payload_hash: String,
    pub result: Option<Value>,
    pub attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of [`IdempotencyStore::reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must finish with `complete`.
    Acquired {
        first_seen_at: DateTime<Utc>,
        attempt: u32,
        payload_mismatch: bool,
    },
    /// A SUCCESS result already exists.
    Duplicate {
        first_seen_at: DateTime<Utc>,
        previous_result: Value,
        payload_mismatch: bool,
    },
    /// Another handler holds a live PENDING lease.
    InFlight {
        first_seen_at: DateTime<Utc>,
        payload_mismatch: bool,
    },
}

impl Reservation {
    pub fn should_process(&self) -> bool {
        matches!(self, Reservation::Acquired { .. })
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        match self {
            Reservation::Acquired { first_seen_at, .. }
            | Reservation::Duplicate { first_seen_at, .. }
            | Reservation::InFlight { first_seen_at, .. } => *first_seen_at,
        }
    }

    pub fn previous_result(&self) -> Option<&Value> {
        match self {
            Reservation::Duplicate {
                previous_result, ..
            } => Some(previous_result),
            _ => None,
        }
    }

    pub fn payload_mismatch(&self) -> bool {
        match self {
            Reservation::Acquired {
                payload_mismatch, ..
            }
            | Reservation::Duplicate {
                payload_mismatch, ..
            }
            | Reservation::InFlight {
                payload_mismatch, ..
            } => *payload_mismatch,
        }
    }
}

/// Lowercase hex SHA-256 of the key-sorted payload.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct IdempotencyStore {
    db: LedgerDb,
    lease: Duration,
}

impl IdempotencyStore {
    pub fn new(db: LedgerDb, lease: Duration) -> Self {
        Self { db, lease }
    }

    /// Reserve `key` for processing.
    pub async fn reserve(
        &self,
        key: &IdempotencyKey,
        payload: &Value,
    ) -> LedgerResult<Reservation> {
        let payload_hash = payload_digest(payload);
        // Stored timestamps carry microseconds
        let now = Utc::now().trunc_subsecs(6);
        let now_text = timestamp_text(&now);

        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO idempotency_keys
                 (source_system, event_type, event_id, status, first_seen_at, payload_hash, result_json, attempts, locked_at, completed_at)
                 VALUES (?1, ?2, ?3, 'PENDING', ?4, ?5, NULL, 1, ?4, NULL)",
                params![
                    key.source_system,
                    key.event_type,
                    key.event_id,
                    now_text,
                    payload_hash,
                ],
            )
            .map_err(unavailable)?;

        if inserted == 1 {
            tx.commit().map_err(unavailable)?;
            debug!(key = %key, "idempotency key reserved");
            return Ok(Reservation::Acquired {
                first_seen_at: now,
                attempt: 1,
                payload_mismatch: false,
            });
        }

        let existing = load_record(&tx, key)?.ok_or_else(|| {
            LedgerError::IdempotencyUnavailable(format!("record for {key} vanished mid-reserve"))
        })?;
        let payload_mismatch = existing.payload_hash != payload_hash;
        if payload_mismatch {
            warn!(
                key = %key,
                first_hash = %existing.payload_hash,
                new_hash = %payload_hash,
                "payload differs from first-seen payload for the same idempotency key"
            );
        }

        let lease_expired = existing
            .locked_at
            .map(|locked| {
                let held = now.signed_duration_since(locked);
                held.to_std().map(|h| h >= self.lease).unwrap_or(false)
            })
            .unwrap_or(true);

        let reservation = match existing.status {
            IdempotencyStatus::Success => Reservation::Duplicate {
                first_seen_at: existing.first_seen_at,
                previous_result: existing.result.unwrap_or(Value::Null),
                payload_mismatch,
            },
            IdempotencyStatus::Pending if !lease_expired => Reservation::InFlight {
                first_seen_at: existing.first_seen_at,
                payload_mismatch,
            },
            IdempotencyStatus::Pending | IdempotencyStatus::Failed => {
                // FAILED is retryable; an expired PENDING lease belongs to a dead handler
                let attempt = existing.attempts + 1;
                tx.execute(
                    "UPDATE idempotency_keys
                     SET status = 'PENDING', attempts = ?1, locked_at = ?2,
                         result_json = NULL, completed_at = NULL
                     WHERE source_system = ?3 AND event_type = ?4 AND event_id = ?5",
                    params![
                        attempt,
                        now_text,
                        key.source_system,
                        key.event_type,
                        key.event_id,
                    ],
                )
                .map_err(unavailable)?;
                info!(
                    key = %key,
                    attempt,
                    previous = existing.status.as_str(),
                    "idempotency key re-acquired"
                );
                Reservation::Acquired {
                    first_seen_at: existing.first_seen_at,
                    attempt,
                    payload_mismatch,
                }
            }
            IdempotencyStatus::New => {
                return Err(LedgerError::CorruptValue {
                    table: "idempotency_keys",
                    column: "status",
                    value: "NEW".to_string(),
                });
            }
        };

        tx.commit().map_err(unavailable)?;
        Ok(reservation)
    }

    /// Transition `PENDING -> SUCCESS | FAILED` in its own transaction.
    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        attempt: u32,
        status: IdempotencyStatus,
        result: &Value,
    ) -> LedgerResult<()> {
        let conn = self.db.lock().await;
        Self::complete_in(&conn, key, attempt, status, result)
    }

    /// Same as [`complete`](Self::complete) but inside the caller's
    /// transaction, so a SUCCESS mark commits atomically with the ledger write.
    pub(crate) fn complete_in(
        conn: &Connection,
        key: &IdempotencyKey,
        attempt: u32,
        status: IdempotencyStatus,
        result: &Value,
    ) -> LedgerResult<()> {
        if !status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                key: key.to_string(),
                from: IdempotencyStatus::Pending.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let result_json = serde_json::to_string(result)?;
        let updated = conn
            .execute(
                "UPDATE idempotency_keys
                 SET status = ?1, result_json = ?2, completed_at = ?3, locked_at = NULL
                 WHERE source_system = ?4 AND event_type = ?5 AND event_id = ?6
                   AND status = 'PENDING' AND attempts = ?7",
                params![
                    status.as_str(),
                    result_json,
                    timestamp_text(&Utc::now()),
                    key.source_system,
                    key.event_type,
                    key.event_id,
                    attempt,
                ],
            )
            .map_err(unavailable)?;

        if updated != 1 {
            return Err(LedgerError::LeaseLost {
                key: key.to_string(),
            });
        }
        debug!(key = %key, status = status.as_str(), "idempotency key completed");
        Ok(())
    }

    pub async fn lookup(&self, key: &IdempotencyKey) -> LedgerResult<Option<IdempotencyRecord>> {
        let conn = self.db.lock().await;
        load_record(&conn, key)
    }

    /// `NEW` when the key has never been reserved.
    pub async fn status(&self, key: &IdempotencyKey) -> LedgerResult<IdempotencyStatus> {
        Ok(self
            .lookup(key)
            .await?
            .map(|r| r.status)
            .unwrap_or(IdempotencyStatus::New))
    }
}

fn unavailable(err: rusqlite::Error) -> LedgerError {
    LedgerError::IdempotencyUnavailable(err.to_string())
}

fn load_record(conn: &Connection, key: &IdempotencyKey) -> LedgerResult<Option<IdempotencyRecord>> {
    let raw = conn
        .query_row(
            "SELECT status, first_seen_at, payload_hash, result_json, attempts, locked_at, completed_at
             FROM idempotency_keys
             WHERE source_system = ?1 AND event_type = ?2 AND event_id = ?3",
            params![key.source_system, key.event_type, key.event_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()
        .map_err(unavailable)?;

    let Some((status, first_seen_at, payload_hash, result_json, attempts, locked_at, completed_at)) =
        raw
    else {
        return Ok(None);
    };

    let status = IdempotencyStatus::from_str(&status).ok_or(LedgerError::CorruptValue {
        table: "idempotency_keys",
        column: "status",
        value: status.clone(),
    })?;
    let result = match result_json {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    };

    Ok(Some(IdempotencyRecord {
        key: key.clone(),
        status,
        first_seen_at: parse_timestamp("idempotency_keys", "first_seen_at", &first_seen_at)?,
        payload_hash,
        result,
        attempts,
        locked_at: locked_at
            .as_deref()
            .map(|t| parse_timestamp("idempotency_keys", "locked_at", t))
            .transpose()?,
        completed_at: completed_at
            .as_deref()
            .map(|t| parse_timestamp("idempotency_keys", "completed_at", t))
            .transpose()?,
    }))
}
