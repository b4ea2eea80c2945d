//! Hash-Chain Ledger
//!
//! Append-only audit and exposure rows, linked per partition:
//! `prev_hash` is the hash of the previous row in the same partition (or the
//! literal `"genesis"`), and `hash` is a SHA-256 digest over the row content
//! plus `prev_hash`. Verification walks a partition from genesis and stops at
//! the first row whose stored values disagree with the recomputation.
//!
//! Appends must run inside a `BEGIN IMMEDIATE` transaction. The partition's
//! `chain_heads` row is the latest-hash pointer and is advanced with a
//! compare-and-set on `last_sequence`, so two writers can never both extend
//! the same `prev_hash`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::error::{LedgerError, LedgerResult};
use crate::models::{timestamp_text, ChainStream};
use crate::storage::{parse_timestamp, LedgerDb};

pub const GENESIS_HASH: &str = "genesis";

/// Digest version stored on every row. Bump when the hashed layout changes.
pub const HASH_ALGORITHM: &str = "sha256-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub stream: ChainStream,
    pub partition_key: String,
    pub sequence: i64,
    pub prev_hash: String,
    pub hash: String,
    pub recorded_at: String,
}

/// A stored chain row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub id: i64,
    pub partition_key: String,
    pub sequence: i64,
    pub event_type: String,
    pub fields: Value,
    #[serde(skip)]
    pub fields_json: String,
    pub prev_hash: String,
    pub hash: String,
    pub hash_alg: String,
    pub recorded_at: String,
}

/// Latest-hash pointer for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHead {
    pub stream: ChainStream,
    pub partition_key: String,
    pub last_sequence: i64,
    pub last_hash: String,
    pub halted: bool,
    pub halted_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub stream: ChainStream,
    pub partition_key: String,
    pub rows: usize,
    pub head_hash: String,
    pub verified_at: DateTime<Utc>,
}

/// Deterministic JSON text with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Row digest, lowercase hex. Components are separated by 0x1f so no two
/// distinct rows can concatenate to the same input.
pub fn compute_hash(
    prev_hash: &str,
    partition_key: &str,
    sequence: i64,
    event_type: &str,
    recorded_at: &str,
    canonical_fields: &str,
) -> String {
    let sequence = sequence.to_string();
    let mut hasher = Sha256::new();
    for part in [
        HASH_ALGORITHM,
        prev_hash,
        partition_key,
        sequence.as_str(),
        event_type,
        recorded_at,
        canonical_fields,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Append one row to `stream`/`partition_key`. Caller owns the transaction.
pub(crate) fn append(
    conn: &Connection,
    stream: ChainStream,
    partition_key: &str,
    event_type: &str,
    fields: &Value,
) -> LedgerResult<AppendReceipt> {
    let head = load_head(conn, stream, partition_key)?;
    if let Some(h) = head.as_ref().filter(|h| h.halted) {
        return Err(LedgerError::PartitionHalted {
            stream,
            partition: partition_key.to_string(),
            reason: h.halted_reason.clone().unwrap_or_default(),
        });
    }

    let (prev_hash, sequence) = match &head {
        Some(h) => (h.last_hash.clone(), h.last_sequence + 1),
        None => (GENESIS_HASH.to_string(), 1),
    };
    let recorded_at = timestamp_text(&Utc::now());
    let canonical = canonical_json(fields);
    let hash = compute_hash(
        &prev_hash,
        partition_key,
        sequence,
        event_type,
        &recorded_at,
        &canonical,
    );

    conn.execute(
        &format!(
            "INSERT INTO {} (partition_key, sequence, event_type, fields_json, prev_hash, hash, hash_alg, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            stream.table()
        ),
        params![
            partition_key,
            sequence,
            event_type,
            canonical,
            prev_hash,
            hash,
            HASH_ALGORITHM,
            recorded_at,
        ],
    )?;

    match &head {
        Some(h) => {
            let moved = conn.execute(
                "UPDATE chain_heads SET last_sequence = ?1, last_hash = ?2, updated_at = ?3
                 WHERE stream = ?4 AND partition_key = ?5 AND last_sequence = ?6",
                params![
                    sequence,
                    hash,
                    recorded_at,
                    stream.as_str(),
                    partition_key,
                    h.last_sequence,
                ],
            )?;
            if moved != 1 {
                return Err(LedgerError::ConcurrentAppend {
                    stream,
                    partition: partition_key.to_string(),
                    expected: h.last_sequence,
                });
            }
        }
        None => {
            conn.execute(
                "INSERT INTO chain_heads (stream, partition_key, last_sequence, last_hash, halted, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![stream.as_str(), partition_key, sequence, hash, recorded_at],
            )?;
        }
    }

    debug!(
        stream = stream.as_str(),
        partition = partition_key,
        sequence,
        event_type,
        "chain row appended"
    );

    Ok(AppendReceipt {
        stream,
        partition_key: partition_key.to_string(),
        sequence,
        prev_hash,
        hash,
        recorded_at,
    })
}

pub(crate) fn load_head(
    conn: &Connection,
    stream: ChainStream,
    partition_key: &str,
) -> LedgerResult<Option<PartitionHead>> {
    let raw = conn
        .query_row(
            "SELECT last_sequence, last_hash, halted, halted_reason, updated_at
             FROM chain_heads WHERE stream = ?1 AND partition_key = ?2",
            params![stream.as_str(), partition_key],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((last_sequence, last_hash, halted, halted_reason, updated_at)) = raw else {
        return Ok(None);
    };
    Ok(Some(PartitionHead {
        stream,
        partition_key: partition_key.to_string(),
        last_sequence,
        last_hash,
        halted: halted != 0,
        halted_reason,
        updated_at: parse_timestamp("chain_heads", "updated_at", &updated_at)?,
    }))
}

pub(crate) fn load_entries(
    conn: &Connection,
    stream: ChainStream,
    partition_key: &str,
) -> LedgerResult<Vec<ChainEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id, partition_key, sequence, event_type, fields_json, prev_hash, hash, hash_alg, recorded_at
         FROM {} WHERE partition_key = ?1 ORDER BY sequence ASC, id ASC",
        stream.table()
    ))?;
    let rows = stmt.query_map(params![partition_key], |row| {
        let fields_json: String = row.get(4)?;
        Ok(ChainEntry {
            id: row.get(0)?,
            partition_key: row.get(1)?,
            sequence: row.get(2)?,
            event_type: row.get(3)?,
            fields: serde_json::from_str(&fields_json).unwrap_or(Value::Null),
            fields_json,
            prev_hash: row.get(5)?,
            hash: row.get(6)?,
            hash_alg: row.get(7)?,
            recorded_at: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Mark a partition halted. Creates the head row if the partition has none.
pub(crate) fn halt_partition(
    conn: &Connection,
    stream: ChainStream,
    partition_key: &str,
    reason: &str,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO chain_heads (stream, partition_key, last_sequence, last_hash, halted, halted_reason, updated_at)
         VALUES (?1, ?2, 0, ?3, 1, ?4, ?5)
         ON CONFLICT(stream, partition_key) DO UPDATE SET
            halted = 1,
            halted_reason = excluded.halted_reason,
            updated_at = excluded.updated_at",
        params![
            stream.as_str(),
            partition_key,
            GENESIS_HASH,
            reason,
            timestamp_text(&Utc::now()),
        ],
    )?;
    Ok(())
}

pub(crate) fn clear_halt(
    conn: &Connection,
    stream: ChainStream,
    partition_key: &str,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE chain_heads SET halted = 0, halted_reason = NULL, updated_at = ?1
         WHERE stream = ?2 AND partition_key = ?3",
        params![timestamp_text(&Utc::now()), stream.as_str(), partition_key],
    )?;
    Ok(())
}

/// Walk `entries` from genesis. Returns the first divergent row as a
/// `ChainIntegrityViolation`.
pub fn verify_entries(
    stream: ChainStream,
    partition_key: &str,
    entries: &[ChainEntry],
    head: Option<&PartitionHead>,
) -> LedgerResult<VerificationReport> {
    let violation = |sequence: i64, reason: String| LedgerError::ChainIntegrityViolation {
        stream,
        partition: partition_key.to_string(),
        sequence,
        reason,
    };

    let mut expected_prev = GENESIS_HASH.to_string();
    for (idx, entry) in entries.iter().enumerate() {
        let expected_sequence = idx as i64 + 1;
        if entry.sequence != expected_sequence {
            return Err(violation(
                entry.sequence,
                format!("sequence gap: expected {expected_sequence}"),
            ));
        }
        if entry.prev_hash != expected_prev {
            return Err(violation(
                entry.sequence,
                "prev_hash does not link to the previous row".to_string(),
            ));
        }
        if entry.hash_alg != HASH_ALGORITHM {
            return Err(violation(
                entry.sequence,
                format!("unsupported hash algorithm {}", entry.hash_alg),
            ));
        }
        let fields: Value = serde_json::from_str(&entry.fields_json).map_err(|_| {
            violation(entry.sequence, "stored fields are not valid JSON".to_string())
        })?;
        let recomputed = compute_hash(
            &entry.prev_hash,
            &entry.partition_key,
            entry.sequence,
            &entry.event_type,
            &entry.recorded_at,
            &canonical_json(&fields),
        );
        if recomputed != entry.hash {
            return Err(violation(
                entry.sequence,
                "stored hash does not match recomputed digest".to_string(),
            ));
        }
        expected_prev = entry.hash.clone();
    }

    let rows = entries.len() as i64;
    match head {
        Some(h) if h.last_sequence != rows || h.last_hash != expected_prev => {
            return Err(violation(
                h.last_sequence,
                format!("chain head points at sequence {} but {rows} rows verify", h.last_sequence),
            ));
        }
        None if rows > 0 => {
            return Err(violation(rows, "rows exist without a chain head".to_string()));
        }
        _ => {}
    }

    Ok(VerificationReport {
        stream,
        partition_key: partition_key.to_string(),
        rows: entries.len(),
        head_hash: expected_prev,
        verified_at: Utc::now(),
    })
}

/// Read, verify and release access to the chain tables. Rows are only ever
/// written by the ingestion gateway.
#[derive(Clone)]
pub struct ChainLedger {
    db: LedgerDb,
}

impl ChainLedger {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    pub async fn head(
        &self,
        stream: ChainStream,
        partition_key: &str,
    ) -> LedgerResult<Option<PartitionHead>> {
        let conn = self.db.lock().await;
        load_head(&conn, stream, partition_key)
    }

    pub async fn partitions(&self, stream: ChainStream) -> LedgerResult<Vec<PartitionHead>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT partition_key, last_sequence, last_hash, halted, halted_reason, updated_at
             FROM chain_heads WHERE stream = ?1 ORDER BY partition_key ASC",
        )?;
        let rows = stmt
            .query_map(params![stream.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(partition_key, last_sequence, last_hash, halted, halted_reason, updated_at)| {
                    Ok(PartitionHead {
                        stream,
                        partition_key,
                        last_sequence,
                        last_hash,
                        halted: halted != 0,
                        halted_reason,
                        updated_at: parse_timestamp("chain_heads", "updated_at", &updated_at)?,
                    })
                },
            )
            .collect()
    }

    pub async fn entries(
        &self,
        stream: ChainStream,
        partition_key: &str,
    ) -> LedgerResult<Vec<ChainEntry>> {
        let conn = self.db.lock().await;
        load_entries(&conn, stream, partition_key)
    }

    /// Verify one partition. A violation halts the partition and is returned,
    /// never repaired.
    pub async fn verify(
        &self,
        stream: ChainStream,
        partition_key: &str,
    ) -> LedgerResult<VerificationReport> {
        let (entries, head) = {
            let conn = self.db.lock().await;
            (
                load_entries(&conn, stream, partition_key)?,
                load_head(&conn, stream, partition_key)?,
            )
        };

        match verify_entries(stream, partition_key, &entries, head.as_ref()) {
            Ok(report) => {
                info!(
                    stream = stream.as_str(),
                    partition = partition_key,
                    rows = report.rows,
                    "chain verified"
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    stream = stream.as_str(),
                    partition = partition_key,
                    error = %err,
                    "🛑 chain integrity violation, halting partition"
                );
                let conn = self.db.lock().await;
                halt_partition(&conn, stream, partition_key, &err.to_string())?;
                Err(err)
            }
        }
    }

    pub async fn verify_all(
        &self,
        stream: ChainStream,
    ) -> LedgerResult<Vec<(String, LedgerResult<VerificationReport>)>> {
        let heads = self.partitions(stream).await?;
        let mut out = Vec::with_capacity(heads.len());
        for head in heads {
            let result = self.verify(stream, &head.partition_key).await;
            out.push((head.partition_key, result));
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) async fn halt(
        &self,
        stream: ChainStream,
        partition_key: &str,
        reason: &str,
    ) -> LedgerResult<()> {
        tracing::warn!(
            stream = stream.as_str(),
            partition = partition_key,
            reason,
            "partition halted"
        );
        let conn = self.db.lock().await;
        halt_partition(&conn, stream, partition_key, reason)
    }

    /// Lift a halt after manual reconciliation. Refuses unless the partition
    /// verifies cleanly.
    pub async fn release(
        &self,
        stream: ChainStream,
        partition_key: &str,
    ) -> LedgerResult<VerificationReport> {
        let report = self.verify(stream, partition_key).await?;
        let conn = self.db.lock().await;
        clear_halt(&conn, stream, partition_key)?;
        info!(
            stream = stream.as_str(),
            partition = partition_key,
            "partition released"
        );
        Ok(report)
    }
}
