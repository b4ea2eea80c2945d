//! Ledger error taxonomy.
//!
//! Duplicate deliveries are not errors: they surface as
//! [`crate::ingestion::IngestOutcome::Duplicate`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ChainStream;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed or incomplete inbound payload. Never recorded as seen.
    #[error("validation failed: {} field error(s)", .0.len())]
    Validation(Vec<FieldError>),

    /// Recomputed hash chain disagrees with what is stored.
    #[error("chain integrity violation in {stream}/{partition} at sequence {sequence}: {reason}")]
    ChainIntegrityViolation {
        stream: ChainStream,
        partition: String,
        sequence: i64,
        reason: String,
    },

    /// Automated writes to this partition are stopped pending reconciliation.
    #[error("partition {stream}/{partition} is halted: {reason}")]
    PartitionHalted {
        stream: ChainStream,
        partition: String,
        reason: String,
    },

    /// Another writer advanced the partition head between read and write.
    #[error("chain head for {stream}/{partition} moved concurrently (expected sequence {expected})")]
    ConcurrentAppend {
        stream: ChainStream,
        partition: String,
        expected: i64,
    },

    /// Live shadow ledger row diverges from the replay of its chain.
    #[error("aggregation inconsistency for {client_id}/{symbol}: {field} live={live} replayed={replayed}")]
    AggregationInconsistency {
        client_id: String,
        symbol: String,
        field: String,
        live: String,
        replayed: String,
    },

    /// Exposure arithmetic left the representable decimal range. The event
    /// is refused and the stored position is left untouched.
    #[error("arithmetic overflow while computing {operation}")]
    ArithmeticOverflow { operation: &'static str },

    #[error("policy service unavailable: {0}")]
    PolicyServiceUnavailable(String),

    #[error("delivery to {target} failed: {reason}")]
    DeliveryFailure { target: String, reason: String },

    /// Dedup cannot be guaranteed, so the event must be rejected.
    #[error("idempotency store unavailable: {0}")]
    IdempotencyUnavailable(String),

    /// A PENDING reservation was taken over before this handler completed it.
    #[error("idempotency lease lost for {key}")]
    LeaseLost { key: String },

    #[error("invalid idempotency transition for {key}: {from} -> {to}")]
    InvalidTransition { key: String, from: String, to: String },

    #[error("corrupt value in {table}.{column}: {value}")]
    CorruptValue {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Integrity and aggregation failures stop automated processing.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChainIntegrityViolation { .. }
                | Self::AggregationInconsistency { .. }
                | Self::PartitionHalted { .. }
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
