//! BrokerOps Ledger
//!
//! Governance core for order flow: idempotent lifecycle ingestion, a
//! per-partition hash-chained audit trail and the shadow exposure ledger
//! consulted by pre-trade risk checks.

pub mod api;
pub mod config;
pub mod emitter;
pub mod error;
pub mod hash_chain;
pub mod idempotency;
pub mod ingestion;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod shadow_ledger;
pub mod storage;
pub mod webhooks;

pub use error::{FieldError, LedgerError, LedgerResult};
