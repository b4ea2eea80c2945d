//! Shadow Ledger (exposure aggregator)
//!
//! Materialized per-(client, symbol) exposure derived by folding exposure
//! steps. Every fold also appends an `exposure` chain row (partition =
//! client id) holding the step inputs and the before/after snapshot, so the
//! live rows can always be rebuilt by replaying the chain.
//!
//! `ExposurePosition` is the single implementation of the fold arithmetic.
//! The live write path and the replay path both go through it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::hash_chain::{self, AppendReceipt, ChainEntry};
use crate::models::{
    decimal_text, timestamp_text, ChainStream, ExposureStep, ExposureStepKind, Side,
};
use crate::storage::{parse_decimal, parse_timestamp, LedgerDb};

/// Exposure state for one (client, symbol).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposurePosition {
    pub net_quantity: Decimal,
    pub avg_cost_basis: Decimal,
    pub gross_exposure: Decimal,
    pub net_exposure: Decimal,
    pub pending_exposure: Decimal,
}

impl ExposurePosition {
    /// Apply one step and return the signed delta it recorded. On overflow
    /// the position is left exactly as it was.
    pub fn apply(
        &mut self,
        kind: ExposureStepKind,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> LedgerResult<Decimal> {
        let mut next = self.clone();
        let delta = match kind {
            ExposureStepKind::Authorized => next.on_authorized(side, qty, price)?,
            ExposureStepKind::Filled => next.on_filled(side, qty, price)?,
            ExposureStepKind::Closed => next.on_closed(qty)?,
        };
        next.normalize();
        *self = next;
        Ok(delta.normalize())
    }

    /// Reserve capacity. Pending grows by `|delta|` whatever the side.
    fn on_authorized(&mut self, side: Side, qty: Decimal, price: Decimal) -> LedgerResult<Decimal> {
        let delta = checked(qty.checked_mul(price), "authorized notional")? * side.sign();
        self.pending_exposure =
            checked(self.pending_exposure.checked_add(delta.abs()), "pending exposure")?;
        Ok(delta)
    }

    /// Move exposure from pending to realized.
    fn on_filled(&mut self, side: Side, qty: Decimal, price: Decimal) -> LedgerResult<Decimal> {
        let delta = checked(qty.checked_mul(price), "fill notional")?;
        let signed_delta = delta * side.sign();
        let signed_qty = qty * side.sign();

        self.avg_cost_basis = next_cost_basis(self.net_quantity, self.avg_cost_basis, signed_qty, price)?;
        self.pending_exposure = self
            .pending_exposure
            .checked_sub(delta)
            .map_or(Decimal::ZERO, |p| p.max(Decimal::ZERO));
        self.gross_exposure = checked(self.gross_exposure.checked_add(delta), "gross exposure")?;
        self.net_exposure = checked(self.net_exposure.checked_add(signed_delta), "net exposure")?;
        self.net_quantity = checked(self.net_quantity.checked_add(signed_qty), "net quantity")?;

        Ok(signed_delta)
    }

    /// Release the closed fraction of the position. Returns the signed change
    /// in net exposure.
    fn on_closed(&mut self, qty: Decimal) -> LedgerResult<Decimal> {
        let held = self.net_quantity.abs();
        if held.is_zero() || qty <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let closing = qty.min(held);
        let released = if closing == held {
            self.net_exposure
        } else {
            let scaled = checked(self.net_exposure.checked_mul(closing), "released exposure")?;
            checked(scaled.checked_div(held), "released exposure")?
        };

        self.net_exposure = checked(self.net_exposure.checked_sub(released), "net exposure")?;
        let remaining_gross = checked(self.gross_exposure.checked_sub(released.abs()), "gross exposure")?;
        self.gross_exposure = remaining_gross.max(self.net_exposure.abs());
        // closing <= held, so this moves toward zero and cannot overflow
        if self.net_quantity.is_sign_positive() {
            self.net_quantity -= closing;
        } else {
            self.net_quantity += closing;
        }

        if self.net_quantity.is_zero() {
            // Fully closed rows are zeroed; outstanding authorizations stay pending
            self.net_exposure = Decimal::ZERO;
            self.gross_exposure = Decimal::ZERO;
            self.avg_cost_basis = Decimal::ZERO;
        }

        Ok(-released)
    }

    pub fn holds_invariant(&self) -> bool {
        self.gross_exposure >= self.net_exposure.abs() && self.pending_exposure >= Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.net_quantity.is_zero() && self.net_exposure.is_zero() && self.pending_exposure.is_zero()
    }

    fn normalize(&mut self) {
        self.net_quantity = self.net_quantity.normalize();
        self.avg_cost_basis = self.avg_cost_basis.normalize();
        self.gross_exposure = self.gross_exposure.normalize();
        self.net_exposure = self.net_exposure.normalize();
        self.pending_exposure = self.pending_exposure.normalize();
    }

    /// Snapshot stored on exposure chain rows.
    pub fn snapshot(&self) -> Value {
        json!({
            "net_quantity": decimal_text(&self.net_quantity),
            "avg_cost_basis": decimal_text(&self.avg_cost_basis),
            "gross_exposure": decimal_text(&self.gross_exposure),
            "net_exposure": decimal_text(&self.net_exposure),
            "pending_exposure": decimal_text(&self.pending_exposure),
        })
    }

    /// Field-by-field comparison, first mismatch wins.
    fn first_difference(&self, other: &ExposurePosition) -> Option<(&'static str, Decimal, Decimal)> {
        [
            ("net_quantity", self.net_quantity, other.net_quantity),
            ("avg_cost_basis", self.avg_cost_basis, other.avg_cost_basis),
            ("gross_exposure", self.gross_exposure, other.gross_exposure),
            ("net_exposure", self.net_exposure, other.net_exposure),
            ("pending_exposure", self.pending_exposure, other.pending_exposure),
        ]
        .into_iter()
        .find(|(_, a, b)| a != b)
    }
}

fn checked(value: Option<Decimal>, operation: &'static str) -> LedgerResult<Decimal> {
    value.ok_or(LedgerError::ArithmeticOverflow { operation })
}

fn next_cost_basis(
    held: Decimal,
    basis: Decimal,
    signed_fill: Decimal,
    price: Decimal,
) -> LedgerResult<Decimal> {
    if held.is_zero() || held.is_sign_positive() == signed_fill.is_sign_positive() {
        let held_abs = held.abs();
        let fill_abs = signed_fill.abs();
        let total = checked(held_abs.checked_add(fill_abs), "cost basis")?;
        if total.is_zero() {
            return Ok(basis);
        }
        let held_cost = checked(held_abs.checked_mul(basis), "cost basis")?;
        let fill_cost = checked(fill_abs.checked_mul(price), "cost basis")?;
        let cost = checked(held_cost.checked_add(fill_cost), "cost basis")?;
        return checked(cost.checked_div(total), "cost basis");
    }

    let remaining = checked(held.checked_add(signed_fill), "net quantity")?;
    Ok(if remaining.is_zero() {
        Decimal::ZERO
    } else if remaining.is_sign_positive() == held.is_sign_positive() {
        basis
    } else {
        price
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureLimits {
    pub max_gross_exposure: Decimal,
    pub max_net_exposure: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowLedgerEntry {
    pub client_id: String,
    pub symbol: String,
    #[serde(flatten)]
    pub position: ExposurePosition,
    /// Exposure chain sequence of the last fold applied to this row.
    pub last_sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoldReceipt {
    pub client_id: String,
    pub symbol: String,
    pub step: ExposureStepKind,
    pub delta: Decimal,
    pub before: ExposurePosition,
    pub after: ExposurePosition,
    pub chain: AppendReceipt,
}

/// Per-client totals for pre-trade checks. Breach flags are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientExposureSummary {
    pub client_id: String,
    pub positions: usize,
    pub gross_exposure: Decimal,
    pub net_exposure: Decimal,
    pub pending_exposure: Decimal,
    pub limits: ExposureLimits,
    pub gross_limit_breached: bool,
    pub net_limit_breached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub client_id: String,
    pub chain_rows: usize,
    pub symbols_checked: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncReport {
    pub client_id: String,
    pub chain_rows: usize,
    pub rows_rebuilt: usize,
    pub resynced_at: DateTime<Utc>,
}

/// Apply one fold step for `step.client_id`/`step.symbol` and append its
/// exposure chain row. Caller owns the transaction.
pub(crate) fn apply_step(
    conn: &Connection,
    step: &ExposureStep,
    event_id: &str,
    decision_token: &str,
) -> LedgerResult<FoldReceipt> {
    let current = load_entry(conn, &step.client_id, &step.symbol)?;
    let before = current
        .as_ref()
        .map(|e| e.position.clone())
        .unwrap_or_default();

    let mut after = before.clone();
    let delta = after.apply(step.kind, step.side, step.qty, step.price)?;

    if !after.holds_invariant() {
        error!(
            client_id = %step.client_id,
            symbol = %step.symbol,
            gross = %after.gross_exposure,
            net = %after.net_exposure,
            "🛑 exposure invariant broken by fold step"
        );
        return Err(LedgerError::AggregationInconsistency {
            client_id: step.client_id.clone(),
            symbol: step.symbol.clone(),
            field: "gross_exposure".to_string(),
            live: decimal_text(&after.gross_exposure),
            replayed: decimal_text(&after.net_exposure.abs()),
        });
    }

    let fields = json!({
        "symbol": step.symbol,
        "step": step.kind.as_str(),
        "side": step.side.as_str(),
        "qty": decimal_text(&step.qty),
        "price": decimal_text(&step.price),
        "delta": decimal_text(&delta),
        "event_id": event_id,
        "decision_token": decision_token,
        "exposure_before": before.snapshot(),
        "exposure_after": after.snapshot(),
    });
    let chain = hash_chain::append(
        conn,
        ChainStream::Exposure,
        &step.client_id,
        step.kind.event_type(),
        &fields,
    )?;

    upsert_entry(conn, &step.client_id, &step.symbol, &after, chain.sequence)?;

    debug!(
        client_id = %step.client_id,
        symbol = %step.symbol,
        step = step.kind.as_str(),
        delta = %delta,
        sequence = chain.sequence,
        "exposure folded"
    );

    Ok(FoldReceipt {
        client_id: step.client_id.clone(),
        symbol: step.symbol.clone(),
        step: step.kind,
        delta,
        before,
        after,
        chain,
    })
}

fn upsert_entry(
    conn: &Connection,
    client_id: &str,
    symbol: &str,
    position: &ExposurePosition,
    last_sequence: i64,
) -> LedgerResult<()> {
    let now = timestamp_text(&Utc::now());
    conn.execute(
        "INSERT INTO shadow_ledger
         (client_id, symbol, net_quantity, avg_cost_basis, gross_exposure, net_exposure, pending_exposure, last_sequence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(client_id, symbol) DO UPDATE SET
            net_quantity = excluded.net_quantity,
            avg_cost_basis = excluded.avg_cost_basis,
            gross_exposure = excluded.gross_exposure,
            net_exposure = excluded.net_exposure,
            pending_exposure = excluded.pending_exposure,
            last_sequence = excluded.last_sequence,
            updated_at = excluded.updated_at",
        params![
            client_id,
            symbol,
            decimal_text(&position.net_quantity),
            decimal_text(&position.avg_cost_basis),
            decimal_text(&position.gross_exposure),
            decimal_text(&position.net_exposure),
            decimal_text(&position.pending_exposure),
            last_sequence,
            now,
        ],
    )?;
    Ok(())
}

type RawEntry = (String, String, String, String, String, String, String, i64, String, String);

fn entry_from_raw(raw: RawEntry) -> LedgerResult<ShadowLedgerEntry> {
    let (client_id, symbol, nq, acb, gross, net, pending, last_sequence, created_at, updated_at) = raw;
    Ok(ShadowLedgerEntry {
        client_id,
        symbol,
        position: ExposurePosition {
            net_quantity: parse_decimal("shadow_ledger", "net_quantity", &nq)?,
            avg_cost_basis: parse_decimal("shadow_ledger", "avg_cost_basis", &acb)?,
            gross_exposure: parse_decimal("shadow_ledger", "gross_exposure", &gross)?,
            net_exposure: parse_decimal("shadow_ledger", "net_exposure", &net)?,
            pending_exposure: parse_decimal("shadow_ledger", "pending_exposure", &pending)?,
        },
        last_sequence,
        created_at: parse_timestamp("shadow_ledger", "created_at", &created_at)?,
        updated_at: parse_timestamp("shadow_ledger", "updated_at", &updated_at)?,
    })
}

fn raw_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

const ENTRY_COLUMNS: &str = "client_id, symbol, net_quantity, avg_cost_basis, gross_exposure, net_exposure, pending_exposure, last_sequence, created_at, updated_at";

fn load_entry(
    conn: &Connection,
    client_id: &str,
    symbol: &str,
) -> LedgerResult<Option<ShadowLedgerEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM shadow_ledger WHERE client_id = ?1 AND symbol = ?2"),
            params![client_id, symbol],
            raw_entry,
        )
        .optional()?;
    raw.map(entry_from_raw).transpose()
}

fn load_client_entries(conn: &Connection, client_id: &str) -> LedgerResult<Vec<ShadowLedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM shadow_ledger WHERE client_id = ?1 ORDER BY symbol ASC"
    ))?;
    let raws = stmt
        .query_map(params![client_id], raw_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(entry_from_raw).collect()
}

fn load_limits(
    conn: &Connection,
    client_id: &str,
    defaults: &ExposureLimits,
) -> LedgerResult<ExposureLimits> {
    let raw = conn
        .query_row(
            "SELECT max_gross_exposure, max_net_exposure FROM client_limits WHERE client_id = ?1",
            params![client_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    match raw {
        Some((gross, net)) => Ok(ExposureLimits {
            max_gross_exposure: parse_decimal("client_limits", "max_gross_exposure", &gross)?,
            max_net_exposure: parse_decimal("client_limits", "max_net_exposure", &net)?,
        }),
        None => Ok(defaults.clone()),
    }
}

fn chain_field<'a>(entry: &'a ChainEntry, name: &'static str) -> LedgerResult<&'a str> {
    entry
        .fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::CorruptValue {
            table: "exposure_events",
            column: name,
            value: format!("sequence {}", entry.sequence),
        })
}

fn checked_total(
    entries: &[ShadowLedgerEntry],
    operation: &'static str,
    field: impl Fn(&ExposurePosition) -> Decimal,
) -> LedgerResult<Decimal> {
    entries.iter().try_fold(Decimal::ZERO, |acc, e| {
        checked(acc.checked_add(field(&e.position)), operation)
    })
}

/// Fold a client's exposure chain from scratch, keyed by symbol.
pub fn replay(entries: &[ChainEntry]) -> LedgerResult<BTreeMap<String, ExposurePosition>> {
    let mut positions: BTreeMap<String, ExposurePosition> = BTreeMap::new();
    for entry in entries {
        let symbol = chain_field(entry, "symbol")?;
        let step = chain_field(entry, "step")?;
        let kind = ExposureStepKind::from_str(step).ok_or_else(|| LedgerError::CorruptValue {
            table: "exposure_events",
            column: "step",
            value: step.to_string(),
        })?;
        let side_raw = chain_field(entry, "side")?;
        let side = Side::from_str(side_raw).ok_or_else(|| LedgerError::CorruptValue {
            table: "exposure_events",
            column: "side",
            value: side_raw.to_string(),
        })?;
        let qty = parse_decimal("exposure_events", "qty", chain_field(entry, "qty")?)?;
        let price = parse_decimal("exposure_events", "price", chain_field(entry, "price")?)?;

        positions
            .entry(symbol.to_string())
            .or_default()
            .apply(kind, side, qty, price)?;
    }
    Ok(positions)
}

#[derive(Clone)]
pub struct ShadowLedger {
    db: LedgerDb,
    default_limits: ExposureLimits,
}

impl ShadowLedger {
    pub fn new(db: LedgerDb, default_limits: ExposureLimits) -> Self {
        Self { db, default_limits }
    }

    pub async fn position(
        &self,
        client_id: &str,
        symbol: &str,
    ) -> LedgerResult<Option<ShadowLedgerEntry>> {
        let conn = self.db.lock().await;
        load_entry(&conn, client_id, symbol)
    }

    pub async fn positions(&self, client_id: &str) -> LedgerResult<Vec<ShadowLedgerEntry>> {
        let conn = self.db.lock().await;
        load_client_entries(&conn, client_id)
    }

    pub async fn limits(&self, client_id: &str) -> LedgerResult<ExposureLimits> {
        let conn = self.db.lock().await;
        load_limits(&conn, client_id, &self.default_limits)
    }

    pub async fn set_limits(&self, client_id: &str, limits: &ExposureLimits) -> LedgerResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO client_limits (client_id, max_gross_exposure, max_net_exposure, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_id) DO UPDATE SET
                max_gross_exposure = excluded.max_gross_exposure,
                max_net_exposure = excluded.max_net_exposure,
                updated_at = excluded.updated_at",
            params![
                client_id,
                decimal_text(&limits.max_gross_exposure),
                decimal_text(&limits.max_net_exposure),
                timestamp_text(&Utc::now()),
            ],
        )?;
        info!(client_id, gross = %limits.max_gross_exposure, net = %limits.max_net_exposure, "client limits updated");
        Ok(())
    }

    pub async fn client_exposure_summary(&self, client_id: &str) -> LedgerResult<ClientExposureSummary> {
        let (entries, limits) = {
            let conn = self.db.lock().await;
            (
                load_client_entries(&conn, client_id)?,
                load_limits(&conn, client_id, &self.default_limits)?,
            )
        };

        let gross = checked_total(&entries, "client gross exposure", |p| p.gross_exposure)?;
        let net = checked_total(&entries, "client net exposure", |p| p.net_exposure)?;
        let pending = checked_total(&entries, "client pending exposure", |p| p.pending_exposure)?;

        let gross_limit_breached = gross > limits.max_gross_exposure;
        let net_limit_breached = net.abs() > limits.max_net_exposure;
        if gross_limit_breached || net_limit_breached {
            warn!(
                client_id,
                gross = %gross,
                net = %net,
                "client exposure above configured limits"
            );
        }

        Ok(ClientExposureSummary {
            client_id: client_id.to_string(),
            positions: entries.len(),
            gross_exposure: gross.normalize(),
            net_exposure: net.normalize(),
            pending_exposure: pending.normalize(),
            limits,
            gross_limit_breached,
            net_limit_breached,
        })
    }

    /// Replay the client's exposure chain and compare with the live rows.
    /// Any divergence halts the client's exposure partition.
    pub async fn check_consistency(&self, client_id: &str) -> LedgerResult<ConsistencyReport> {
        let conn = self.db.lock().await;
        let entries = hash_chain::load_entries(&conn, ChainStream::Exposure, client_id)?;
        let head = hash_chain::load_head(&conn, ChainStream::Exposure, client_id)?;

        if let Err(err) =
            hash_chain::verify_entries(ChainStream::Exposure, client_id, &entries, head.as_ref())
        {
            error!(client_id, error = %err, "🛑 exposure chain failed verification");
            hash_chain::halt_partition(&conn, ChainStream::Exposure, client_id, &err.to_string())?;
            return Err(err);
        }

        let replayed = replay(&entries)?;
        let live: BTreeMap<String, ExposurePosition> = load_client_entries(&conn, client_id)?
            .into_iter()
            .map(|e| (e.symbol, e.position))
            .collect();

        let symbols: BTreeSet<&String> = replayed.keys().chain(live.keys()).collect();
        let flat = ExposurePosition::default();
        for symbol in &symbols {
            let live_pos = live.get(*symbol).unwrap_or(&flat);
            let replay_pos = replayed.get(*symbol).unwrap_or(&flat);
            if let Some((field, live_value, replayed_value)) = live_pos.first_difference(replay_pos) {
                let err = LedgerError::AggregationInconsistency {
                    client_id: client_id.to_string(),
                    symbol: symbol.to_string(),
                    field: field.to_string(),
                    live: decimal_text(&live_value),
                    replayed: decimal_text(&replayed_value),
                };
                error!(client_id, symbol = %symbol, field, "🛑 shadow ledger diverges from chain replay");
                hash_chain::halt_partition(&conn, ChainStream::Exposure, client_id, &err.to_string())?;
                return Err(err);
            }
        }

        Ok(ConsistencyReport {
            client_id: client_id.to_string(),
            chain_rows: entries.len(),
            symbols_checked: symbols.len(),
            checked_at: Utc::now(),
        })
    }

    /// Rebuild the client's rows from the exposure chain and lift the halt.
    /// Refuses when the chain itself does not verify.
    pub async fn resync(&self, client_id: &str) -> LedgerResult<ResyncReport> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entries = hash_chain::load_entries(&tx, ChainStream::Exposure, client_id)?;
        let head = hash_chain::load_head(&tx, ChainStream::Exposure, client_id)?;
        hash_chain::verify_entries(ChainStream::Exposure, client_id, &entries, head.as_ref())?;

        let replayed = replay(&entries)?;
        let last_sequence = entries.last().map(|e| e.sequence).unwrap_or(0);
        let existing: Vec<String> = load_client_entries(&tx, client_id)?
            .into_iter()
            .map(|e| e.symbol)
            .collect();

        for (symbol, position) in &replayed {
            upsert_entry(&tx, client_id, symbol, position, last_sequence)?;
        }
        // Rows with no chain history are zeroed, never deleted
        for symbol in existing.iter().filter(|s| !replayed.contains_key(*s)) {
            upsert_entry(&tx, client_id, symbol, &ExposurePosition::default(), last_sequence)?;
        }

        hash_chain::clear_halt(&tx, ChainStream::Exposure, client_id)?;
        tx.commit()?;

        info!(client_id, rows = replayed.len(), "shadow ledger resynced from chain");
        Ok(ResyncReport {
            client_id: client_id.to_string(),
            chain_rows: entries.len(),
            rows_rebuilt: replayed.len(),
            resynced_at: Utc::now(),
        })
    }
}
