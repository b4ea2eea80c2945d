//! Core domain types for lifecycle ingestion and exposure tracking.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Source system stamped on every back-office economics key.
pub const BACKOFFICE_SOURCE: &str = "backoffice";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "B" => Some(Side::Buy),
            "SELL" | "S" => Some(Side::Sell),
            _ => None,
        }
    }

    /// +1 for BUY, -1 for SELL.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Inbound lifecycle event kinds accepted by the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "execution.reported")]
    ExecutionReported,
    #[serde(rename = "position.closed")]
    PositionClosed,
    #[serde(rename = "economics.reconciled")]
    EconomicsReconciled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionReported => "execution.reported",
            EventType::PositionClosed => "position.closed",
            EventType::EconomicsReconciled => "economics.reconciled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "execution.reported" => Some(EventType::ExecutionReported),
            "position.closed" => Some(EventType::PositionClosed),
            "economics.reconciled" => Some(EventType::EconomicsReconciled),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only chain streams. Audit rows partition by trace, exposure rows by client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChainStream {
    Audit,
    Exposure,
}

impl ChainStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStream::Audit => "audit",
            ChainStream::Exposure => "exposure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "audit" => Some(ChainStream::Audit),
            "exposure" => Some(ChainStream::Exposure),
            _ => None,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            ChainStream::Audit => "audit_events",
            ChainStream::Exposure => "exposure_events",
        }
    }
}

impl fmt::Display for ChainStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key triple. Uniqueness on this triple is what makes ingestion
/// at-most-once-effective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub source_system: String,
    pub event_type: String,
    pub event_id: String,
}

impl IdempotencyKey {
    pub fn new(
        source_system: impl Into<String>,
        event_type: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            source_system: source_system.into(),
            event_type: event_type.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_system, self.event_type, self.event_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReported {
    pub source_system: String,
    pub exec_id: String,
    pub decision_token: String,
    pub trace_id: Option<String>,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    /// Upstream-asserted execution time. Never used for ordering.
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub source_system: String,
    pub close_id: String,
    pub decision_token: String,
    pub trace_id: Option<String>,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicsReconciled {
    pub trade_date: NaiveDate,
    pub symbol: String,
    pub account_id: String,
    pub decision_token: String,
    pub trace_id: Option<String>,
    pub gross_revenue: Decimal,
    pub fees: Decimal,
    pub costs: Decimal,
    pub currency: String,
    /// Originating platform (e.g. "mt5"); the idempotency source is always back-office.
    pub source: Option<String>,
    pub side: Option<Side>,
    pub qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl EconomicsReconciled {
    /// `None` when the difference leaves the decimal range.
    pub fn net_revenue(&self) -> Option<Decimal> {
        self.gross_revenue
            .checked_sub(self.fees)?
            .checked_sub(self.costs)
    }
}

/// A validated lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    ExecutionReported(ExecutionReported),
    PositionClosed(PositionClosed),
    EconomicsReconciled(EconomicsReconciled),
}

impl LifecycleEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            LifecycleEvent::ExecutionReported(_) => EventType::ExecutionReported,
            LifecycleEvent::PositionClosed(_) => EventType::PositionClosed,
            LifecycleEvent::EconomicsReconciled(_) => EventType::EconomicsReconciled,
        }
    }

    /// Natural key of the variant.
    pub fn event_id(&self) -> String {
        match self {
            LifecycleEvent::ExecutionReported(e) => e.exec_id.clone(),
            LifecycleEvent::PositionClosed(e) => e.close_id.clone(),
            LifecycleEvent::EconomicsReconciled(e) => {
                format!("{}:{}:{}", e.trade_date, e.symbol, e.account_id)
            }
        }
    }

    pub fn source_system(&self) -> &str {
        match self {
            LifecycleEvent::ExecutionReported(e) => &e.source_system,
            LifecycleEvent::PositionClosed(e) => &e.source_system,
            LifecycleEvent::EconomicsReconciled(_) => BACKOFFICE_SOURCE,
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.source_system(),
            self.event_type().as_str(),
            self.event_id(),
        )
    }

    pub fn decision_token(&self) -> &str {
        match self {
            LifecycleEvent::ExecutionReported(e) => &e.decision_token,
            LifecycleEvent::PositionClosed(e) => &e.decision_token,
            LifecycleEvent::EconomicsReconciled(e) => &e.decision_token,
        }
    }

    /// Audit chain partition: explicit trace id, else the decision token.
    pub fn trace_id(&self) -> &str {
        let explicit = match self {
            LifecycleEvent::ExecutionReported(e) => e.trace_id.as_deref(),
            LifecycleEvent::PositionClosed(e) => e.trace_id.as_deref(),
            LifecycleEvent::EconomicsReconciled(e) => e.trace_id.as_deref(),
        };
        explicit.unwrap_or_else(|| self.decision_token())
    }

    pub fn symbol(&self) -> &str {
        match self {
            LifecycleEvent::ExecutionReported(e) => &e.symbol,
            LifecycleEvent::PositionClosed(e) => &e.symbol,
            LifecycleEvent::EconomicsReconciled(e) => &e.symbol,
        }
    }

    /// Only executions and closes move exposure.
    pub fn exposure_step(&self) -> Option<ExposureStep> {
        match self {
            LifecycleEvent::ExecutionReported(e) => Some(ExposureStep {
                kind: ExposureStepKind::Filled,
                client_id: e.client_id.clone(),
                symbol: e.symbol.clone(),
                side: e.side,
                qty: e.qty,
                price: e.price,
            }),
            LifecycleEvent::PositionClosed(e) => Some(ExposureStep {
                kind: ExposureStepKind::Closed,
                client_id: e.client_id.clone(),
                symbol: e.symbol.clone(),
                side: e.side,
                qty: e.qty,
                price: e.price,
            }),
            LifecycleEvent::EconomicsReconciled(_) => None,
        }
    }

    /// Fields hashed into the audit chain row for this event.
    pub fn audit_fields(&self, received_at: DateTime<Utc>) -> Value {
        let mut fields = match self {
            LifecycleEvent::ExecutionReported(e) => json!({
                "source_system": e.source_system,
                "exec_id": e.exec_id,
                "client_id": e.client_id,
                "symbol": e.symbol,
                "side": e.side.as_str(),
                "qty": decimal_text(&e.qty),
                "price": decimal_text(&e.price),
                "asserted_at": timestamp_text(&e.executed_at),
            }),
            LifecycleEvent::PositionClosed(e) => json!({
                "source_system": e.source_system,
                "close_id": e.close_id,
                "client_id": e.client_id,
                "symbol": e.symbol,
                "side": e.side.as_str(),
                "qty": decimal_text(&e.qty),
                "price": decimal_text(&e.price),
                "realized_pnl": e.realized_pnl.as_ref().map(decimal_text),
                "asserted_at": timestamp_text(&e.closed_at),
            }),
            LifecycleEvent::EconomicsReconciled(e) => json!({
                "source_system": BACKOFFICE_SOURCE,
                "source": e.source,
                "trade_date": e.trade_date.to_string(),
                "symbol": e.symbol,
                "account_id": e.account_id,
                "gross_revenue": decimal_text(&e.gross_revenue),
                "fees": decimal_text(&e.fees),
                "costs": decimal_text(&e.costs),
                "net_revenue": e.net_revenue().as_ref().map(decimal_text),
                "currency": e.currency,
                "side": e.side.map(|s| s.as_str()),
                "qty": e.qty.as_ref().map(decimal_text),
                "price": e.price.as_ref().map(decimal_text),
                "asserted_at": e.reconciled_at.as_ref().map(timestamp_text),
            }),
        };
        if let Value::Object(map) = &mut fields {
            map.insert("event_id".into(), Value::String(self.event_id()));
            map.insert(
                "decision_token".into(),
                Value::String(self.decision_token().to_string()),
            );
            map.insert(
                "received_at".into(),
                Value::String(timestamp_text(&received_at)),
            );
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExposureStepKind {
    Authorized,
    Filled,
    Closed,
}

impl ExposureStepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureStepKind::Authorized => "authorized",
            ExposureStepKind::Filled => "filled",
            ExposureStepKind::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "authorized" => Some(ExposureStepKind::Authorized),
            "filled" => Some(ExposureStepKind::Filled),
            "closed" => Some(ExposureStepKind::Closed),
            _ => None,
        }
    }

    /// Event type recorded on the exposure chain row.
    pub fn event_type(&self) -> &'static str {
        match self {
            ExposureStepKind::Authorized => "exposure.authorized",
            ExposureStepKind::Filled => "exposure.filled",
            ExposureStepKind::Closed => "exposure.closed",
        }
    }
}

/// One input to the shadow ledger fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureStep {
    pub kind: ExposureStepKind,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
}

/// Canonical text form of a monetary value (no trailing zeros).
pub fn decimal_text(d: &Decimal) -> String {
    d.normalize().to_string()
}

pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
