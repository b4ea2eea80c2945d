//! Shape validation for inbound lifecycle events and order proposals.
//!
//! Walks the raw JSON so every bad field is reported at once. Decimals are
//! accepted as JSON numbers or strings; strings are preferred upstream since
//! they survive float-free transport.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::FieldError;
use crate::models::{
    EconomicsReconciled, EventType, ExecutionReported, LifecycleEvent, PositionClosed, Side,
};

const MAX_ID_LEN: usize = 128;

/// Largest accepted magnitude for any amount. Keeps a single fill's notional
/// far inside the decimal range.
const MAX_AMOUNT: i64 = 1_000_000_000_000;

/// Pre-trade order awaiting a risk decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderProposal {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub trace_id: Option<String>,
    pub account_id: Option<String>,
}

struct Fields<'a> {
    obj: &'a Map<String, Value>,
    errors: Vec<FieldError>,
}

impl<'a> Fields<'a> {
    /// Snake case first, camelCase alias second.
    fn raw(&self, name: &str) -> Option<&'a Value> {
        self.obj
            .get(name)
            .or_else(|| self.obj.get(&camel_case(name)))
            .filter(|v| !v.is_null())
    }

    fn fail(&mut self, field: &str, message: &str) {
        self.errors.push(FieldError::new(field, message));
    }

    fn opt_str(&mut self, name: &str) -> Option<String> {
        match self.raw(name) {
            None => None,
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.fail(name, "must not be empty");
                None
            }
            Some(Value::String(s)) if s.len() > MAX_ID_LEN => {
                self.fail(name, "exceeds 128 characters");
                None
            }
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(_) => {
                self.fail(name, "must be a string");
                None
            }
        }
    }

    fn req_str(&mut self, name: &str) -> Option<String> {
        if self.raw(name).is_none() {
            self.fail(name, "is required");
            return None;
        }
        self.opt_str(name)
    }

    /// Required identifier that becomes part of a composite key.
    fn key_part(&mut self, name: &str) -> Option<String> {
        let value = self.req_str(name)?;
        if value.contains(':') {
            self.fail(name, "must not contain ':'");
            return None;
        }
        Some(value)
    }

    fn opt_decimal(&mut self, name: &str) -> Option<Decimal> {
        let parsed = match self.raw(name)? {
            Value::String(s) => Decimal::from_str(s.trim()).ok(),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .ok(),
            _ => None,
        };
        match parsed {
            None => {
                self.fail(name, "must be a decimal number");
                None
            }
            Some(value) if value.abs() > Decimal::from(MAX_AMOUNT) => {
                self.fail(name, "must not exceed 1000000000000 in magnitude");
                None
            }
            Some(value) => Some(value),
        }
    }

    fn req_decimal(&mut self, name: &str) -> Option<Decimal> {
        if self.raw(name).is_none() {
            self.fail(name, "is required");
            return None;
        }
        self.opt_decimal(name)
    }

    fn positive(&mut self, name: &str) -> Option<Decimal> {
        let value = self.req_decimal(name)?;
        if value <= Decimal::ZERO {
            self.fail(name, "must be greater than zero");
            return None;
        }
        Some(value)
    }

    fn non_negative(&mut self, name: &str) -> Option<Decimal> {
        let value = self.req_decimal(name)?;
        if value.is_sign_negative() && !value.is_zero() {
            self.fail(name, "must not be negative");
            return None;
        }
        Some(value)
    }

    fn opt_side(&mut self, name: &str) -> Option<Side> {
        let raw = self.raw(name)?;
        let side = raw.as_str().and_then(Side::from_str);
        if side.is_none() {
            self.fail(name, "must be BUY or SELL");
        }
        side
    }

    fn req_side(&mut self, name: &str) -> Option<Side> {
        if self.raw(name).is_none() {
            self.fail(name, "is required");
            return None;
        }
        self.opt_side(name)
    }

    fn opt_timestamp(&mut self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.raw(name)?;
        let parsed = raw
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|ts| ts.with_timezone(&Utc));
        if parsed.is_none() {
            self.fail(name, "must be an RFC 3339 timestamp");
        }
        parsed
    }

    fn req_timestamp(&mut self, name: &str) -> Option<DateTime<Utc>> {
        if self.raw(name).is_none() {
            self.fail(name, "is required");
            return None;
        }
        self.opt_timestamp(name)
    }

    fn req_date(&mut self, name: &str) -> Option<NaiveDate> {
        let Some(raw) = self.raw(name) else {
            self.fail(name, "is required");
            return None;
        };
        let parsed = raw
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
        if parsed.is_none() {
            self.fail(name, "must be a YYYY-MM-DD date");
        }
        parsed
    }

    fn currency(&mut self, name: &str) -> Option<String> {
        let value = self.req_str(name)?;
        if value.len() != 3 || !value.chars().all(|c| c.is_ascii_alphabetic()) {
            self.fail(name, "must be a 3-letter ISO currency code");
            return None;
        }
        Some(value.to_ascii_uppercase())
    }

    fn finish<T>(self, value: Option<T>) -> Result<T, Vec<FieldError>> {
        match value {
            Some(v) if self.errors.is_empty() => Ok(v),
            _ => Err(self.errors),
        }
    }
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn object(payload: &Value) -> Result<&Map<String, Value>, Vec<FieldError>> {
    payload
        .as_object()
        .ok_or_else(|| vec![FieldError::new("body", "must be a JSON object")])
}

/// Validate `payload` against the shape declared by `event_type`.
pub fn validate(event_type: EventType, payload: &Value) -> Result<LifecycleEvent, Vec<FieldError>> {
    let mut f = Fields {
        obj: object(payload)?,
        errors: Vec::new(),
    };

    match event_type {
        EventType::ExecutionReported => {
            let source_system = f.req_str("source_system");
            let exec_id = f.req_str("exec_id");
            let decision_token = f.req_str("decision_token");
            let trace_id = f.opt_str("trace_id");
            let client_id = f.req_str("client_id");
            let symbol = f.req_str("symbol");
            let side = f.req_side("side");
            let qty = f.positive("qty");
            let price = f.positive("price");
            let executed_at = f.req_timestamp("executed_at");

            let event = (|| {
                Some(LifecycleEvent::ExecutionReported(ExecutionReported {
                    source_system: source_system?,
                    exec_id: exec_id?,
                    decision_token: decision_token?,
                    trace_id,
                    client_id: client_id?,
                    symbol: symbol?,
                    side: side?,
                    qty: qty?,
                    price: price?,
                    executed_at: executed_at?,
                }))
            })();
            f.finish(event)
        }
        EventType::PositionClosed => {
            let source_system = f.req_str("source_system");
            let close_id = f.req_str("close_id");
            let decision_token = f.req_str("decision_token");
            let trace_id = f.opt_str("trace_id");
            let client_id = f.req_str("client_id");
            let symbol = f.req_str("symbol");
            let side = f.req_side("side");
            let qty = f.positive("qty");
            let price = f.positive("price");
            let closed_at = f.req_timestamp("closed_at");
            let realized_pnl = f.opt_decimal("realized_pnl");

            let event = (|| {
                Some(LifecycleEvent::PositionClosed(PositionClosed {
                    source_system: source_system?,
                    close_id: close_id?,
                    decision_token: decision_token?,
                    trace_id,
                    client_id: client_id?,
                    symbol: symbol?,
                    side: side?,
                    qty: qty?,
                    price: price?,
                    closed_at: closed_at?,
                    realized_pnl,
                }))
            })();
            f.finish(event)
        }
        EventType::EconomicsReconciled => {
            let trade_date = f.req_date("trade_date");
            let symbol = f.key_part("symbol");
            let account_id = f.key_part("account_id");
            let decision_token = f.req_str("decision_token");
            let trace_id = f.opt_str("trace_id");
            let gross_revenue = f.req_decimal("gross_revenue");
            let fees = f.non_negative("fees");
            let costs = f.non_negative("costs");
            let currency = f.currency("currency");
            let source = f.opt_str("source");
            let side = f.opt_side("side");
            let qty = f.opt_decimal("qty");
            let price = f.opt_decimal("price");
            let reconciled_at = f.opt_timestamp("reconciled_at");

            let event = (|| {
                Some(LifecycleEvent::EconomicsReconciled(EconomicsReconciled {
                    trade_date: trade_date?,
                    symbol: symbol?,
                    account_id: account_id?,
                    decision_token: decision_token?,
                    trace_id,
                    gross_revenue: gross_revenue?,
                    fees: fees?,
                    costs: costs?,
                    currency: currency?,
                    source,
                    side,
                    qty,
                    price,
                    reconciled_at,
                }))
            })();
            f.finish(event)
        }
    }
}

pub fn parse_proposal(payload: &Value) -> Result<OrderProposal, Vec<FieldError>> {
    let mut f = Fields {
        obj: object(payload)?,
        errors: Vec::new(),
    };
    let client_id = f.req_str("client_id");
    let symbol = f.req_str("symbol");
    let side = f.req_side("side");
    let qty = f.positive("qty");
    let price = f.positive("price");
    let trace_id = f.opt_str("trace_id");
    let account_id = f.opt_str("account_id");

    let proposal = (|| {
        Some(OrderProposal {
            client_id: client_id?,
            symbol: symbol?,
            side: side?,
            qty: qty?,
            price: price?,
            trace_id,
            account_id,
        })
    })();
    f.finish(proposal)
}
