//! Policy decision collaborator.
//!
//! The engine itself lives outside this service. Whatever goes wrong talking
//! to it (transport, status, decode, missing configuration) is an implicit
//! BLOCK, never an implicit ALLOW.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ingestion::OrderProposal;
use crate::shadow_ledger::ClientExposureSummary;

pub const POLICY_UNAVAILABLE_REASON: &str = "POLICY_SERVICE_UNAVAILABLE";
const FAIL_CLOSED_RULE: &str = "fail-closed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason_code: String,
    pub rule_id: String,
    pub policy_version: String,
}

impl PolicyDecision {
    pub fn fail_closed() -> Self {
        Self {
            allow: false,
            reason_code: POLICY_UNAVAILABLE_REASON.to_string(),
            rule_id: FAIL_CLOSED_RULE.to_string(),
            policy_version: "n/a".to_string(),
        }
    }

    pub fn is_fail_closed(&self) -> bool {
        !self.allow && self.reason_code == POLICY_UNAVAILABLE_REASON
    }
}

/// What the engine sees: the proposed order plus the client's current
/// exposure (breach flags included, they are advisory inputs).
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest<'a> {
    pub order: &'a OrderProposal,
    pub exposure: &'a ClientExposureSummary,
}

#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, request: &PolicyRequest<'_>) -> LedgerResult<PolicyDecision>;
}

/// Evaluate and collapse every failure into a BLOCK decision.
pub async fn evaluate_fail_closed(
    engine: &dyn PolicyEngine,
    request: &PolicyRequest<'_>,
) -> PolicyDecision {
    match engine.evaluate(request).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(
                client_id = %request.order.client_id,
                symbol = %request.order.symbol,
                error = %err,
                "⚠️ policy engine unavailable, failing closed"
            );
            PolicyDecision::fail_closed()
        }
    }
}

pub struct HttpPolicyEngine {
    client: Client,
    url: String,
}

impl HttpPolicyEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("brokerops-ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::PolicyServiceUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl PolicyEngine for HttpPolicyEngine {
    async fn evaluate(&self, request: &PolicyRequest<'_>) -> LedgerResult<PolicyDecision> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| LedgerError::PolicyServiceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::PolicyServiceUnavailable(format!(
                "policy service returned {status}"
            )));
        }

        let decision: PolicyDecision = response
            .json()
            .await
            .map_err(|e| LedgerError::PolicyServiceUnavailable(format!("bad decision body: {e}")))?;
        debug!(
            allow = decision.allow,
            reason = %decision.reason_code,
            rule = %decision.rule_id,
            "policy decision received"
        );
        Ok(decision)
    }
}

/// Stand-in when no policy URL is configured.
pub struct UnconfiguredPolicyEngine;

#[async_trait::async_trait]
impl PolicyEngine for UnconfiguredPolicyEngine {
    async fn evaluate(&self, _request: &PolicyRequest<'_>) -> LedgerResult<PolicyDecision> {
        Err(LedgerError::PolicyServiceUnavailable(
            "no policy service configured".to_string(),
        ))
    }
}

pub fn from_config(url: Option<&str>, timeout: Duration) -> LedgerResult<Arc<dyn PolicyEngine>> {
    match url {
        Some(url) => Ok(Arc::new(HttpPolicyEngine::new(url, timeout)?)),
        None => {
            warn!("POLICY_URL not set; every risk decision will be blocked");
            Ok(Arc::new(UnconfiguredPolicyEngine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use crate::shadow_ledger::ExposureLimits;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn fixtures() -> (OrderProposal, ClientExposureSummary) {
        let order = OrderProposal {
            client_id: "C1".into(),
            symbol: "X".into(),
            side: Side::Buy,
            qty: dec!(100),
            price: dec!(50),
            trace_id: None,
            account_id: None,
        };
        let summary = ClientExposureSummary {
            client_id: "C1".into(),
            positions: 0,
            gross_exposure: Decimal::ZERO,
            net_exposure: Decimal::ZERO,
            pending_exposure: Decimal::ZERO,
            limits: ExposureLimits {
                max_gross_exposure: dec!(1000000),
                max_net_exposure: dec!(500000),
            },
            gross_limit_breached: false,
            net_limit_breached: false,
        };
        (order, summary)
    }

    #[tokio::test]
    async fn test_unconfigured_engine_blocks() {
        let (order, exposure) = fixtures();
        let request = PolicyRequest {
            order: &order,
            exposure: &exposure,
        };
        let decision = evaluate_fail_closed(&UnconfiguredPolicyEngine, &request).await;
        assert!(!decision.allow);
        assert!(decision.is_fail_closed());
    }

    #[tokio::test]
    async fn test_unreachable_engine_blocks() {
        let (order, exposure) = fixtures();
        let request = PolicyRequest {
            order: &order,
            exposure: &exposure,
        };
        // Port 9 on loopback: nothing listens, connection is refused quickly
        let engine = HttpPolicyEngine::new("http://127.0.0.1:9/decide", Duration::from_millis(500))
            .unwrap();
        let decision = evaluate_fail_closed(&engine, &request).await;
        assert_eq!(decision.reason_code, POLICY_UNAVAILABLE_REASON);
    }

    #[test]
    fn test_request_serializes_order_and_exposure() {
        let (order, exposure) = fixtures();
        let body = serde_json::to_value(PolicyRequest {
            order: &order,
            exposure: &exposure,
        })
        .unwrap();
        assert_eq!(body["order"]["side"], "BUY");
        assert_eq!(body["exposure"]["client_id"], "C1");
    }
}
