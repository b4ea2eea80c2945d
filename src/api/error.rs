use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::error::LedgerError;

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    NotFound(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Ledger(err) => match err {
                LedgerError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
                LedgerError::ArithmeticOverflow { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "ARITHMETIC_OVERFLOW")
                }
                LedgerError::IdempotencyUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "IDEMPOTENCY_UNAVAILABLE")
                }
                LedgerError::PolicyServiceUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "POLICY_SERVICE_UNAVAILABLE")
                }
                LedgerError::ChainIntegrityViolation { .. } => {
                    (StatusCode::CONFLICT, "CHAIN_INTEGRITY_VIOLATION")
                }
                LedgerError::AggregationInconsistency { .. } => {
                    (StatusCode::CONFLICT, "AGGREGATION_INCONSISTENCY")
                }
                LedgerError::PartitionHalted { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "PARTITION_HALTED")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_FAILED"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = match &self {
            ApiError::NotFound(msg) => json!({ "error": msg, "code": code }),
            ApiError::Ledger(LedgerError::Validation(errors)) => json!({
                "status": "rejected",
                "error": "validation failed",
                "code": code,
                "errors": errors,
            }),
            ApiError::Ledger(err) => {
                if status.is_server_error() {
                    tracing::error!(code, error = %err, "request failed");
                }
                json!({ "status": "failed", "error": err.to_string(), "code": code })
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldError;
    use crate::models::ChainStream;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(LedgerError::Validation(vec![FieldError::new("qty", "bad")])),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(LedgerError::IdempotencyUnavailable("locked".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(LedgerError::PartitionHalted {
                    stream: ChainStream::Audit,
                    partition: "t".into(),
                    reason: "r".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(LedgerError::ArithmeticOverflow {
                    operation: "gross exposure",
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
