//! Domain errors for ledger operations.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PlanFeature;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("webhook authentication failed: {0}")]
    Auth(String),

    #[error("caller is not verified: {0}")]
    Unverified(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("plan feature {0} is not enabled for this tenant")]
    FeatureDisabled(PlanFeature),

    #[error("no pending payment for gateway transaction '{0}'")]
    UnknownTransaction(String),

    #[error("payment {payment_id} for gateway transaction '{gateway_transaction_id}' was already processed")]
    AlreadyProcessed {
        gateway_transaction_id: String,
        payment_id: Uuid,
    },

    #[error("payment {0} is already refunded")]
    AlreadyRefunded(Uuid),

    #[error("payment {0} was already moved to the advance balance")]
    AlreadyRedirected(Uuid),

    #[error("payment {0} is not completed")]
    NotCompleted(Uuid),

    #[error("amount mismatch for '{gateway_transaction_id}': recorded {recorded}, event {received}")]
    AmountMismatch {
        gateway_transaction_id: String,
        recorded: rust_decimal::Decimal,
        received: rust_decimal::Decimal,
    },

    #[error("currency mismatch for '{gateway_transaction_id}': ledger books {expected}, event {received}")]
    CurrencyMismatch {
        gateway_transaction_id: String,
        expected: String,
        received: String,
    },

    #[error("insufficient advance balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock contention: {0}")]
    Contention(String),

    #[error("storage failure: {0}")]
    TransientStorage(String),
}

impl LedgerError {
    /// Business outcomes the gateway should see acknowledged rather than retried.
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(
            self,
            LedgerError::UnknownTransaction(_)
                | LedgerError::AlreadyProcessed { .. }
                | LedgerError::AmountMismatch { .. }
                | LedgerError::CurrencyMismatch { .. }
        )
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::Auth(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            LedgerError::Unverified(_) => AppError::Unauthorized(anyhow::anyhow!(message)),
            LedgerError::TenantNotFound(_) | LedgerError::NotFound(_) => {
                AppError::NotFound(anyhow::anyhow!(message))
            }
            LedgerError::UnknownTransaction(_) => AppError::NotFound(anyhow::anyhow!(message)),
            LedgerError::FeatureDisabled(_) => AppError::Forbidden(anyhow::anyhow!(message)),
            LedgerError::AlreadyProcessed { .. }
            | LedgerError::AlreadyRefunded(_)
            | LedgerError::AlreadyRedirected(_)
            | LedgerError::NotCompleted(_)
            | LedgerError::Conflict(_) => AppError::Conflict(anyhow::anyhow!(message)),
            LedgerError::AmountMismatch { .. }
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::InsufficientBalance { .. } => {
                AppError::Unprocessable(anyhow::anyhow!(message))
            }
            LedgerError::Validation(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            LedgerError::InvariantViolation(_) => {
                AppError::InternalError(anyhow::anyhow!(message))
            }
            LedgerError::Contention(_) => AppError::ServiceUnavailable,
            LedgerError::TransientStorage(_) => AppError::DatabaseError(anyhow::anyhow!(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use rust_decimal::Decimal;

    #[test]
    fn maps_ledger_errors_to_http_status() {
        let cases = [
            (LedgerError::Auth("bad signature".into()), StatusCode::BAD_REQUEST),
            (
                LedgerError::Unverified("unsigned override".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (LedgerError::TenantNotFound("acme".into()), StatusCode::NOT_FOUND),
            (
                LedgerError::FeatureDisabled(PlanFeature::AdvanceWallet),
                StatusCode::FORBIDDEN,
            ),
            (LedgerError::AlreadyRefunded(Uuid::nil()), StatusCode::CONFLICT),
            (
                LedgerError::InsufficientBalance {
                    available: Decimal::ZERO,
                    requested: Decimal::ONE,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (LedgerError::Validation("reason".into()), StatusCode::BAD_REQUEST),
            (
                LedgerError::InvariantViolation("negative".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (LedgerError::Contention("40P01".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn only_gateway_outcomes_are_acknowledgeable() {
        assert!(LedgerError::UnknownTransaction("order_x".into()).is_acknowledgeable());
        assert!(LedgerError::AlreadyProcessed {
            gateway_transaction_id: "order_x".into(),
            payment_id: Uuid::nil(),
        }
        .is_acknowledgeable());
        assert!(LedgerError::CurrencyMismatch {
            gateway_transaction_id: "order_x".into(),
            expected: "INR".into(),
            received: "USD".into(),
        }
        .is_acknowledgeable());
        assert!(!LedgerError::TransientStorage("down".into()).is_acknowledgeable());
        assert!(!LedgerError::Auth("bad".into()).is_acknowledgeable());
    }
}
