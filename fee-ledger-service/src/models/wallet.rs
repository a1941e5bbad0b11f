use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

/// Per-student credit pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvanceBalance {
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub balance: Decimal,
    pub updated_utc: DateTime<Utc>,
}

impl AdvanceBalance {
    pub fn empty(tenant_id: Uuid, student_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            student_id,
            balance: Decimal::ZERO,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletDirection {
    Credit,
    Debit,
}

impl WalletDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
        }
    }
}

impl FromStr for WalletDirection {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(Self::Credit),
            "DEBIT" => Ok(Self::Debit),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown wallet direction '{}'",
                other
            ))),
        }
    }
}

/// Journal row for every wallet movement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletTransaction {
    pub wallet_txn_id: Uuid,
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub direction: WalletDirection,
    pub amount: Decimal,
    /// Payment id for credits, fee assignment id for debits.
    pub source_ref: Uuid,
    pub actor: String,
    pub balance_after: Decimal,
    pub created_utc: DateTime<Utc>,
}
