use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationKind {
    Refund,
    MoveToAdvance,
}

impl CompensationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refund => "REFUND",
            Self::MoveToAdvance => "MOVE_TO_ADVANCE",
        }
    }
}

impl FromStr for CompensationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REFUND" => Ok(Self::Refund),
            "MOVE_TO_ADVANCE" => Ok(Self::MoveToAdvance),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown compensation kind '{}'",
                other
            ))),
        }
    }
}

/// Audit row written by every refund and move-to-advance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationEntry {
    pub compensation_id: Uuid,
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub kind: CompensationKind,
    pub amount: Decimal,
    pub reason: String,
    pub actor: String,
    pub created_utc: DateTime<Utc>,
}
