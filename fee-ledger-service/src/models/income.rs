use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::PaymentMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomeSource {
    Fee,
    FeeRefund,
}

impl IncomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fee => "FEE",
            Self::FeeRefund => "FEE_REFUND",
        }
    }
}

impl FromStr for IncomeSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FEE" => Ok(Self::Fee),
            "FEE_REFUND" => Ok(Self::FeeRefund),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown income source '{}'",
                other
            ))),
        }
    }
}

/// Append-only revenue row. Refunds are negative rows, never edits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeEntry {
    pub income_id: Uuid,
    pub tenant_id: Uuid,
    pub source: IncomeSource,
    pub amount: Decimal,
    pub entry_utc: DateTime<Utc>,
    pub reference: String,
    pub payment_id: Uuid,
    pub remarks: Option<String>,
}

impl IncomeEntry {
    pub fn fee_received(
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reference: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            income_id: Uuid::new_v4(),
            tenant_id,
            source: IncomeSource::Fee,
            amount,
            entry_utc: now,
            reference,
            payment_id,
            remarks: Some("Online fee payment".to_string()),
        }
    }

    /// Income for a payment taken at the school office.
    pub fn fee_collected(
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reference: String,
        method: PaymentMethod,
        remarks: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let label = format!("Fee collected ({})", method);
        let remarks = match remarks.map(str::trim).filter(|r| !r.is_empty()) {
            Some(extra) => format!("{}: {}", label, extra),
            None => label,
        };
        Self {
            income_id: Uuid::new_v4(),
            tenant_id,
            source: IncomeSource::Fee,
            amount,
            entry_utc: now,
            reference,
            payment_id,
            remarks: Some(remarks),
        }
    }

    pub fn fee_refunded(
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reference: String,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            income_id: Uuid::new_v4(),
            tenant_id,
            source: IncomeSource::FeeRefund,
            amount: -amount.abs(),
            entry_utc: now,
            reference,
            payment_id,
            remarks: Some(format!("Refund: {}", reason)),
        }
    }
}

/// Optional `[from, to)` window for income listings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct IncomeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl IncomeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}
