use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

/// The only currency the ledger books.
pub const LEDGER_CURRENCY: &str = "INR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

/// How the money reached the school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Gateway checkout, confirmed by webhook.
    Online,
    Cash,
    Cheque,
    BankTransfer,
    Upi,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Cash => "CASH",
            Self::Cheque => "CHEQUE",
            Self::BankTransfer => "BANK_TRANSFER",
            Self::Upi => "UPI",
            Self::Card => "CARD",
        }
    }

    pub fn is_offline(&self) -> bool {
        !matches!(self, Self::Online)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "CASH" => Ok(Self::Cash),
            "CHEQUE" => Ok(Self::Cheque),
            "BANK_TRANSFER" => Ok(Self::BankTransfer),
            "UPI" => Ok(Self::Upi),
            "CARD" => Ok(Self::Card),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown payment method '{}'",
                other
            ))),
        }
    }
}

/// Payout state of a captured payment, tracked apart from fee settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitStatus {
    None,
    Pending,
    Success,
    Failed,
}

impl SplitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Transfers only ever resolve to `Success` or `Failed`. A processed
    /// transfer is final; a failed one may still be retried to success.
    pub fn can_transition_to(&self, next: SplitStatus) -> bool {
        match next {
            Self::None | Self::Pending => false,
            Self::Failed => !matches!(self, Self::Success),
            Self::Success => true,
        }
    }
}

impl fmt::Display for SplitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Self::None),
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown split status '{}'",
                other
            ))),
        }
    }
}

/// Platform commission on `amount` at `percent`, rounded half away from
/// zero to whole paise.
pub fn platform_fee_for(amount: Decimal, percent: Decimal) -> Decimal {
    (amount * percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One attempted or completed payment against a fee assignment.
///
/// `amount` is what the payer handed over. `advance_amount` is the part of
/// it that went to the student's advance wallet because the fee could not
/// absorb it; the rest was applied to the fee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub fee_assignment_id: Uuid,
    pub amount: Decimal,
    pub advance_amount: Decimal,
    pub method: PaymentMethod,
    pub platform_fee: Decimal,
    pub school_share: Decimal,
    pub status: PaymentStatus,
    pub gateway_transaction_id: String,
    pub bank_ref_no: Option<String>,
    #[serde(skip_serializing)]
    pub gateway_response_raw: Option<serde_json::Value>,
    pub transfer_id: Option<String>,
    pub split_status: SplitStatus,
    pub redirected_to_advance: bool,
    pub collected_by: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        amount: Decimal,
        gateway_transaction_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_id: Uuid::new_v4(),
            tenant_id,
            fee_assignment_id,
            amount,
            advance_amount: Decimal::ZERO,
            method: PaymentMethod::Online,
            platform_fee: Decimal::ZERO,
            school_share: amount,
            status: PaymentStatus::Pending,
            gateway_transaction_id,
            bank_ref_no: None,
            gateway_response_raw: None,
            transfer_id: None,
            split_status: SplitStatus::None,
            redirected_to_advance: false,
            collected_by: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// A payment taken at the school office. It is complete on creation and
    /// carries no platform commission.
    pub fn collected(
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        receipt_reference: String,
        collected_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::pending(tenant_id, fee_assignment_id, amount, receipt_reference, now);
        record.method = method;
        record.status = PaymentStatus::Completed;
        record.collected_by = Some(collected_by.to_string());
        record
    }

    /// Record the platform's cut at `percent`; the school keeps the rest.
    pub fn with_commission(mut self, percent: Decimal) -> Self {
        self.platform_fee = platform_fee_for(self.amount, percent);
        self.school_share = self.amount - self.platform_fee;
        self
    }

    /// The part of `amount` that was credited to the fee itself.
    pub fn applied_amount(&self) -> Decimal {
        self.amount - self.advance_amount
    }

    /// Guard shared by refund and move-to-advance: only a completed,
    /// not yet redirected payment can be compensated.
    pub fn ensure_compensable(&self) -> Result<(), LedgerError> {
        match self.status {
            PaymentStatus::Refunded => Err(LedgerError::AlreadyRefunded(self.payment_id)),
            PaymentStatus::Pending => Err(LedgerError::NotCompleted(self.payment_id)),
            PaymentStatus::Completed if self.redirected_to_advance => {
                Err(LedgerError::AlreadyRedirected(self.payment_id))
            }
            PaymentStatus::Completed => Ok(()),
        }
    }
}

/// Input for registering a checkout before the gateway confirms it.
#[derive(Debug, Clone)]
pub struct NewPendingPayment {
    pub fee_assignment_id: Uuid,
    pub amount: Decimal,
    pub gateway_transaction_id: String,
    /// Ask the gateway to route the school's share to its linked account.
    pub split_settlement: bool,
}
