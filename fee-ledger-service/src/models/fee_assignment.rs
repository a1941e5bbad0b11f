use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

/// Rounding slack when deciding whether a fee is fully paid, in currency units.
pub const FULL_PAYMENT_TOLERANCE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Ledger amounts are whole paise.
pub const MONEY_SCALE: u32 = 2;

/// Reject amounts with sub-paise precision. Trailing zeros are ignored, so
/// `100.000` passes and `100.005` does not.
pub fn ensure_money_scale(value: Decimal, field: &str) -> Result<Decimal, LedgerError> {
    let normalized = value.normalize();
    if normalized.scale() > MONEY_SCALE {
        return Err(LedgerError::Validation(format!(
            "{} {} has more than {} decimal places",
            field, value, MONEY_SCALE
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeStatus {
    Pending,
    Partial,
    Paid,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Partial => "PARTIAL",
            Self::Paid => "PAID",
        }
    }
}

impl fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeeStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PARTIAL" => Ok(Self::Partial),
            "PAID" => Ok(Self::Paid),
            other => Err(LedgerError::InvariantViolation(format!(
                "unknown fee status '{}'",
                other
            ))),
        }
    }
}

/// Status as a pure function of what has been paid against what is due.
///
/// Nothing paid is `Pending` even when the net due is zero; otherwise anything
/// within [`FULL_PAYMENT_TOLERANCE`] of the net due counts as `Paid`.
pub fn derive_fee_status(amount: Decimal, discount: Decimal, paid_amount: Decimal) -> FeeStatus {
    let due = amount - discount;
    if paid_amount.is_zero() {
        FeeStatus::Pending
    } else if paid_amount >= due - FULL_PAYMENT_TOLERANCE {
        FeeStatus::Paid
    } else {
        FeeStatus::Partial
    }
}

/// A student's instance of a fee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeAssignment {
    pub fee_assignment_id: Uuid,
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub fee_head_id: Uuid,
    pub amount: Decimal,
    pub discount: Decimal,
    pub paid_amount: Decimal,
    pub status: FeeStatus,
    pub due_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for assigning a fee to a student.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFeeAssignment {
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub fee_head_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub due_date: Option<NaiveDate>,
}

impl FeeAssignment {
    /// Build a fresh, unpaid assignment after validating amount and discount.
    pub fn new(input: &NewFeeAssignment, now: DateTime<Utc>) -> Result<Self, LedgerError> {
        ensure_money_scale(input.amount, "fee amount")?;
        ensure_money_scale(input.discount, "discount")?;
        if input.amount < Decimal::ZERO {
            return Err(LedgerError::Validation(
                "fee amount must not be negative".to_string(),
            ));
        }
        if input.discount < Decimal::ZERO || input.discount > input.amount {
            return Err(LedgerError::Validation(format!(
                "discount {} must be between 0 and the fee amount {}",
                input.discount, input.amount
            )));
        }

        Ok(Self {
            fee_assignment_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            student_id: input.student_id,
            fee_head_id: input.fee_head_id,
            amount: input.amount,
            discount: input.discount,
            paid_amount: Decimal::ZERO,
            status: FeeStatus::Pending,
            due_date: input.due_date,
            created_utc: now,
            updated_utc: now,
        })
    }

    /// Net amount owed once the discount is applied.
    pub fn net_due(&self) -> Decimal {
        self.amount - self.discount
    }

    /// What is still owed, never below zero.
    pub fn outstanding(&self) -> Decimal {
        (self.net_due() - self.paid_amount).max(Decimal::ZERO)
    }

    /// Split an incoming `amount` into what this fee can absorb and the excess.
    ///
    /// Anything within [`FULL_PAYMENT_TOLERANCE`] of the remaining room is
    /// applied whole; beyond that only the outstanding part is.
    pub fn split_incoming(&self, amount: Decimal) -> (Decimal, Decimal) {
        let room = self.net_due() + FULL_PAYMENT_TOLERANCE - self.paid_amount;
        if amount <= room {
            (amount, Decimal::ZERO)
        } else {
            let applied = self.outstanding().min(amount);
            (applied, amount - applied)
        }
    }

    /// Credit `amount` against the fee and re-derive its status.
    ///
    /// Paying beyond the net due (plus tolerance) is refused: it would break
    /// the `paid_amount <= amount - discount` invariant.
    pub fn apply_payment(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvariantViolation(format!(
                "payment amount {} applied to fee {} must be positive",
                amount, self.fee_assignment_id
            )));
        }

        let paid = self.paid_amount + amount;
        if paid > self.net_due() + FULL_PAYMENT_TOLERANCE {
            return Err(LedgerError::InvariantViolation(format!(
                "fee {} would be overpaid: paid {} against net due {}",
                self.fee_assignment_id,
                paid,
                self.net_due()
            )));
        }

        self.set_paid(paid, now);
        Ok(())
    }

    /// Take `amount` back off the fee and re-derive its status.
    ///
    /// A negative result is a bookkeeping bug and is never clamped.
    pub fn revert_payment(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let paid = self.paid_amount - amount;
        if paid < Decimal::ZERO {
            return Err(LedgerError::InvariantViolation(format!(
                "fee {} paid amount would become negative: {} - {}",
                self.fee_assignment_id, self.paid_amount, amount
            )));
        }

        self.set_paid(paid, now);
        Ok(())
    }

    fn set_paid(&mut self, paid: Decimal, now: DateTime<Utc>) {
        self.paid_amount = paid;
        self.status = derive_fee_status(self.amount, self.discount, paid);
        self.updated_utc = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn assignment(amount: i64, discount: i64) -> FeeAssignment {
        FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                fee_head_id: Uuid::new_v4(),
                amount: dec(amount),
                discount: dec(discount),
                due_date: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn status_is_pending_only_when_nothing_paid() {
        assert_eq!(derive_fee_status(dec(5000), dec(500), dec(0)), FeeStatus::Pending);
        assert_eq!(derive_fee_status(dec(5000), dec(500), dec(1)), FeeStatus::Partial);
    }

    #[test]
    fn status_is_paid_within_half_unit_of_net_due() {
        let just_under = Decimal::new(449_950, 2); // 4499.50
        let too_far = Decimal::new(449_949, 2); // 4499.49

        assert_eq!(derive_fee_status(dec(5000), dec(500), dec(4500)), FeeStatus::Paid);
        assert_eq!(derive_fee_status(dec(5000), dec(500), just_under), FeeStatus::Paid);
        assert_eq!(derive_fee_status(dec(5000), dec(500), too_far), FeeStatus::Partial);
    }

    #[test]
    fn status_derivation_holds_across_paid_range() {
        let (amount, discount) = (dec(1200), dec(200));
        let due = amount - discount;
        let mut paid = Decimal::ZERO;
        let step = Decimal::new(2_50, 2);

        while paid <= due {
            let expected = if paid.is_zero() {
                FeeStatus::Pending
            } else if paid >= due - FULL_PAYMENT_TOLERANCE {
                FeeStatus::Paid
            } else {
                FeeStatus::Partial
            };
            assert_eq!(derive_fee_status(amount, discount, paid), expected, "paid = {}", paid);
            paid += step;
        }
    }

    #[test]
    fn rejects_discount_larger_than_amount() {
        let err = FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                fee_head_id: Uuid::new_v4(),
                amount: dec(100),
                discount: dec(101),
                due_date: None,
            },
            Utc::now(),
        )
        .unwrap_err();

        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn partial_payments_accumulate_into_paid() {
        let mut fee = assignment(5000, 0);

        fee.apply_payment(dec(2000), Utc::now()).unwrap();
        assert_eq!(fee.status, FeeStatus::Partial);
        assert_eq!(fee.outstanding(), dec(3000));

        fee.apply_payment(dec(3000), Utc::now()).unwrap();
        assert_eq!(fee.status, FeeStatus::Paid);
        assert_eq!(fee.outstanding(), Decimal::ZERO);
    }

    #[test]
    fn overpayment_is_an_invariant_violation() {
        let mut fee = assignment(1000, 0);
        fee.apply_payment(dec(900), Utc::now()).unwrap();

        let err = fee.apply_payment(dec(101), Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
        assert_eq!(fee.paid_amount, dec(900));
    }

    #[test]
    fn incoming_amount_beyond_outstanding_is_split_off() {
        let mut fee = assignment(1000, 0);
        fee.apply_payment(dec(600), Utc::now()).unwrap();

        assert_eq!(fee.split_incoming(dec(300)), (dec(300), dec(0)));
        assert_eq!(fee.split_incoming(dec(600)), (dec(400), dec(200)));
        assert_eq!(
            fee.split_incoming(Decimal::new(400_40, 2)),
            (Decimal::new(400_40, 2), dec(0))
        );

        fee.apply_payment(dec(400), Utc::now()).unwrap();
        assert_eq!(fee.split_incoming(dec(250)), (dec(0), dec(250)));
    }

    #[test]
    fn sub_paise_amounts_are_rejected() {
        assert!(ensure_money_scale(Decimal::new(100_05, 2), "amount").is_ok());
        assert!(ensure_money_scale(Decimal::new(100_000, 3), "amount").is_ok());
        assert!(matches!(
            ensure_money_scale(Decimal::new(100_005, 3), "amount"),
            Err(LedgerError::Validation(_))
        ));

        let err = FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                fee_head_id: Uuid::new_v4(),
                amount: Decimal::new(1000_001, 3),
                discount: dec(0),
                due_date: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn reverting_below_zero_fails_loudly() {
        let mut fee = assignment(1000, 0);
        fee.apply_payment(dec(100), Utc::now()).unwrap();

        let err = fee.revert_payment(dec(150), Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
        assert_eq!(fee.paid_amount, dec(100));

        fee.revert_payment(dec(100), Utc::now()).unwrap();
        assert_eq!(fee.status, FeeStatus::Pending);
    }
}
