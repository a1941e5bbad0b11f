//! Compensation manager: refunds and move-to-advance.
//!
//! Both reverse a reconciled payment's effect on its fee without deleting
//! anything: the payment keeps its history, refunds add a negative income
//! row, and every action is written to the compensation log with its reason
//! and actor. A payment that was partly credited to the advance wallet at
//! capture has that part reversed from the wallet.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    AdvanceBalance, CompensationEntry, CompensationKind, FeeAssignment, IncomeEntry,
    PaymentRecord, PaymentStatus, PlanFeature, Tenant,
};
use crate::services::metrics::{record_alert, COMPENSATIONS_TOTAL};
use crate::services::retry::{with_lock_retry, LockRetryPolicy};
use crate::services::store::LedgerStore;
use crate::services::wallet;

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub payment: PaymentRecord,
    pub assignment: FeeAssignment,
    pub income_entry: IncomeEntry,
    /// Wallet after the advance part of the payment was taken back, if any.
    pub balance: Option<AdvanceBalance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveToAdvanceResult {
    pub payment: PaymentRecord,
    pub assignment: FeeAssignment,
    pub balance: AdvanceBalance,
}

#[derive(Clone)]
pub struct CompensationManager {
    store: Arc<dyn LedgerStore>,
    retry: LockRetryPolicy,
}

fn require_text(value: &str, field: &str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn compensation_entry(
    payment: &PaymentRecord,
    kind: CompensationKind,
    amount: Decimal,
    reason: &str,
    actor: &str,
) -> CompensationEntry {
    CompensationEntry {
        compensation_id: Uuid::new_v4(),
        tenant_id: payment.tenant_id,
        payment_id: payment.payment_id,
        kind,
        amount,
        reason: reason.to_string(),
        actor: actor.to_string(),
        created_utc: payment.updated_utc,
    }
}

impl CompensationManager {
    pub fn new(store: Arc<dyn LedgerStore>, retry: LockRetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Refund a completed payment in full.
    ///
    /// Whatever part of it sits in the advance wallet must still be there;
    /// otherwise the refund fails with `InsufficientBalance`.
    #[instrument(skip(self, tenant, reason), fields(tenant_id = %tenant.tenant_id, payment_id = %payment_id))]
    pub async fn refund(
        &self,
        tenant: &Tenant,
        payment_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<RefundResult, LedgerError> {
        let reason = require_text(reason, "reason")?;
        let actor = require_text(actor, "actor")?;
        let tenant_id = tenant.tenant_id;

        let result = with_lock_retry(&self.retry, "refund", || {
            self.refund_once(tenant_id, payment_id, &reason, &actor)
        })
        .await;
        self.record("refund", &result);
        let refunded = result?;

        tracing::info!(
            target: "audit",
            tenant_id = %tenant_id,
            payment_id = %payment_id,
            amount = %refunded.payment.amount,
            actor = %actor,
            reason = %reason,
            "Payment refunded"
        );
        Ok(refunded)
    }

    async fn refund_once(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<RefundResult, LedgerError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))?;
        payment.ensure_compensable()?;

        let mut assignment = tx
            .lock_fee_assignment(tenant_id, payment.fee_assignment_id)
            .await?
            .ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "payment {} references missing fee assignment {}",
                    payment_id, payment.fee_assignment_id
                ))
            })?;

        let applied = payment.applied_amount();
        if applied > Decimal::ZERO {
            assignment.revert_payment(applied, now)?;
        }
        let balance = if payment.advance_amount > Decimal::ZERO {
            Some(
                wallet::debit(
                    tx.as_mut(),
                    tenant_id,
                    assignment.student_id,
                    payment.advance_amount,
                    payment.payment_id,
                    actor,
                    now,
                )
                .await?,
            )
        } else {
            None
        };
        payment.status = PaymentStatus::Refunded;
        payment.updated_utc = now;

        let income_entry = IncomeEntry::fee_refunded(
            tenant_id,
            payment_id,
            payment.amount,
            payment
                .bank_ref_no
                .clone()
                .unwrap_or_else(|| payment.gateway_transaction_id.clone()),
            reason,
            now,
        );

        tx.update_payment(&payment).await?;
        tx.update_fee_assignment(&assignment).await?;
        tx.insert_income(&income_entry).await?;
        tx.insert_compensation(&compensation_entry(
            &payment,
            CompensationKind::Refund,
            payment.amount,
            reason,
            actor,
        ))
        .await?;
        tx.commit().await?;

        Ok(RefundResult {
            payment,
            assignment,
            income_entry,
            balance,
        })
    }

    /// Take a completed payment off its fee and credit it to the student's
    /// advance balance instead.
    ///
    /// The payment stays COMPLETED and is tagged as redirected; no income row
    /// is written since the money was already recognised. Only the part that
    /// was applied to the fee moves; any capture excess is already in the
    /// wallet.
    #[instrument(skip(self, tenant, reason), fields(tenant_id = %tenant.tenant_id, payment_id = %payment_id))]
    pub async fn move_to_advance(
        &self,
        tenant: &Tenant,
        payment_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<MoveToAdvanceResult, LedgerError> {
        tenant.require_feature(PlanFeature::AdvanceWallet)?;
        let reason = require_text(reason, "reason")?;
        let actor = require_text(actor, "actor")?;
        let tenant_id = tenant.tenant_id;

        let result = with_lock_retry(&self.retry, "move_to_advance", || {
            self.move_once(tenant_id, payment_id, &reason, &actor)
        })
        .await;
        self.record("move_to_advance", &result);
        let moved = result?;

        tracing::info!(
            target: "audit",
            tenant_id = %tenant_id,
            payment_id = %payment_id,
            amount = %moved.payment.applied_amount(),
            balance = %moved.balance.balance,
            actor = %actor,
            reason = %reason,
            "Payment moved to advance balance"
        );
        Ok(moved)
    }

    async fn move_once(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<MoveToAdvanceResult, LedgerError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))?;
        payment.ensure_compensable()?;
        let applied = payment.applied_amount();
        if applied <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "payment {} was credited to the advance balance in full",
                payment_id
            )));
        }

        let mut assignment = tx
            .lock_fee_assignment(tenant_id, payment.fee_assignment_id)
            .await?
            .ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "payment {} references missing fee assignment {}",
                    payment_id, payment.fee_assignment_id
                ))
            })?;

        let opening = tx
            .lock_advance_balance(tenant_id, assignment.student_id)
            .await?;
        let position_before = assignment.paid_amount + opening.balance;

        assignment.revert_payment(applied, now)?;
        tx.update_fee_assignment(&assignment).await?;

        let balance = wallet::credit(
            tx.as_mut(),
            tenant_id,
            assignment.student_id,
            applied,
            payment.payment_id,
            actor,
            now,
        )
        .await?;

        let position_after = assignment.paid_amount + balance.balance;
        if position_after != position_before {
            return Err(LedgerError::InvariantViolation(format!(
                "move to advance for payment {} changed the student position from {} to {}",
                payment_id, position_before, position_after
            )));
        }

        payment.redirected_to_advance = true;
        payment.updated_utc = now;
        tx.update_payment(&payment).await?;
        tx.insert_compensation(&compensation_entry(
            &payment,
            CompensationKind::MoveToAdvance,
            applied,
            reason,
            actor,
        ))
        .await?;
        tx.commit().await?;

        Ok(MoveToAdvanceResult {
            payment,
            assignment,
            balance,
        })
    }

    fn record<T>(&self, kind: &str, result: &Result<T, LedgerError>) {
        let status = match result {
            Ok(_) => "ok",
            Err(LedgerError::AlreadyRefunded(_)) => "already_refunded",
            Err(LedgerError::AlreadyRedirected(_)) => "already_redirected",
            Err(LedgerError::NotCompleted(_)) => "not_completed",
            Err(LedgerError::InsufficientBalance { .. }) => "insufficient_balance",
            Err(LedgerError::InvariantViolation(detail)) => {
                record_alert("invariant_violation");
                tracing::error!(target: "audit", kind, detail = %detail, "Compensation aborted");
                "invariant_violation"
            }
            Err(_) => "error",
        };
        COMPENSATIONS_TOTAL.with_label_values(&[kind, status]).inc();
    }
}
