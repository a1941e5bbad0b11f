//! Reconciliation engine: applies gateway payment events to the ledger.
//!
//! Every effect of a capture (payment status, fee balance, advance credit,
//! income row) lands in one transaction. Redelivered events find the payment
//! already settled and change nothing.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    ensure_money_scale, FeeAssignment, IncomeEntry, NewPendingPayment, PaymentRecord,
    PaymentStatus, PlanFeature, SplitStatus, Tenant, FULL_PAYMENT_TOLERANCE, LEDGER_CURRENCY,
};
use crate::services::metrics::{record_alert, RECONCILIATIONS_TOTAL};
use crate::services::retry::{with_lock_retry, LockRetryPolicy};
use crate::services::store::LedgerStore;
use crate::services::wallet;

/// Actor recorded on wallet movements the gateway caused.
pub const GATEWAY_ACTOR: &str = "gateway:razorpay";

/// How long an unconfirmed checkout holds its share of a fee.
pub const DEFAULT_CHECKOUT_TTL_MINUTES: i64 = 30;

/// A verified `payment.captured` event.
#[derive(Debug, Clone)]
pub struct PaymentCaptured {
    /// Gateway order id the pending payment was registered under.
    pub gateway_transaction_id: String,
    /// Gateway payment id, stored as the bank reference.
    pub gateway_payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Processed,
    Failed,
}

/// A verified `transfer.processed` or `transfer.failed` event.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    /// Payment id or order id the transfer was made from.
    pub source_reference: String,
    pub transfer_id: String,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Applied {
        payment: PaymentRecord,
        assignment: FeeAssignment,
        /// Part of the capture the fee could not absorb, now in the wallet.
        advance_credited: Decimal,
    },
    AlreadyProcessed {
        payment_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransferApplied {
    Updated { payment_id: Uuid, split_status: SplitStatus },
    Unchanged { payment_id: Uuid, split_status: SplitStatus },
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    retry: LockRetryPolicy,
    checkout_ttl: Duration,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, retry: LockRetryPolicy) -> Self {
        Self {
            store,
            retry,
            checkout_ttl: Duration::minutes(DEFAULT_CHECKOUT_TTL_MINUTES),
        }
    }

    /// Pending checkouts older than `ttl` stop reserving part of the fee.
    /// A late capture of one is still reconciled; its excess goes to the wallet.
    pub fn with_checkout_ttl(mut self, ttl: Duration) -> Self {
        self.checkout_ttl = ttl;
        self
    }

    /// Record a PENDING payment when a checkout is started.
    #[instrument(skip(self, tenant, input), fields(tenant_id = %tenant.tenant_id, gateway_transaction_id = %input.gateway_transaction_id))]
    pub async fn register_pending_payment(
        &self,
        tenant: &Tenant,
        input: &NewPendingPayment,
    ) -> Result<PaymentRecord, LedgerError> {
        tenant.require_feature(PlanFeature::OnlinePayments)?;
        if input.split_settlement {
            tenant.require_feature(PlanFeature::SplitSettlement)?;
        }
        ensure_money_scale(input.amount, "payment amount")?;
        if input.amount <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "payment amount must be positive, got {}",
                input.amount
            )));
        }
        if input.gateway_transaction_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "gateway transaction id is required".to_string(),
            ));
        }

        let payment = with_lock_retry(&self.retry, "register_pending_payment", || {
            self.register_once(tenant, input)
        })
        .await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            fee_assignment_id = %payment.fee_assignment_id,
            amount = %payment.amount,
            platform_fee = %payment.platform_fee,
            split_status = %payment.split_status,
            "Pending payment registered"
        );
        Ok(payment)
    }

    async fn register_once(
        &self,
        tenant: &Tenant,
        input: &NewPendingPayment,
    ) -> Result<PaymentRecord, LedgerError> {
        let tenant_id = tenant.tenant_id;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let assignment = tx
            .lock_fee_assignment(tenant_id, input.fee_assignment_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("fee assignment {}", input.fee_assignment_id))
            })?;

        // Checkouts still in flight already claim part of what is owed.
        let in_flight = tx
            .sum_pending_payments(tenant_id, assignment.fee_assignment_id, now - self.checkout_ttl)
            .await?;
        let available = assignment.outstanding() - in_flight;
        if input.amount > available + FULL_PAYMENT_TOLERANCE {
            return Err(LedgerError::Validation(format!(
                "payment {} exceeds outstanding {} less {} in open checkouts on fee {}",
                input.amount,
                assignment.outstanding(),
                in_flight,
                assignment.fee_assignment_id
            )));
        }

        let mut payment = PaymentRecord::pending(
            tenant_id,
            assignment.fee_assignment_id,
            input.amount,
            input.gateway_transaction_id.trim().to_string(),
            now,
        )
        .with_commission(tenant.commission_percent);
        if input.split_settlement {
            payment.split_status = SplitStatus::Pending;
        }
        tx.insert_payment(&payment).await?;
        tx.commit().await?;

        Ok(payment)
    }

    /// Settle the pending payment a capture event refers to.
    ///
    /// Redelivery of an already settled payment is `AlreadyProcessed`, not an
    /// error. An unknown transaction or a mismatched amount or currency is
    /// returned as an error after being logged and counted; the caller decides
    /// how to acknowledge it.
    ///
    /// Whatever the fee can no longer absorb, because another payment settled
    /// it first, is credited to the student's advance wallet.
    #[instrument(skip(self, tenant, event), fields(tenant_id = %tenant.tenant_id, gateway_transaction_id = %event.gateway_transaction_id))]
    pub async fn apply_payment_captured(
        &self,
        tenant: &Tenant,
        event: &PaymentCaptured,
    ) -> Result<CaptureOutcome, LedgerError> {
        let tenant_id = tenant.tenant_id;
        let result = with_lock_retry(&self.retry, "apply_payment_captured", || {
            self.capture_once(tenant_id, event)
        })
        .await;

        match result {
            Ok(outcome) => {
                RECONCILIATIONS_TOTAL.with_label_values(&["applied"]).inc();
                Ok(outcome)
            }
            Err(LedgerError::AlreadyProcessed { payment_id, .. }) => {
                RECONCILIATIONS_TOTAL
                    .with_label_values(&["already_processed"])
                    .inc();
                tracing::info!(payment_id = %payment_id, "Duplicate capture ignored");
                Ok(CaptureOutcome::AlreadyProcessed { payment_id })
            }
            Err(e) => {
                let kind = match &e {
                    LedgerError::UnknownTransaction(_) => "unknown_transaction",
                    LedgerError::AmountMismatch { .. } => "amount_mismatch",
                    LedgerError::CurrencyMismatch { .. } => "currency_mismatch",
                    LedgerError::InvariantViolation(_) => "invariant_violation",
                    _ => "error",
                };
                RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
                if kind != "error" {
                    record_alert(kind);
                    tracing::error!(target: "audit", error = %e, kind, "Capture could not be reconciled");
                } else {
                    tracing::error!(error = %e, "Capture failed");
                }
                Err(e)
            }
        }
    }

    async fn capture_once(
        &self,
        tenant_id: Uuid,
        event: &PaymentCaptured,
    ) -> Result<CaptureOutcome, LedgerError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment_by_gateway_id(tenant_id, &event.gateway_transaction_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownTransaction(event.gateway_transaction_id.clone()))?;

        if payment.status != PaymentStatus::Pending {
            return Err(LedgerError::AlreadyProcessed {
                gateway_transaction_id: event.gateway_transaction_id.clone(),
                payment_id: payment.payment_id,
            });
        }

        if !event.currency.eq_ignore_ascii_case(LEDGER_CURRENCY) {
            return Err(LedgerError::CurrencyMismatch {
                gateway_transaction_id: event.gateway_transaction_id.clone(),
                expected: LEDGER_CURRENCY.to_string(),
                received: event.currency.clone(),
            });
        }

        if payment.amount != event.amount {
            return Err(LedgerError::AmountMismatch {
                gateway_transaction_id: event.gateway_transaction_id.clone(),
                recorded: payment.amount,
                received: event.amount,
            });
        }

        let mut assignment = tx
            .lock_fee_assignment(tenant_id, payment.fee_assignment_id)
            .await?
            .ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "payment {} references missing fee assignment {}",
                    payment.payment_id, payment.fee_assignment_id
                ))
            })?;

        let (applied, excess) = assignment.split_incoming(payment.amount);
        if applied > Decimal::ZERO {
            assignment.apply_payment(applied, now)?;
        }
        if excess > Decimal::ZERO {
            wallet::credit(
                tx.as_mut(),
                tenant_id,
                assignment.student_id,
                excess,
                payment.payment_id,
                GATEWAY_ACTOR,
                now,
            )
            .await?;
        }

        payment.status = PaymentStatus::Completed;
        payment.advance_amount = excess;
        payment.bank_ref_no = Some(event.gateway_payment_id.clone());
        payment.gateway_response_raw = Some(event.raw_payload.clone());
        payment.updated_utc = now;

        tx.update_payment(&payment).await?;
        tx.update_fee_assignment(&assignment).await?;
        tx.insert_income(&IncomeEntry::fee_received(
            tenant_id,
            payment.payment_id,
            payment.amount,
            event.gateway_payment_id.clone(),
            now,
        ))
        .await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            fee_assignment_id = %assignment.fee_assignment_id,
            paid_amount = %assignment.paid_amount,
            fee_status = %assignment.status,
            advance_credited = %excess,
            "Payment reconciled"
        );
        if excess > Decimal::ZERO {
            tracing::warn!(
                target: "audit",
                payment_id = %payment.payment_id,
                student_id = %assignment.student_id,
                amount = %excess,
                "Capture exceeded outstanding fee; excess credited to advance balance"
            );
        }

        Ok(CaptureOutcome::Applied {
            payment,
            assignment,
            advance_credited: excess,
        })
    }

    /// Record the payout state of a split transfer.
    ///
    /// Independent of fee settlement: refunded or redirected payments still
    /// track their transfers.
    #[instrument(skip(self, tenant, event), fields(tenant_id = %tenant.tenant_id, transfer_id = %event.transfer_id))]
    pub async fn apply_transfer_event(
        &self,
        tenant: &Tenant,
        event: &TransferEvent,
    ) -> Result<TransferApplied, LedgerError> {
        let tenant_id = tenant.tenant_id;
        with_lock_retry(&self.retry, "apply_transfer_event", || {
            self.transfer_once(tenant_id, event)
        })
        .await
    }

    async fn transfer_once(
        &self,
        tenant_id: Uuid,
        event: &TransferEvent,
    ) -> Result<TransferApplied, LedgerError> {
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment_by_reference(tenant_id, &event.source_reference)
            .await?
            .ok_or_else(|| LedgerError::UnknownTransaction(event.source_reference.clone()))?;

        let next = match event.outcome {
            TransferOutcome::Processed => SplitStatus::Success,
            TransferOutcome::Failed => SplitStatus::Failed,
        };

        if !payment.split_status.can_transition_to(next) {
            tracing::warn!(
                payment_id = %payment.payment_id,
                current = %payment.split_status,
                requested = %next,
                "Ignoring transfer event for settled split"
            );
            return Ok(TransferApplied::Unchanged {
                payment_id: payment.payment_id,
                split_status: payment.split_status,
            });
        }

        payment.transfer_id = Some(event.transfer_id.clone());
        payment.split_status = next;
        payment.updated_utc = Utc::now();
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            split_status = %next,
            "Split transfer updated"
        );

        Ok(TransferApplied::Updated {
            payment_id: payment.payment_id,
            split_status: next,
        })
    }
}
