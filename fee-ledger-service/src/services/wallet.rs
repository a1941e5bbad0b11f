//! Advance-balance wallet.
//!
//! `credit` and `debit` only take an open transaction handle, so every
//! movement commits or rolls back together with the ledger change that
//! caused it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    ensure_money_scale, AdvanceBalance, FeeAssignment, PlanFeature, Tenant, WalletDirection,
    WalletTransaction,
};
use crate::services::retry::{with_lock_retry, LockRetryPolicy};
use crate::services::store::{LedgerStore, LedgerTx};

/// Add `amount` to the student's wallet and journal it against `source_ref`.
pub(crate) async fn credit(
    tx: &mut dyn LedgerTx,
    tenant_id: Uuid,
    student_id: Uuid,
    amount: Decimal,
    source_ref: Uuid,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<AdvanceBalance, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!(
            "wallet credit must be positive, got {}",
            amount
        )));
    }

    let mut balance = tx.lock_advance_balance(tenant_id, student_id).await?;
    balance.balance += amount;
    balance.updated_utc = now;
    tx.update_advance_balance(&balance).await?;
    journal(tx, &balance, WalletDirection::Credit, amount, source_ref, actor, now).await?;

    Ok(balance)
}

/// Take `amount` from the student's wallet and journal it against `target_ref`,
/// the fee it settles or the payment it reverses.
pub(crate) async fn debit(
    tx: &mut dyn LedgerTx,
    tenant_id: Uuid,
    student_id: Uuid,
    amount: Decimal,
    target_ref: Uuid,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<AdvanceBalance, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!(
            "wallet debit must be positive, got {}",
            amount
        )));
    }

    let mut balance = tx.lock_advance_balance(tenant_id, student_id).await?;
    if balance.balance < amount {
        return Err(LedgerError::InsufficientBalance {
            available: balance.balance,
            requested: amount,
        });
    }
    balance.balance -= amount;
    balance.updated_utc = now;
    tx.update_advance_balance(&balance).await?;
    journal(
        tx,
        &balance,
        WalletDirection::Debit,
        amount,
        target_ref,
        actor,
        now,
    )
    .await?;

    Ok(balance)
}

async fn journal(
    tx: &mut dyn LedgerTx,
    balance: &AdvanceBalance,
    direction: WalletDirection,
    amount: Decimal,
    source_ref: Uuid,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    tx.insert_wallet_transaction(&WalletTransaction {
        wallet_txn_id: Uuid::new_v4(),
        tenant_id: balance.tenant_id,
        student_id: balance.student_id,
        direction,
        amount,
        source_ref,
        actor: actor.to_string(),
        balance_after: balance.balance,
        created_utc: now,
    })
    .await
}

/// Result of settling a fee from the wallet.
#[derive(Debug, Clone, Serialize)]
pub struct WalletSettlement {
    pub assignment: FeeAssignment,
    pub balance: AdvanceBalance,
}

/// Draws the advance balance down against fee assignments.
#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn LedgerStore>,
    retry: LockRetryPolicy,
}

impl WalletService {
    pub fn new(store: Arc<dyn LedgerStore>, retry: LockRetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Debit the student's wallet and apply the amount to one of their fees.
    ///
    /// No income row is written: the money was already recognised when it
    /// was first captured.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.tenant_id))]
    pub async fn settle_fee_from_wallet(
        &self,
        tenant: &Tenant,
        fee_assignment_id: Uuid,
        amount: Decimal,
        actor: &str,
    ) -> Result<WalletSettlement, LedgerError> {
        tenant.require_feature(PlanFeature::AdvanceWallet)?;
        if actor.trim().is_empty() {
            return Err(LedgerError::Validation("actor is required".to_string()));
        }
        ensure_money_scale(amount, "settlement amount")?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "settlement amount must be positive, got {}",
                amount
            )));
        }

        let tenant_id = tenant.tenant_id;
        let settlement = with_lock_retry(&self.retry, "settle_fee_from_wallet", || {
            self.settle_once(tenant_id, fee_assignment_id, amount, actor)
        })
        .await?;

        tracing::info!(
            target: "audit",
            tenant_id = %tenant_id,
            fee_assignment_id = %fee_assignment_id,
            amount = %amount,
            actor = %actor,
            "Fee settled from advance balance"
        );

        Ok(settlement)
    }

    async fn settle_once(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        amount: Decimal,
        actor: &str,
    ) -> Result<WalletSettlement, LedgerError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut assignment = tx
            .lock_fee_assignment(tenant_id, fee_assignment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("fee assignment {}", fee_assignment_id)))?;

        if amount > assignment.outstanding() {
            return Err(LedgerError::Validation(format!(
                "settlement {} exceeds outstanding {} on fee {}",
                amount,
                assignment.outstanding(),
                fee_assignment_id
            )));
        }

        let balance = debit(
            tx.as_mut(),
            tenant_id,
            assignment.student_id,
            amount,
            fee_assignment_id,
            actor,
            now,
        )
        .await?;

        assignment.apply_payment(amount, now)?;
        tx.update_fee_assignment(&assignment).await?;
        tx.commit().await?;

        Ok(WalletSettlement {
            assignment,
            balance,
        })
    }
}
