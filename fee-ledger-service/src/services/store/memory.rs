//! In-memory ledger store.
//!
//! A single async mutex guards the whole state. A transaction holds the guard
//! for its lifetime and works on a copy, which is written back on commit, so
//! transactions are serial and a dropped one leaves no trace. Used by tests
//! and local runs without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx};
use crate::error::LedgerError;
use crate::models::{
    AdvanceBalance, CompensationEntry, FeeAssignment, IncomeEntry, IncomeRange, PaymentRecord,
    PaymentStatus, Tenant, WalletTransaction,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    fee_assignments: HashMap<Uuid, FeeAssignment>,
    payments: HashMap<Uuid, PaymentRecord>,
    income: Vec<IncomeEntry>,
    balances: HashMap<(Uuid, Uuid), AdvanceBalance>,
    wallet_transactions: Vec<WalletTransaction>,
    compensations: Vec<CompensationEntry>,
    nonces: HashMap<(String, String), DateTime<Utc>>,
}

impl MemoryState {
    fn fee_assignment(&self, tenant_id: Uuid, id: Uuid) -> Option<&FeeAssignment> {
        self.fee_assignments
            .get(&id)
            .filter(|a| a.tenant_id == tenant_id)
    }

    fn payment(&self, tenant_id: Uuid, id: Uuid) -> Option<&PaymentRecord> {
        self.payments.get(&id).filter(|p| p.tenant_id == tenant_id)
    }

    fn student_fee_assignments(&self, tenant_id: Uuid, student_id: Uuid) -> Vec<FeeAssignment> {
        let mut assignments: Vec<FeeAssignment> = self
            .fee_assignments
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.student_id == student_id)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| (a.due_date.is_none(), a.due_date, a.created_utc));
        assignments
    }

    fn find_payment<F>(&self, tenant_id: Uuid, predicate: F) -> Option<&PaymentRecord>
    where
        F: Fn(&PaymentRecord) -> bool,
    {
        self.payments
            .values()
            .find(|p| p.tenant_id == tenant_id && predicate(p))
    }
}

/// Ledger store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryLedgerTx { guard, working }))
    }

    async fn find_tenant_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Tenant>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .tenants
            .values()
            .find(|t| t.subdomain.eq_ignore_ascii_case(subdomain))
            .cloned())
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, LedgerError> {
        Ok(self.state.lock().await.tenants.get(&tenant_id).cloned())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let taken = state.tenants.values().any(|t| {
            t.tenant_id == tenant.tenant_id || t.subdomain.eq_ignore_ascii_case(&tenant.subdomain)
        });
        if taken {
            return Err(LedgerError::Conflict(format!(
                "tenant '{}' already exists",
                tenant.subdomain
            )));
        }
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn create_fee_assignment(&self, assignment: &FeeAssignment) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&assignment.tenant_id) {
            return Err(LedgerError::NotFound(format!(
                "tenant {}",
                assignment.tenant_id
            )));
        }
        if state.fee_assignments.contains_key(&assignment.fee_assignment_id) {
            return Err(LedgerError::Conflict(format!(
                "fee assignment {} already exists",
                assignment.fee_assignment_id
            )));
        }
        state
            .fee_assignments
            .insert(assignment.fee_assignment_id, assignment.clone());
        Ok(())
    }

    async fn get_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.fee_assignment(tenant_id, fee_assignment_id).cloned())
    }

    async fn list_fee_assignments_for_student(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.student_fee_assignments(tenant_id, student_id))
    }

    async fn delete_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        if state.fee_assignment(tenant_id, fee_assignment_id).is_none() {
            return Ok(false);
        }
        if state
            .payments
            .values()
            .any(|p| p.fee_assignment_id == fee_assignment_id)
        {
            return Err(LedgerError::Conflict(format!(
                "fee assignment {} has payments and cannot be deleted",
                fee_assignment_id
            )));
        }
        state.fee_assignments.remove(&fee_assignment_id);
        Ok(true)
    }

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self.state.lock().await.payment(tenant_id, payment_id).cloned())
    }

    async fn list_payments_for_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, LedgerError> {
        let state = self.state.lock().await;
        let mut payments: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.fee_assignment_id == fee_assignment_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_utc);
        Ok(payments)
    }

    async fn list_income(
        &self,
        tenant_id: Uuid,
        range: IncomeRange,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .income
            .iter()
            .filter(|e| e.tenant_id == tenant_id && range.contains(e.entry_utc))
            .cloned()
            .collect())
    }

    async fn list_income_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .income
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn get_advance_balance(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<AdvanceBalance>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&(tenant_id, student_id)).cloned())
    }

    async fn list_wallet_transactions(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id && t.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn list_compensations(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<CompensationEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .compensations
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn claim_request_nonce(
        &self,
        client_id: &str,
        nonce: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.nonces.retain(|_, expires| *expires > now);

        let key = (client_id.to_string(), nonce.to_string());
        if state.nonces.contains_key(&key) {
            return Ok(false);
        }
        state.nonces.insert(key, expires_utc);
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

fn check_payment_split(payment: &PaymentRecord) -> Result<(), LedgerError> {
    if payment.advance_amount.is_sign_negative() || payment.advance_amount > payment.amount {
        return Err(LedgerError::InvariantViolation(format!(
            "payment {} advance {} outside 0..={}",
            payment.payment_id, payment.advance_amount, payment.amount
        )));
    }
    Ok(())
}

struct MemoryLedgerTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_payment_by_gateway_id(
        &mut self,
        tenant_id: Uuid,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self
            .working
            .find_payment(tenant_id, |p| p.gateway_transaction_id == gateway_transaction_id)
            .cloned())
    }

    async fn lock_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self.working.payment(tenant_id, payment_id).cloned())
    }

    async fn lock_payment_by_reference(
        &mut self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self
            .working
            .find_payment(tenant_id, |p| {
                p.bank_ref_no.as_deref() == Some(reference) || p.gateway_transaction_id == reference
            })
            .cloned())
    }

    async fn lock_fee_assignment(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        Ok(self
            .working
            .fee_assignment(tenant_id, fee_assignment_id)
            .cloned())
    }

    async fn lock_fee_assignments_for_student(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        Ok(self.working.student_fee_assignments(tenant_id, student_id))
    }

    async fn sum_pending_payments(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        Ok(self
            .working
            .payments
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.fee_assignment_id == fee_assignment_id
                    && p.status == PaymentStatus::Pending
                    && p.created_utc >= since
            })
            .map(|p| p.amount)
            .sum())
    }

    async fn lock_advance_balance(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<AdvanceBalance, LedgerError> {
        Ok(self
            .working
            .balances
            .entry((tenant_id, student_id))
            .or_insert_with(|| AdvanceBalance::empty(tenant_id, student_id, Utc::now()))
            .clone())
    }

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        check_payment_split(payment)?;
        let duplicate = self
            .working
            .find_payment(payment.tenant_id, |p| {
                p.gateway_transaction_id == payment.gateway_transaction_id
            })
            .is_some();
        if duplicate || self.working.payments.contains_key(&payment.payment_id) {
            return Err(LedgerError::Conflict(format!(
                "payment for gateway transaction '{}' already exists",
                payment.gateway_transaction_id
            )));
        }
        if self
            .working
            .fee_assignment(payment.tenant_id, payment.fee_assignment_id)
            .is_none()
        {
            return Err(LedgerError::NotFound(format!(
                "fee assignment {}",
                payment.fee_assignment_id
            )));
        }
        self.working
            .payments
            .insert(payment.payment_id, payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        check_payment_split(payment)?;
        match self.working.payments.get_mut(&payment.payment_id) {
            Some(existing) if existing.tenant_id == payment.tenant_id => {
                *existing = payment.clone();
                Ok(())
            }
            _ => Err(LedgerError::NotFound(format!("payment {}", payment.payment_id))),
        }
    }

    async fn update_fee_assignment(
        &mut self,
        assignment: &FeeAssignment,
    ) -> Result<(), LedgerError> {
        match self
            .working
            .fee_assignments
            .get_mut(&assignment.fee_assignment_id)
        {
            Some(existing) if existing.tenant_id == assignment.tenant_id => {
                *existing = assignment.clone();
                Ok(())
            }
            _ => Err(LedgerError::NotFound(format!(
                "fee assignment {}",
                assignment.fee_assignment_id
            ))),
        }
    }

    async fn update_advance_balance(
        &mut self,
        balance: &AdvanceBalance,
    ) -> Result<(), LedgerError> {
        if balance.balance.is_sign_negative() {
            return Err(LedgerError::InvariantViolation(format!(
                "advance balance for student {} would become negative",
                balance.student_id
            )));
        }
        self.working
            .balances
            .insert((balance.tenant_id, balance.student_id), balance.clone());
        Ok(())
    }

    async fn insert_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> Result<(), LedgerError> {
        self.working.wallet_transactions.push(entry.clone());
        Ok(())
    }

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), LedgerError> {
        self.working.income.push(entry.clone());
        Ok(())
    }

    async fn insert_compensation(
        &mut self,
        entry: &CompensationEntry,
    ) -> Result<(), LedgerError> {
        self.working.compensations.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryLedgerTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
