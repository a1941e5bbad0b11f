//! Storage seam for the ledger.
//!
//! `LedgerStore` covers tenant lookups, fee assignment lifecycle and the
//! non-locking read views. Every multi-row mutation goes through a
//! `LedgerTx`, which locks rows as it reads them and rolls back when dropped
//! without `commit`. Rows must be locked in the order payment, fee
//! assignment, advance balance.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    AdvanceBalance, CompensationEntry, FeeAssignment, IncomeEntry, IncomeRange, PaymentRecord,
    Tenant, WalletTransaction,
};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a ledger transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;

    async fn find_tenant_by_subdomain(&self, subdomain: &str)
        -> Result<Option<Tenant>, LedgerError>;

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, LedgerError>;

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), LedgerError>;

    async fn create_fee_assignment(&self, assignment: &FeeAssignment) -> Result<(), LedgerError>;

    async fn get_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError>;

    async fn list_fee_assignments_for_student(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError>;

    /// Delete an assignment no payment references.
    ///
    /// Returns `false` when the row does not exist and `Conflict` when
    /// payments still point at it.
    async fn delete_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<bool, LedgerError>;

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError>;

    async fn list_payments_for_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, LedgerError>;

    async fn list_income(
        &self,
        tenant_id: Uuid,
        range: IncomeRange,
    ) -> Result<Vec<IncomeEntry>, LedgerError>;

    async fn list_income_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<IncomeEntry>, LedgerError>;

    async fn get_advance_balance(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<AdvanceBalance>, LedgerError>;

    async fn list_wallet_transactions(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, LedgerError>;

    async fn list_compensations(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<CompensationEntry>, LedgerError>;

    /// Record a signed-request nonce until `expires_utc`.
    ///
    /// Returns `false` when the nonce is already held by an unexpired claim.
    async fn claim_request_nonce(
        &self,
        client_id: &str,
        nonce: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    async fn health_check(&self) -> Result<(), LedgerError>;
}

/// One open ledger transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_payment_by_gateway_id(
        &mut self,
        tenant_id: Uuid,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError>;

    async fn lock_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError>;

    /// Lock the payment whose bank reference or gateway transaction id matches.
    async fn lock_payment_by_reference(
        &mut self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError>;

    async fn lock_fee_assignment(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError>;

    /// Lock every fee assignment of a student, oldest due date first.
    async fn lock_fee_assignments_for_student(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError>;

    /// Total of PENDING payments against a fee registered at or after `since`.
    ///
    /// Call with the fee assignment locked so concurrent checkouts serialize.
    async fn sum_pending_payments(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError>;

    /// Lock the student's wallet row, creating an empty one on first use.
    async fn lock_advance_balance(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<AdvanceBalance, LedgerError>;

    /// Insert a new payment; a duplicate gateway transaction id is a `Conflict`.
    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError>;

    async fn update_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError>;

    async fn update_fee_assignment(&mut self, assignment: &FeeAssignment)
        -> Result<(), LedgerError>;

    async fn update_advance_balance(&mut self, balance: &AdvanceBalance)
        -> Result<(), LedgerError>;

    async fn insert_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> Result<(), LedgerError>;

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), LedgerError>;

    async fn insert_compensation(&mut self, entry: &CompensationEntry)
        -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}
