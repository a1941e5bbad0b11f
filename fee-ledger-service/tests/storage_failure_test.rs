//! Storage failures part way through a ledger transaction.
//!
//! The gateway only redelivers a webhook it saw fail, so a storage error must
//! surface as 5xx and leave nothing of the half-applied capture behind.

mod common;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use common::{
    all_features, build_state, dec, init_tracing, payment_captured_body, ROOT_DOMAIN,
    TENANT_SECRET, TEST_ACTOR,
};
use fee_ledger_service::error::LedgerError;
use fee_ledger_service::models::{
    AdvanceBalance, CompensationEntry, FeeAssignment, FeeStatus, IncomeEntry, IncomeRange,
    NewFeeAssignment, NewPendingPayment, PaymentMethod, PaymentRecord, PaymentStatus, Tenant,
    WalletTransaction, DEFAULT_COMMISSION_PERCENT,
};
use fee_ledger_service::services::collection::FeeCollection;
use fee_ledger_service::services::retry::LockRetryPolicy;
use fee_ledger_service::services::store::{LedgerStore, LedgerTx, MemoryLedgerStore};
use fee_ledger_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::utils::signature::generate_signature;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

/// Memory store whose transactions fail on `insert_income` while armed.
struct FailingLedgerStore {
    inner: MemoryLedgerStore,
    fail_income: Arc<AtomicBool>,
}

struct FailingTx {
    inner: Box<dyn LedgerTx>,
    fail_income: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerStore for FailingLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        Ok(Box::new(FailingTx {
            inner: self.inner.begin().await?,
            fail_income: self.fail_income.clone(),
        }))
    }

    async fn find_tenant_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Tenant>, LedgerError> {
        self.inner.find_tenant_by_subdomain(subdomain).await
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, LedgerError> {
        self.inner.get_tenant(tenant_id).await
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), LedgerError> {
        self.inner.insert_tenant(tenant).await
    }

    async fn create_fee_assignment(&self, assignment: &FeeAssignment) -> Result<(), LedgerError> {
        self.inner.create_fee_assignment(assignment).await
    }

    async fn get_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        self.inner.get_fee_assignment(tenant_id, fee_assignment_id).await
    }

    async fn list_fee_assignments_for_student(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        self.inner
            .list_fee_assignments_for_student(tenant_id, student_id)
            .await
    }

    async fn delete_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<bool, LedgerError> {
        self.inner
            .delete_fee_assignment(tenant_id, fee_assignment_id)
            .await
    }

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.inner.get_payment(tenant_id, payment_id).await
    }

    async fn list_payments_for_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, LedgerError> {
        self.inner
            .list_payments_for_assignment(tenant_id, fee_assignment_id)
            .await
    }

    async fn list_income(
        &self,
        tenant_id: Uuid,
        range: IncomeRange,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        self.inner.list_income(tenant_id, range).await
    }

    async fn list_income_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        self.inner.list_income_for_payment(tenant_id, payment_id).await
    }

    async fn get_advance_balance(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<AdvanceBalance>, LedgerError> {
        self.inner.get_advance_balance(tenant_id, student_id).await
    }

    async fn list_wallet_transactions(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, LedgerError> {
        self.inner.list_wallet_transactions(tenant_id, student_id).await
    }

    async fn list_compensations(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<CompensationEntry>, LedgerError> {
        self.inner.list_compensations(tenant_id, payment_id).await
    }

    async fn claim_request_nonce(
        &self,
        client_id: &str,
        nonce: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.inner
            .claim_request_nonce(client_id, nonce, expires_utc)
            .await
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl LedgerTx for FailingTx {
    async fn lock_payment_by_gateway_id(
        &mut self,
        tenant_id: Uuid,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.inner
            .lock_payment_by_gateway_id(tenant_id, gateway_transaction_id)
            .await
    }

    async fn lock_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.inner.lock_payment(tenant_id, payment_id).await
    }

    async fn lock_payment_by_reference(
        &mut self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.inner.lock_payment_by_reference(tenant_id, reference).await
    }

    async fn lock_fee_assignment(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        self.inner.lock_fee_assignment(tenant_id, fee_assignment_id).await
    }

    async fn lock_fee_assignments_for_student(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        self.inner
            .lock_fee_assignments_for_student(tenant_id, student_id)
            .await
    }

    async fn sum_pending_payments(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        self.inner
            .sum_pending_payments(tenant_id, fee_assignment_id, since)
            .await
    }

    async fn lock_advance_balance(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<AdvanceBalance, LedgerError> {
        self.inner.lock_advance_balance(tenant_id, student_id).await
    }

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        self.inner.insert_payment(payment).await
    }

    async fn update_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        self.inner.update_payment(payment).await
    }

    async fn update_fee_assignment(
        &mut self,
        assignment: &FeeAssignment,
    ) -> Result<(), LedgerError> {
        self.inner.update_fee_assignment(assignment).await
    }

    async fn update_advance_balance(
        &mut self,
        balance: &AdvanceBalance,
    ) -> Result<(), LedgerError> {
        self.inner.update_advance_balance(balance).await
    }

    async fn insert_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> Result<(), LedgerError> {
        self.inner.insert_wallet_transaction(entry).await
    }

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), LedgerError> {
        if self.fail_income.load(Ordering::SeqCst) {
            return Err(LedgerError::TransientStorage(
                "connection reset while writing income".to_string(),
            ));
        }
        self.inner.insert_income(entry).await
    }

    async fn insert_compensation(
        &mut self,
        entry: &CompensationEntry,
    ) -> Result<(), LedgerError> {
        self.inner.insert_compensation(entry).await
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.inner.commit().await
    }
}

struct FailingApp {
    store: Arc<FailingLedgerStore>,
    state: AppState,
    router: axum::Router,
    tenant: Tenant,
    fail_income: Arc<AtomicBool>,
}

async fn spawn_failing() -> FailingApp {
    init_tracing();

    let fail_income = Arc::new(AtomicBool::new(false));
    let store = Arc::new(FailingLedgerStore {
        inner: MemoryLedgerStore::new(),
        fail_income: fail_income.clone(),
    });
    let state = build_state(store.clone(), LockRetryPolicy::default());
    let router = build_router(state.clone(), 256 * 1024);

    let tenant = Tenant {
        tenant_id: Uuid::new_v4(),
        subdomain: "greenwood".to_string(),
        webhook_secret: Some(Secret::new(TENANT_SECRET.to_string())),
        features: all_features(),
        commission_percent: DEFAULT_COMMISSION_PERCENT,
        active: true,
    };
    store.insert_tenant(&tenant).await.unwrap();

    FailingApp {
        store,
        state,
        router,
        tenant,
        fail_income,
    }
}

impl FailingApp {
    async fn seed_fee(&self, student_id: Uuid, amount: i64) -> FeeAssignment {
        let fee = FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: self.tenant.tenant_id,
                student_id,
                fee_head_id: Uuid::new_v4(),
                amount: dec(amount),
                discount: Decimal::ZERO,
                due_date: None,
            },
            Utc::now(),
        )
        .unwrap();
        self.store.create_fee_assignment(&fee).await.unwrap();
        fee
    }

    async fn send_webhook(&self, body: &str) -> StatusCode {
        let signature = generate_signature(TENANT_SECRET, body.as_bytes()).unwrap();
        let request = Request::post("/webhooks/razorpay")
            .header("host", format!("{}.{}", self.tenant.subdomain, ROOT_DOMAIN))
            .header("x-razorpay-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        to_bytes(response.into_body(), usize::MAX).await.unwrap();
        status
    }
}

#[tokio::test]
async fn failed_income_write_returns_500_and_rolls_back_the_capture() {
    let app = spawn_failing().await;
    let fee = app.seed_fee(Uuid::new_v4(), 1000).await;
    let pending = app
        .state
        .engine
        .register_pending_payment(
            &app.tenant,
            &NewPendingPayment {
                fee_assignment_id: fee.fee_assignment_id,
                amount: dec(1000),
                gateway_transaction_id: "order_flaky".to_string(),
                split_settlement: false,
            },
        )
        .await
        .unwrap();
    let body = payment_captured_body("order_flaky", "pay_flaky", 100_000);

    app.fail_income.store(true, Ordering::SeqCst);
    assert_eq!(app.send_webhook(&body).await, StatusCode::INTERNAL_SERVER_ERROR);

    let payment = app
        .store
        .get_payment(app.tenant.tenant_id, pending.payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.bank_ref_no.is_none());
    let untouched = app
        .store
        .get_fee_assignment(app.tenant.tenant_id, fee.fee_assignment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.paid_amount, Decimal::ZERO);
    assert_eq!(untouched.status, FeeStatus::Pending);
    assert!(app
        .store
        .list_income_for_payment(app.tenant.tenant_id, pending.payment_id)
        .await
        .unwrap()
        .is_empty());

    // The gateway's redelivery lands once storage recovers.
    app.fail_income.store(false, Ordering::SeqCst);
    assert_eq!(app.send_webhook(&body).await, StatusCode::OK);
    let settled = app
        .store
        .get_fee_assignment(app.tenant.tenant_id, fee.fee_assignment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.paid_amount, dec(1000));
}

#[tokio::test]
async fn failed_collection_leaves_no_partial_allocation_or_wallet_credit() {
    let app = spawn_failing().await;
    let student_id = Uuid::new_v4();
    let tuition = app.seed_fee(student_id, 1000).await;
    let transport = app.seed_fee(student_id, 500).await;

    app.fail_income.store(true, Ordering::SeqCst);
    let err = app
        .state
        .collector
        .collect_fees(
            &app.tenant,
            &FeeCollection {
                student_id,
                amount_received: dec(1800),
                method: PaymentMethod::Cash,
                reference: None,
                remarks: None,
                allocations: vec![],
            },
            TEST_ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TransientStorage(_)));

    for fee in [&tuition, &transport] {
        let stored = app
            .store
            .get_fee_assignment(app.tenant.tenant_id, fee.fee_assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.paid_amount, Decimal::ZERO);
        assert!(app
            .store
            .list_payments_for_assignment(app.tenant.tenant_id, fee.fee_assignment_id)
            .await
            .unwrap()
            .is_empty());
    }
    assert!(app
        .store
        .get_advance_balance(app.tenant.tenant_id, student_id)
        .await
        .unwrap()
        .map_or(true, |b| b.balance == Decimal::ZERO));
}
