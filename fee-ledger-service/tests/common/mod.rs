#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use axum::http::request::Builder;
use fee_ledger_service::config::{GatewayConfig, LedgerConfig, SigningConfig, TenancyConfig};
use fee_ledger_service::models::{
    FeeAssignment, NewFeeAssignment, NewPendingPayment, PaymentRecord, PlanFeature, Tenant,
    DEFAULT_COMMISSION_PERCENT,
};
use fee_ledger_service::services::reconciliation::{
    CaptureOutcome, PaymentCaptured, ReconciliationEngine, DEFAULT_CHECKOUT_TTL_MINUTES,
};
use fee_ledger_service::services::retry::LockRetryPolicy;
use fee_ledger_service::services::store::{LedgerStore, MemoryLedgerStore};
use fee_ledger_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::middleware::signature::{
    CLIENT_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use service_core::utils::signature::{generate_request_signature, generate_signature};
use std::sync::{Arc, Once};
use tower::ServiceExt;
use uuid::Uuid;

pub const PLATFORM_SECRET: &str = "platform_webhook_secret";
pub const TENANT_SECRET: &str = "greenwood_webhook_secret";
pub const ROOT_DOMAIN: &str = "schoolhub.test";
pub const TEST_ACTOR: &str = "accountant@greenwood";
pub const SIGNING_CLIENT_ID: &str = "school-portal";
pub const SIGNING_SECRET: &str = "portal_request_signing_secret_0123456789";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,fee_ledger_service=debug,audit=info,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

/// Ledger settings used by every test app.
pub fn ledger_config(lock_retry: LockRetryPolicy) -> LedgerConfig {
    LedgerConfig {
        lock_retry,
        checkout_ttl: chrono::Duration::minutes(DEFAULT_CHECKOUT_TTL_MINUTES),
    }
}

pub fn build_state(store: Arc<dyn LedgerStore>, lock_retry: LockRetryPolicy) -> AppState {
    AppState::new(
        store,
        &GatewayConfig {
            webhook_secret: Secret::new(PLATFORM_SECRET.to_string()),
        },
        &TenancyConfig {
            root_domains: vec![ROOT_DOMAIN.to_string()],
        },
        &ledger_config(lock_retry),
        &SigningConfig {
            required: true,
            client_id: SIGNING_CLIENT_ID.to_string(),
            secret: Secret::new(SIGNING_SECRET.to_string()),
        },
    )
}

/// Attach the portal's request signature headers and body.
pub fn signed(builder: Builder, body: &str) -> Request<Body> {
    signed_with_nonce(builder, body, &Uuid::new_v4().to_string())
}

pub fn signed_with_nonce(builder: Builder, body: &str, nonce: &str) -> Request<Body> {
    let method = builder
        .method_ref()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "GET".to_string());
    let path = builder
        .uri_ref()
        .map(|u| u.path().to_string())
        .unwrap_or_else(|| "/".to_string());
    let timestamp = Utc::now().timestamp();
    let signature = generate_request_signature(
        SIGNING_SECRET,
        &method,
        &path,
        timestamp,
        nonce,
        body.as_bytes(),
    )
    .expect("Failed to sign request");

    builder
        .header(CLIENT_ID_HEADER, SIGNING_CLIENT_ID)
        .header(TIMESTAMP_HEADER, timestamp.to_string())
        .header(NONCE_HEADER, nonce)
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}

pub fn all_features() -> Vec<PlanFeature> {
    vec![
        PlanFeature::OnlinePayments,
        PlanFeature::AdvanceWallet,
        PlanFeature::SplitSettlement,
    ]
}

/// A ledger wired to an in-memory store, with one tenant ready to use.
pub struct TestApp {
    pub store: Arc<MemoryLedgerStore>,
    pub state: AppState,
    pub router: Router,
    pub tenant: Tenant,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_features(all_features()).await
    }

    pub async fn spawn_with_features(features: Vec<PlanFeature>) -> Self {
        init_tracing();

        let store = Arc::new(MemoryLedgerStore::new());
        let state = build_state(store.clone(), LockRetryPolicy::default());
        let router = build_router(state.clone(), 256 * 1024);

        let tenant = Tenant {
            tenant_id: Uuid::new_v4(),
            subdomain: "greenwood".to_string(),
            webhook_secret: Some(Secret::new(TENANT_SECRET.to_string())),
            features,
            commission_percent: DEFAULT_COMMISSION_PERCENT,
            active: true,
        };
        store
            .insert_tenant(&tenant)
            .await
            .expect("Failed to seed tenant");

        Self {
            store,
            state,
            router,
            tenant,
        }
    }

    pub fn tenant_host(&self) -> String {
        format!("{}.{}", self.tenant.subdomain, ROOT_DOMAIN)
    }

    pub async fn add_tenant(&self, subdomain: &str, features: Vec<PlanFeature>) -> Tenant {
        let tenant = Tenant {
            tenant_id: Uuid::new_v4(),
            subdomain: subdomain.to_string(),
            webhook_secret: None,
            features,
            commission_percent: DEFAULT_COMMISSION_PERCENT,
            active: true,
        };
        self.store
            .insert_tenant(&tenant)
            .await
            .expect("Failed to seed tenant");
        tenant
    }

    pub async fn seed_fee(&self, amount: i64, discount: i64) -> FeeAssignment {
        self.seed_fee_for(Uuid::new_v4(), amount, discount).await
    }

    pub async fn seed_fee_for(&self, student_id: Uuid, amount: i64, discount: i64) -> FeeAssignment {
        let assignment = FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: self.tenant.tenant_id,
                student_id,
                fee_head_id: Uuid::new_v4(),
                amount: dec(amount),
                discount: dec(discount),
                due_date: None,
            },
            Utc::now(),
        )
        .expect("Invalid fee assignment");
        self.store
            .create_fee_assignment(&assignment)
            .await
            .expect("Failed to seed fee assignment");
        assignment
    }

    pub async fn register_payment(
        &self,
        assignment: &FeeAssignment,
        amount: i64,
        order_id: &str,
    ) -> PaymentRecord {
        self.register_payment_with(assignment, amount, order_id, false)
            .await
            .expect("Failed to register pending payment")
    }

    pub async fn register_payment_with(
        &self,
        assignment: &FeeAssignment,
        amount: i64,
        order_id: &str,
        split_settlement: bool,
    ) -> Result<PaymentRecord, fee_ledger_service::error::LedgerError> {
        self.state
            .engine
            .register_pending_payment(
                &self.tenant,
                &NewPendingPayment {
                    fee_assignment_id: assignment.fee_assignment_id,
                    amount: dec(amount),
                    gateway_transaction_id: order_id.to_string(),
                    split_settlement,
                },
            )
            .await
    }

    /// Register a checkout as if every earlier one had been abandoned, so it
    /// may overlap payments still pending on the fee.
    pub async fn register_overlapping_payment(
        &self,
        assignment: &FeeAssignment,
        amount: i64,
        order_id: &str,
    ) -> PaymentRecord {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ReconciliationEngine::new(self.store.clone(), LockRetryPolicy::default())
            .with_checkout_ttl(chrono::Duration::zero())
            .register_pending_payment(
                &self.tenant,
                &NewPendingPayment {
                    fee_assignment_id: assignment.fee_assignment_id,
                    amount: dec(amount),
                    gateway_transaction_id: order_id.to_string(),
                    split_settlement: false,
                },
            )
            .await
            .expect("Failed to register overlapping payment")
    }

    /// Deliver a captured event for `order_id` straight to the engine.
    pub async fn capture(&self, order_id: &str, amount: i64) -> PaymentRecord {
        let outcome = self
            .state
            .engine
            .apply_payment_captured(
                &self.tenant,
                &PaymentCaptured {
                    gateway_transaction_id: order_id.to_string(),
                    gateway_payment_id: format!("pay_{}", order_id),
                    amount: dec(amount),
                    currency: "INR".to_string(),
                    raw_payload: serde_json::json!({}),
                },
            )
            .await
            .expect("Failed to apply capture");
        match outcome {
            CaptureOutcome::Applied { payment, .. } => payment,
            CaptureOutcome::AlreadyProcessed { payment_id } => self.payment(payment_id).await,
        }
    }

    pub async fn fee(&self, assignment: &FeeAssignment) -> FeeAssignment {
        self.store
            .get_fee_assignment(self.tenant.tenant_id, assignment.fee_assignment_id)
            .await
            .expect("Failed to load fee assignment")
            .expect("Fee assignment missing")
    }

    pub async fn payment(&self, payment_id: Uuid) -> PaymentRecord {
        self.store
            .get_payment(self.tenant.tenant_id, payment_id)
            .await
            .expect("Failed to load payment")
            .expect("Payment missing")
    }

    pub async fn income_for(&self, payment_id: Uuid) -> Vec<fee_ledger_service::models::IncomeEntry> {
        self.store
            .list_income_for_payment(self.tenant.tenant_id, payment_id)
            .await
            .expect("Failed to list income")
    }

    pub async fn wallet_balance(&self, student_id: Uuid) -> Decimal {
        self.store
            .get_advance_balance(self.tenant.tenant_id, student_id)
            .await
            .expect("Failed to load advance balance")
            .map(|b| b.balance)
            .unwrap_or(Decimal::ZERO)
    }

    /// Send a signed webhook to the tenant's host.
    pub async fn send_webhook(&self, body: &str, secret: &str) -> (StatusCode, serde_json::Value) {
        let signature = generate_signature(secret, body.as_bytes()).expect("Failed to sign");
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/razorpay")
            .header("host", self.tenant_host())
            .header("content-type", "application/json")
            .header("x-razorpay-signature", signature)
            .body(Body::from(body.to_string()))
            .expect("Failed to build request");
        self.call(request).await
    }

    pub async fn call(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }
}

/// Razorpay `payment.captured` body; `amount_paise` is in the smallest unit.
pub fn payment_captured_body(order_id: &str, payment_id: &str, amount_paise: u64) -> String {
    serde_json::json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": "payment.captured",
        "contains": ["payment"],
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "entity": "payment",
                    "amount": amount_paise,
                    "currency": "INR",
                    "status": "captured",
                    "order_id": order_id,
                    "method": "upi"
                }
            }
        },
        "created_at": 1_767_225_600
    })
    .to_string()
}

pub fn transfer_body(event: &str, transfer_id: &str, source: &str) -> String {
    serde_json::json!({
        "entity": "event",
        "account_id": "acc_test",
        "event": event,
        "contains": ["transfer"],
        "payload": {
            "transfer": {
                "entity": {
                    "id": transfer_id,
                    "entity": "transfer",
                    "source": source,
                    "recipient": "acc_vendor",
                    "amount": 10000,
                    "currency": "INR"
                }
            }
        }
    })
    .to_string()
}
