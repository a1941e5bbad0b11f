mod common;

use axum::http::{Request, StatusCode};
use chrono::Utc;
use common::{dec, signed, TestApp, TEST_ACTOR};
use fee_ledger_service::error::LedgerError;
use fee_ledger_service::models::{
    FeeAssignment, FeeStatus, IncomeSource, NewFeeAssignment, PaymentMethod, PaymentStatus,
    PlanFeature,
};
use fee_ledger_service::services::collection::{FeeAllocation, FeeCollection};
use fee_ledger_service::services::store::LedgerStore;
use rust_decimal::Decimal;
use uuid::Uuid;

async fn seed_due(app: &TestApp, student_id: Uuid, amount: i64, month: u32) -> FeeAssignment {
    let fee = FeeAssignment::new(
        &NewFeeAssignment {
            tenant_id: app.tenant.tenant_id,
            student_id,
            fee_head_id: Uuid::new_v4(),
            amount: dec(amount),
            discount: Decimal::ZERO,
            due_date: chrono::NaiveDate::from_ymd_opt(2026, month, 10),
        },
        Utc::now(),
    )
    .unwrap();
    app.store.create_fee_assignment(&fee).await.unwrap();
    fee
}

fn cash(student_id: Uuid, received: i64, allocations: Vec<FeeAllocation>) -> FeeCollection {
    FeeCollection {
        student_id,
        amount_received: dec(received),
        method: PaymentMethod::Cash,
        reference: None,
        remarks: Some("paid at front desk".to_string()),
        allocations,
    }
}

#[tokio::test]
async fn cash_settles_oldest_fees_first_and_banks_the_rest() {
    let app = TestApp::spawn().await;
    let student_id = Uuid::new_v4();
    // Seeded out of due-date order on purpose.
    let june = seed_due(&app, student_id, 800, 6).await;
    let april = seed_due(&app, student_id, 1000, 4).await;

    let receipt = app
        .state
        .collector
        .collect_fees(&app.tenant, &cash(student_id, 2000, vec![]), TEST_ACTOR)
        .await
        .unwrap();

    assert!(receipt.receipt_no.starts_with("RCPT-"));
    assert_eq!(receipt.total_applied, dec(1800));
    assert_eq!(receipt.advance_amount, dec(200));
    assert_eq!(receipt.wallet_balance.map(|b| b.balance), Some(dec(200)));
    assert_eq!(receipt.payments.len(), 2);
    assert_eq!(receipt.payments[0].fee_assignment_id, april.fee_assignment_id);
    assert_eq!(receipt.payments[1].fee_assignment_id, june.fee_assignment_id);

    let last = &receipt.payments[1];
    assert_eq!(last.amount, dec(1000));
    assert_eq!(last.advance_amount, dec(200));
    assert_eq!(last.applied_amount(), dec(800));

    for payment in &receipt.payments {
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.method, PaymentMethod::Cash);
        assert_eq!(payment.collected_by.as_deref(), Some(TEST_ACTOR));
        // No gateway, no commission.
        assert_eq!(payment.platform_fee, Decimal::ZERO);
        assert_eq!(payment.school_share, payment.amount);

        let income = app.income_for(payment.payment_id).await;
        assert_eq!(income.len(), 1);
        assert_eq!(income[0].amount, payment.amount);
        assert_eq!(income[0].source, IncomeSource::Fee);
    }

    assert_eq!(app.fee(&april).await.status, FeeStatus::Paid);
    assert_eq!(app.fee(&june).await.status, FeeStatus::Paid);
    assert_eq!(app.wallet_balance(student_id).await, dec(200));
}

#[tokio::test]
async fn explicit_allocation_is_honoured() {
    let app = TestApp::spawn().await;
    let student_id = Uuid::new_v4();
    let april = seed_due(&app, student_id, 1000, 4).await;
    let june = seed_due(&app, student_id, 800, 6).await;

    let receipt = app
        .state
        .collector
        .collect_fees(
            &app.tenant,
            &cash(
                student_id,
                500,
                vec![FeeAllocation {
                    fee_assignment_id: june.fee_assignment_id,
                    amount: dec(500),
                }],
            ),
            TEST_ACTOR,
        )
        .await
        .unwrap();

    assert_eq!(receipt.advance_amount, Decimal::ZERO);
    assert!(receipt.wallet_balance.is_none());
    assert_eq!(app.fee(&june).await.paid_amount, dec(500));
    assert_eq!(app.fee(&june).await.status, FeeStatus::Partial);
    assert_eq!(app.fee(&april).await.paid_amount, Decimal::ZERO);
}

#[tokio::test]
async fn excess_needs_the_wallet_feature() {
    let app = TestApp::spawn_with_features(vec![PlanFeature::OnlinePayments]).await;
    let student_id = Uuid::new_v4();
    let fee = seed_due(&app, student_id, 1000, 4).await;

    let err = app
        .state
        .collector
        .collect_fees(&app.tenant, &cash(student_id, 1200, vec![]), TEST_ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::FeatureDisabled(PlanFeature::AdvanceWallet)
    ));
    assert_eq!(app.fee(&fee).await.paid_amount, Decimal::ZERO);

    // An exact amount needs no wallet.
    app.state
        .collector
        .collect_fees(&app.tenant, &cash(student_id, 1000, vec![]), TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(app.fee(&fee).await.status, FeeStatus::Paid);
}

#[tokio::test]
async fn collection_input_is_validated() {
    let app = TestApp::spawn().await;
    let student_id = Uuid::new_v4();
    let fee = seed_due(&app, student_id, 1000, 4).await;

    let mut online = cash(student_id, 100, vec![]);
    online.method = PaymentMethod::Online;
    let over_allocated = cash(
        student_id,
        100,
        vec![FeeAllocation {
            fee_assignment_id: fee.fee_assignment_id,
            amount: dec(200),
        }],
    );
    let repeated = cash(
        student_id,
        400,
        vec![
            FeeAllocation {
                fee_assignment_id: fee.fee_assignment_id,
                amount: dec(100),
            },
            FeeAllocation {
                fee_assignment_id: fee.fee_assignment_id,
                amount: dec(100),
            },
        ],
    );
    let mut fractional = cash(student_id, 0, vec![]);
    fractional.amount_received = "10.001".parse().unwrap();

    for collection in [online, over_allocated, repeated, fractional, cash(student_id, 0, vec![])] {
        let err = app
            .state
            .collector
            .collect_fees(&app.tenant, &collection, TEST_ACTOR)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)), "{:?}", err);
    }

    let err = app
        .state
        .collector
        .collect_fees(&app.tenant, &cash(Uuid::new_v4(), 100, vec![]), TEST_ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    assert_eq!(app.fee(&fee).await.paid_amount, Decimal::ZERO);
}

#[tokio::test]
async fn refunding_the_carrying_payment_reverses_the_advance() {
    let app = TestApp::spawn().await;
    let student_id = Uuid::new_v4();
    let fee = seed_due(&app, student_id, 1000, 4).await;

    let receipt = app
        .state
        .collector
        .collect_fees(&app.tenant, &cash(student_id, 1300, vec![]), TEST_ACTOR)
        .await
        .unwrap();
    let payment = &receipt.payments[0];

    let refund = app
        .state
        .compensation
        .refund(&app.tenant, payment.payment_id, "cheque bounced", TEST_ACTOR)
        .await
        .unwrap();

    assert_eq!(refund.income_entry.amount, dec(-1300));
    assert_eq!(app.fee(&fee).await.paid_amount, Decimal::ZERO);
    assert_eq!(app.wallet_balance(student_id).await, Decimal::ZERO);
}

#[tokio::test]
async fn collection_over_http_is_signed_and_returns_a_receipt() {
    let app = TestApp::spawn().await;
    let student_id = Uuid::new_v4();
    let fee = seed_due(&app, student_id, 1000, 4).await;
    let uri = format!("/students/{}/collections", student_id);
    let body = serde_json::json!({
        "amount_received": "1000.00",
        "method": "CHEQUE",
        "reference": "CHQ-55012"
    })
    .to_string();

    let unsigned = Request::post(uri.as_str())
        .header("host", app.tenant_host())
        .header("content-type", "application/json")
        .header("x-user-id", TEST_ACTOR)
        .body(axum::body::Body::from(body.clone()))
        .unwrap();
    let (status, _) = app.call(unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.fee(&fee).await.paid_amount, Decimal::ZERO);

    let request = signed(
        Request::post(uri.as_str())
            .header("host", app.tenant_host())
            .header("content-type", "application/json")
            .header("x-user-id", TEST_ACTOR),
        &body,
    );
    let (status, receipt) = app.call(request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["method"], "CHEQUE");
    assert_eq!(receipt["payments"][0]["bank_ref_no"], "CHQ-55012");
    assert_eq!(receipt["payments"][0]["collected_by"], TEST_ACTOR);
    assert_eq!(app.fee(&fee).await.status, FeeStatus::Paid);
}
