//! Payment registration, lookup and compensation endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{CompensationRequest, PaymentDetailResponse, RegisterPaymentRequest};
use crate::error::LedgerError;
use crate::middleware::Actor;
use crate::models::{CompensationEntry, NewPendingPayment, PaymentRecord};
use crate::services::compensation::{MoveToAdvanceResult, RefundResult};
use crate::services::tenant_resolver::TenantContext;
use crate::startup::AppState;

/// Register a pending payment when a checkout is opened.
pub async fn register_payment(
    State(state): State<AppState>,
    context: TenantContext,
    Json(payload): Json<RegisterPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentRecord>), AppError> {
    let payment = state
        .engine
        .register_pending_payment(
            &context.tenant,
            &NewPendingPayment {
                fee_assignment_id: payload.fee_assignment_id,
                amount: payload.amount,
                gateway_transaction_id: payload.gateway_transaction_id,
                split_settlement: payload.split_settlement,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    context: TenantContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentDetailResponse>, AppError> {
    let tenant_id = context.tenant_id();
    let payment = state
        .store
        .get_payment(tenant_id, payment_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))?;
    let income_entries = state
        .store
        .list_income_for_payment(tenant_id, payment_id)
        .await?;

    Ok(Json(PaymentDetailResponse {
        payment,
        income_entries,
    }))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    context: TenantContext,
    Actor(actor): Actor,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<CompensationRequest>,
) -> Result<Json<RefundResult>, AppError> {
    let result = state
        .compensation
        .refund(&context.tenant, payment_id, &payload.reason, &actor)
        .await?;
    Ok(Json(result))
}

pub async fn move_payment_to_advance(
    State(state): State<AppState>,
    context: TenantContext,
    Actor(actor): Actor,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<CompensationRequest>,
) -> Result<Json<MoveToAdvanceResult>, AppError> {
    let result = state
        .compensation
        .move_to_advance(&context.tenant, payment_id, &payload.reason, &actor)
        .await?;
    Ok(Json(result))
}

/// Audit trail of compensations applied to a payment.
pub async fn list_compensations(
    State(state): State<AppState>,
    context: TenantContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Vec<CompensationEntry>>, AppError> {
    let tenant_id = context.tenant_id();
    if state.store.get_payment(tenant_id, payment_id).await?.is_none() {
        return Err(LedgerError::NotFound(format!("payment {}", payment_id)).into());
    }
    Ok(Json(state.store.list_compensations(tenant_id, payment_id).await?))
}
