//! Fee assignment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{CreateFeeAssignmentRequest, FeeAssignmentDetailResponse, SettleFromWalletRequest};
use crate::error::LedgerError;
use crate::middleware::Actor;
use crate::models::{FeeAssignment, NewFeeAssignment};
use crate::services::tenant_resolver::TenantContext;
use crate::services::wallet::WalletSettlement;
use crate::startup::AppState;

pub async fn create_fee_assignment(
    State(state): State<AppState>,
    context: TenantContext,
    Json(payload): Json<CreateFeeAssignmentRequest>,
) -> Result<(StatusCode, Json<FeeAssignment>), AppError> {
    let assignment = FeeAssignment::new(
        &NewFeeAssignment {
            tenant_id: context.tenant_id(),
            student_id: payload.student_id,
            fee_head_id: payload.fee_head_id,
            amount: payload.amount,
            discount: payload.discount,
            due_date: payload.due_date,
        },
        Utc::now(),
    )?;
    state.store.create_fee_assignment(&assignment).await?;

    tracing::info!(
        tenant_id = %assignment.tenant_id,
        fee_assignment_id = %assignment.fee_assignment_id,
        student_id = %assignment.student_id,
        "Fee assigned"
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

pub async fn get_fee_assignment(
    State(state): State<AppState>,
    context: TenantContext,
    Path(fee_assignment_id): Path<Uuid>,
) -> Result<Json<FeeAssignmentDetailResponse>, AppError> {
    let tenant_id = context.tenant_id();
    let assignment = state
        .store
        .get_fee_assignment(tenant_id, fee_assignment_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("fee assignment {}", fee_assignment_id)))?;
    let payments = state
        .store
        .list_payments_for_assignment(tenant_id, fee_assignment_id)
        .await?;

    Ok(Json(FeeAssignmentDetailResponse {
        outstanding: assignment.outstanding(),
        assignment,
        payments,
    }))
}

pub async fn list_student_fee_assignments(
    State(state): State<AppState>,
    context: TenantContext,
    Path(student_id): Path<Uuid>,
) -> Result<Json<Vec<FeeAssignment>>, AppError> {
    Ok(Json(
        state
            .store
            .list_fee_assignments_for_student(context.tenant_id(), student_id)
            .await?,
    ))
}

pub async fn delete_fee_assignment(
    State(state): State<AppState>,
    context: TenantContext,
    Path(fee_assignment_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_fee_assignment(context.tenant_id(), fee_assignment_id)
        .await?;
    if !deleted {
        return Err(LedgerError::NotFound(format!("fee assignment {}", fee_assignment_id)).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn settle_from_wallet(
    State(state): State<AppState>,
    context: TenantContext,
    Actor(actor): Actor,
    Path(fee_assignment_id): Path<Uuid>,
    Json(payload): Json<SettleFromWalletRequest>,
) -> Result<Json<WalletSettlement>, AppError> {
    let settlement = state
        .wallet
        .settle_fee_from_wallet(&context.tenant, fee_assignment_id, payload.amount, &actor)
        .await?;
    Ok(Json(settlement))
}
