//! Read-only ledger views.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{AdvanceBalanceResponse, IncomeReportResponse};
use crate::error::LedgerError;
use crate::models::IncomeRange;
use crate::services::tenant_resolver::TenantContext;
use crate::startup::AppState;

pub async fn get_advance_balance(
    State(state): State<AppState>,
    context: TenantContext,
    Path(student_id): Path<Uuid>,
) -> Result<Json<AdvanceBalanceResponse>, AppError> {
    let tenant_id = context.tenant_id();
    let balance = state.store.get_advance_balance(tenant_id, student_id).await?;
    let transactions = state
        .store
        .list_wallet_transactions(tenant_id, student_id)
        .await?;

    Ok(Json(AdvanceBalanceResponse::new(
        student_id,
        balance,
        transactions,
    )))
}

/// Income ledger for the tenant, optionally limited to `[from, to)`.
pub async fn list_income(
    State(state): State<AppState>,
    context: TenantContext,
    Query(range): Query<IncomeRange>,
) -> Result<Json<IncomeReportResponse>, AppError> {
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if from > to {
            return Err(LedgerError::Validation("'from' must not be after 'to'".into()).into());
        }
    }
    let entries = state.store.list_income(context.tenant_id(), range).await?;
    Ok(Json(entries.into()))
}
