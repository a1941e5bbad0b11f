//! Office fee collection endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::CollectFeesRequest;
use crate::middleware::Actor;
use crate::services::collection::{CollectionReceipt, FeeCollection};
use crate::services::tenant_resolver::TenantContext;
use crate::startup::AppState;

pub async fn collect_fees(
    State(state): State<AppState>,
    context: TenantContext,
    Actor(actor): Actor,
    Path(student_id): Path<Uuid>,
    Json(payload): Json<CollectFeesRequest>,
) -> Result<(StatusCode, Json<CollectionReceipt>), AppError> {
    let receipt = state
        .collector
        .collect_fees(
            &context.tenant,
            &FeeCollection {
                student_id,
                amount_received: payload.amount_received,
                method: payload.method,
                reference: payload.reference,
                remarks: payload.remarks,
                allocations: payload.allocations,
            },
            &actor,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}
