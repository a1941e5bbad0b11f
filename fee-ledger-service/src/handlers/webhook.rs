//! Razorpay webhook endpoint.
//!
//! Gateway deliveries are at-least-once. Business outcomes that retrying
//! cannot change (duplicates, unknown orders, amount or currency mismatches,
//! unknown event types) are acknowledged with 200 so the gateway stops
//! redelivering. A bad signature is answered 400 and a storage failure 500.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use service_core::error::AppError;

use crate::dtos::WebhookAck;
use crate::error::LedgerError;
use crate::services::intake::IntakeEvent;
use crate::services::metrics::{record_alert, WEBHOOK_EVENTS_TOTAL};
use crate::services::reconciliation::{CaptureOutcome, TransferApplied};
use crate::services::tenant_resolver::TenantContext;
use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

pub async fn razorpay_webhook(
    State(state): State<AppState>,
    context: TenantContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let tenant_id = context.tenant_id();
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let event = state
        .intake
        .authenticate(&context.tenant, &body, signature)
        .and_then(|authenticated| state.intake.classify(authenticated))
        .map_err(|e| {
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&["unverified", "rejected"])
                .inc();
            tracing::warn!(tenant_id = %tenant_id, error = %e, "Webhook rejected");
            e
        })?;

    let label = event.label().to_string();
    tracing::info!(tenant_id = %tenant_id, event_type = %label, "Processing Razorpay webhook");

    let result = match event {
        IntakeEvent::PaymentCaptured(captured) => state
            .engine
            .apply_payment_captured(&context.tenant, &captured)
            .await
            .map(|outcome| match outcome {
                CaptureOutcome::Applied { payment, .. } => {
                    WebhookAck::new("applied").with_detail(payment.payment_id.to_string())
                }
                CaptureOutcome::AlreadyProcessed { payment_id } => {
                    WebhookAck::new("already_processed").with_detail(payment_id.to_string())
                }
            }),
        IntakeEvent::TransferProcessed(transfer) | IntakeEvent::TransferFailed(transfer) => state
            .engine
            .apply_transfer_event(&context.tenant, &transfer)
            .await
            .map(|applied| match applied {
                TransferApplied::Updated { split_status, .. } => {
                    WebhookAck::new("transfer_updated").with_detail(split_status.to_string())
                }
                TransferApplied::Unchanged { split_status, .. } => {
                    WebhookAck::new("transfer_unchanged").with_detail(split_status.to_string())
                }
            }),
        IntakeEvent::Unknown(event_type) => {
            tracing::info!(event_type = %event_type, "Unhandled webhook event type acknowledged");
            Ok(WebhookAck::new("ignored").with_detail(event_type))
        }
    };

    match result {
        Ok(ack) => {
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&[label.as_str(), ack.outcome.as_str()])
                .inc();
            Ok(Json(ack))
        }
        Err(e) if e.is_acknowledgeable() => {
            let outcome = match &e {
                LedgerError::UnknownTransaction(_) => "unknown_transaction",
                LedgerError::AmountMismatch { .. } => "amount_mismatch",
                LedgerError::CurrencyMismatch { .. } => "currency_mismatch",
                _ => "already_processed",
            };
            if label != "payment.captured" {
                // Capture alerts are raised by the engine itself.
                record_alert(outcome);
                tracing::error!(tenant_id = %tenant_id, error = %e, "Webhook acknowledged without effect");
            }
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&[label.as_str(), outcome])
                .inc();
            Ok(Json(WebhookAck::new(outcome).with_detail(e.to_string())))
        }
        Err(e) => {
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&[label.as_str(), "failed"])
                .inc();
            Err(e.into())
        }
    }
}
