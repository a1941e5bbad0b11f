//! Razorpay webhook intake.
//!
//! Authenticates raw webhook bodies and turns them into ledger events. The
//! HMAC is checked over the exact received bytes before anything is parsed.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::utils::signature::verify_signature;

use crate::error::LedgerError;
use crate::models::Tenant;
use crate::services::reconciliation::{PaymentCaptured, TransferEvent, TransferOutcome};

/// Razorpay webhook envelope.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookEntity<PaymentEntity>>,
    pub transfer: Option<WebhookEntity<TransferEntity>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntity<T> {
    pub entity: T,
}

/// Razorpay payment entity. Amounts are in paise.
#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub amount: u64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub order_id: Option<String>,
    pub status: Option<String>,
}

/// Razorpay route transfer entity. `source` is the payment or order it was
/// split from.
#[derive(Debug, Deserialize)]
pub struct TransferEntity {
    pub id: String,
    pub source: String,
}

fn default_currency() -> String {
    "INR".to_string()
}

/// A signed webhook that passed authentication.
#[derive(Debug)]
pub struct AuthenticatedEvent {
    pub event_type: String,
    pub raw: serde_json::Value,
}

/// Ledger-facing classification of an authenticated event.
#[derive(Debug)]
pub enum IntakeEvent {
    PaymentCaptured(PaymentCaptured),
    TransferProcessed(TransferEvent),
    TransferFailed(TransferEvent),
    Unknown(String),
}

impl IntakeEvent {
    pub fn label(&self) -> &str {
        match self {
            IntakeEvent::PaymentCaptured(_) => "payment.captured",
            IntakeEvent::TransferProcessed(_) => "transfer.processed",
            IntakeEvent::TransferFailed(_) => "transfer.failed",
            IntakeEvent::Unknown(_) => "unknown",
        }
    }
}

/// Convert paise to currency units.
pub fn paise_to_amount(paise: u64) -> Result<Decimal, LedgerError> {
    let paise = i64::try_from(paise)
        .map_err(|_| LedgerError::Validation(format!("amount {} out of range", paise)))?;
    Ok(Decimal::new(paise, 2))
}

#[derive(Clone)]
pub struct PaymentIntake {
    platform_secret: Secret<String>,
}

impl PaymentIntake {
    pub fn new(platform_secret: Secret<String>) -> Self {
        Self { platform_secret }
    }

    /// Verify the webhook signature with the tenant's secret, falling back to
    /// the platform secret, then parse the body.
    pub fn authenticate(
        &self,
        tenant: &Tenant,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<AuthenticatedEvent, LedgerError> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::Auth("missing webhook signature".to_string()))?;

        let secret = tenant
            .webhook_secret
            .as_ref()
            .unwrap_or(&self.platform_secret)
            .expose_secret();
        if secret.is_empty() {
            return Err(LedgerError::Auth(
                "no webhook secret configured".to_string(),
            ));
        }

        let valid = verify_signature(secret, raw_body, signature)
            .map_err(|e| LedgerError::Auth(format!("signature check failed: {}", e)))?;
        if !valid {
            tracing::warn!(tenant_id = %tenant.tenant_id, "Invalid webhook signature");
            return Err(LedgerError::Auth("invalid webhook signature".to_string()));
        }

        let raw: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| LedgerError::Validation(format!("malformed webhook body: {}", e)))?;
        let event_type = raw
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LedgerError::Validation("webhook body has no event type".to_string()))?
            .to_string();

        Ok(AuthenticatedEvent { event_type, raw })
    }

    /// Route an authenticated event by its type.
    pub fn classify(&self, event: AuthenticatedEvent) -> Result<IntakeEvent, LedgerError> {
        match event.event_type.as_str() {
            "payment.captured" => {
                let parsed = parse_envelope(&event.raw)?;
                let payment = parsed
                    .payload
                    .payment
                    .ok_or_else(|| {
                        LedgerError::Validation("payment.captured without payment entity".into())
                    })?
                    .entity;
                let order_id = payment.order_id.clone().ok_or_else(|| {
                    LedgerError::Validation(format!("payment {} has no order id", payment.id))
                })?;

                Ok(IntakeEvent::PaymentCaptured(PaymentCaptured {
                    gateway_transaction_id: order_id,
                    gateway_payment_id: payment.id,
                    amount: paise_to_amount(payment.amount)?,
                    currency: payment.currency,
                    raw_payload: event.raw,
                }))
            }
            "transfer.processed" | "transfer.failed" => {
                let outcome = if event.event_type == "transfer.processed" {
                    TransferOutcome::Processed
                } else {
                    TransferOutcome::Failed
                };
                let parsed = parse_envelope(&event.raw)?;
                let transfer = parsed
                    .payload
                    .transfer
                    .ok_or_else(|| {
                        LedgerError::Validation("transfer event without transfer entity".into())
                    })?
                    .entity;

                let transfer_event = TransferEvent {
                    source_reference: transfer.source,
                    transfer_id: transfer.id,
                    outcome,
                };
                Ok(match outcome {
                    TransferOutcome::Processed => IntakeEvent::TransferProcessed(transfer_event),
                    TransferOutcome::Failed => IntakeEvent::TransferFailed(transfer_event),
                })
            }
            other => Ok(IntakeEvent::Unknown(other.to_string())),
        }
    }
}

fn parse_envelope(raw: &serde_json::Value) -> Result<WebhookEvent, LedgerError> {
    WebhookEvent::deserialize(raw)
        .map_err(|e| LedgerError::Validation(format!("malformed webhook payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanFeature, DEFAULT_COMMISSION_PERCENT};
    use service_core::utils::signature::generate_signature;
    use uuid::Uuid;

    const PLATFORM_SECRET: &str = "platform_whsec";

    fn tenant(secret: Option<&str>) -> Tenant {
        Tenant {
            tenant_id: Uuid::new_v4(),
            subdomain: "greenwood".to_string(),
            webhook_secret: secret.map(|s| Secret::new(s.to_string())),
            features: vec![PlanFeature::OnlinePayments],
            commission_percent: DEFAULT_COMMISSION_PERCENT,
            active: true,
        }
    }

    fn intake() -> PaymentIntake {
        PaymentIntake::new(Secret::new(PLATFORM_SECRET.to_string()))
    }

    fn captured_body() -> Vec<u8> {
        serde_json::json!({
            "entity": "event",
            "account_id": "acc_test",
            "event": "payment.captured",
            "contains": ["payment"],
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_123",
                        "amount": 450000,
                        "currency": "INR",
                        "status": "captured",
                        "order_id": "order_abc"
                    }
                }
            },
            "created_at": 1700000000
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn tenant_secret_takes_precedence() {
        let body = captured_body();
        let tenant = tenant(Some("school_whsec"));

        let platform_sig = generate_signature(PLATFORM_SECRET, &body).unwrap();
        assert!(matches!(
            intake().authenticate(&tenant, &body, Some(&platform_sig)),
            Err(LedgerError::Auth(_))
        ));

        let tenant_sig = generate_signature("school_whsec", &body).unwrap();
        assert!(intake().authenticate(&tenant, &body, Some(&tenant_sig)).is_ok());
    }

    #[test]
    fn missing_signature_is_rejected_before_parsing() {
        let err = intake()
            .authenticate(&tenant(None), b"not json", None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Auth(_)));
    }

    #[test]
    fn malformed_body_with_valid_signature_is_validation_error() {
        let body = b"{not json".to_vec();
        let sig = generate_signature(PLATFORM_SECRET, &body).unwrap();
        let err = intake()
            .authenticate(&tenant(None), &body, Some(&sig))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn classifies_payment_captured_in_rupees() {
        let body = captured_body();
        let sig = generate_signature(PLATFORM_SECRET, &body).unwrap();
        let event = intake()
            .authenticate(&tenant(None), &body, Some(&sig))
            .unwrap();

        match intake().classify(event).unwrap() {
            IntakeEvent::PaymentCaptured(captured) => {
                assert_eq!(captured.gateway_transaction_id, "order_abc");
                assert_eq!(captured.gateway_payment_id, "pay_123");
                assert_eq!(captured.amount, Decimal::from(4500));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn classifies_transfer_events_and_unknowns() {
        let failed = AuthenticatedEvent {
            event_type: "transfer.failed".to_string(),
            raw: serde_json::json!({
                "event": "transfer.failed",
                "payload": { "transfer": { "entity": { "id": "trf_1", "source": "pay_123" } } }
            }),
        };
        assert!(matches!(
            intake().classify(failed).unwrap(),
            IntakeEvent::TransferFailed(TransferEvent { ref transfer_id, .. }) if transfer_id == "trf_1"
        ));

        let unknown = AuthenticatedEvent {
            event_type: "refund.created".to_string(),
            raw: serde_json::json!({ "event": "refund.created" }),
        };
        assert!(matches!(
            intake().classify(unknown).unwrap(),
            IntakeEvent::Unknown(ref t) if t == "refund.created"
        ));
    }
}
