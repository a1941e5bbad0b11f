//! Tenant context middleware for multi-tenancy support.
//!
//! Resolves the tenant once per request from the Host header (or the
//! platform override header) and stores it in the request extensions.
//! Handlers read it back through the `TenantContext` extractor.
//!
//! The override header and the acting user are trusted only on requests the
//! signature middleware has verified. Gateway webhooks are the exception for
//! the override: their body HMAC is checked against the resolved tenant.

use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use service_core::error::AppError;
use service_core::middleware::signature::VerifiedClient;

use crate::services::tenant_resolver::TenantContext;
use crate::startup::AppState;

/// Header a platform operator uses to name the school to act on.
pub const TENANT_HANDLE_HEADER: &str = "x-tenant-handle";

/// Header carrying the authenticated user making the request.
pub const ACTOR_HEADER: &str = "x-user-id";

/// Routes authenticated by the gateway's own signature instead of ours.
pub const WEBHOOK_PATH_PREFIX: &str = "/webhooks/";

pub async fn tenant_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string));
    let handle = request
        .headers()
        .get(TENANT_HANDLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let allow_override = request.extensions().get::<VerifiedClient>().is_some()
        || request.uri().path().starts_with(WEBHOOK_PATH_PREFIX);

    let context = state
        .resolver
        .resolve(host.as_deref(), handle.as_deref(), allow_override)
        .await?;

    tracing::Span::current().record("tenant_id", tracing::field::display(context.tenant_id()));
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Tenant context missing; route is not behind the tenant middleware"
                ))
            })
    }
}

/// Identity of the person performing a manual ledger action.
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let client = parts.extensions.get::<VerifiedClient>().ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Manual ledger actions must be signed"))
        })?;
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

        tracing::Span::current().record("user_id", actor);
        tracing::debug!(client_id = %client.0, user_id = %actor, "Actor vouched for by signed client");
        Ok(Actor(actor.to_string()))
    }
}
