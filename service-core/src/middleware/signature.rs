use crate::error::AppError;
use crate::utils::signature::verify_request_signature;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const NONCE_HEADER: &str = "x-nonce";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Accepted distance between the signed timestamp and server time.
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Clone, Debug, Default)]
pub struct SignatureConfig {
    pub require_signatures: bool,
    pub excluded_paths: Vec<String>,
}

/// Request extension set once a request signature has been verified.
///
/// Handlers that act on behalf of a person, or outside the caller's own
/// tenant, require it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedClient(pub String);

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Claim `nonce` for `client_id`; `false` means it was already used.
    async fn validate_nonce(&self, client_id: &str, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();
    let path = req.uri().path();

    if config
        .excluded_paths
        .iter()
        .any(|p| path == p || path.starts_with(p))
    {
        return Ok(next.run(req).await);
    }

    if !config.require_signatures && !req.headers().contains_key(SIGNATURE_HEADER) {
        return Ok(next.run(req).await);
    }

    let (client_id, timestamp_str, nonce, signature) = extract_auth_data(req.headers())?;

    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid timestamp format")))?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Request timestamp expired"
        )));
    }

    let secret = state.get_signing_secret(&client_id).await?;
    let secret = secret.ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Invalid Client ID")))?;

    let (mut parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    let is_valid = verify_request_signature(
        &secret,
        parts.method.as_str(),
        parts.uri.path(),
        timestamp,
        &nonce,
        &bytes,
        &signature,
    )
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        tracing::warn!(client_id = %client_id, path = %parts.uri.path(), "Invalid request signature");
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid signature")));
    }

    // Only a correctly signed request may spend a nonce.
    if !state.validate_nonce(&client_id, &nonce).await? {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Replay detected (nonce used)"
        )));
    }

    parts.extensions.insert(VerifiedClient(client_id));
    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn extract_auth_data(headers: &HeaderMap) -> Result<(String, String, String, String), AppError> {
    let client_id = get_header(headers, CLIENT_ID_HEADER)?;
    let timestamp = get_header(headers, TIMESTAMP_HEADER)?;
    let nonce = get_header(headers, NONCE_HEADER)?;
    let signature = get_header(headers, SIGNATURE_HEADER)?;
    Ok((client_id, timestamp, nonce, signature))
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}
