use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn hmac_hex(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn hex_matches(expected: &str, supplied: &str) -> bool {
    let supplied = supplied.trim().to_ascii_lowercase();
    let expected_bytes = expected.as_bytes();
    let signature_bytes = supplied.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return false;
    }
    expected_bytes.ct_eq(signature_bytes).into()
}

/// Generate a hex-encoded HMAC-SHA256 signature over raw bytes.
///
/// Webhook bodies are signed exactly as received; callers must pass the
/// unparsed request bytes, never a re-serialized document.
pub fn generate_signature(secret: &str, body: &[u8]) -> Result<String, anyhow::Error> {
    hmac_hex(secret, body)
}

/// Verify a hex-encoded HMAC-SHA256 signature using constant-time comparison.
///
/// Hex case is normalised before comparing; any length mismatch is a failure.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, body)?;
    Ok(hex_matches(&expected_signature, signature))
}

/// Sign an API request.
///
/// Format: HMAC-SHA256(method|path|timestamp|nonce|sha256(body), secret)
pub fn generate_request_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Result<String, anyhow::Error> {
    let body_hash = hex::encode(Sha256::digest(body));
    let payload = format!("{}|{}|{}|{}|{}", method, path, timestamp, nonce, body_hash);
    hmac_hex(secret, payload.as_bytes())
}

/// Verify an API request signature using constant-time comparison.
pub fn verify_request_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = generate_request_signature(secret, method, path, timestamp, nonce, body)?;
    Ok(hex_matches(&expected, signature))
}
