//! Slack request signature verification.
//!
//! Slack signs every request using HMAC-SHA256 over `v0:{timestamp}:{body}`.
//! Reference: https://api.slack.com/authentication/verifying-requests-from-slack

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::error::AuthenticationError;

type HmacSha256 = Hmac<Sha256>;

/// Protocol version tag prefixed to both the base string and the signature.
pub const SIGNATURE_VERSION: &str = "v0";

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

/// Header carrying the request timestamp in epoch seconds.
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Secret and clock reading used for a single verification.
pub struct SigningContext {
    pub secret: Vec<u8>,
    /// Current wall-clock time in Unix epoch seconds
    pub now: i64,
}

impl SigningContext {
    pub fn new(secret: impl Into<Vec<u8>>, now: i64) -> Self {
        Self {
            secret: secret.into(),
            now,
        }
    }

    /// Context stamped with the current system time.
    pub fn at_current_time(secret: impl Into<Vec<u8>>) -> Self {
        Self::new(secret, unix_now())
    }
}

/// Proof that a request passed signature verification.
///
/// Only [`verify_slack_signature`] can construct one, and the dispatcher
/// requires it.
#[derive(Debug)]
pub struct Verified {
    _private: (),
}

/// Verify a Slack request signature.
///
/// # Arguments
///
/// * `signature` - The `X-Slack-Signature` header (`v0=<hex>`)
/// * `timestamp` - The `X-Slack-Request-Timestamp` header
/// * `raw_body` - The request body exactly as received
/// * `context` - Signing secret and current time
/// * `replay_window_secs` - Maximum allowed distance from now (inclusive)
pub fn verify_slack_signature(
    signature: &str,
    timestamp: &str,
    raw_body: &[u8],
    context: &SigningContext,
    replay_window_secs: u64,
) -> Result<Verified, AuthenticationError> {
    let request_time: i64 = match timestamp.trim().parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp_length = timestamp.len(), "slack_signature_invalid_timestamp");
            return Err(AuthenticationError::MalformedTimestamp);
        }
    };

    // Reject stale and future timestamps (prevents replay attacks)
    let age = context.now.abs_diff(request_time);
    if age > replay_window_secs {
        warn!(
            request_time = request_time,
            current_time = context.now,
            age_seconds = age,
            replay_window_secs = replay_window_secs,
            "slack_signature_stale"
        );
        return Err(AuthenticationError::StaleOrFutureRequest);
    }

    let provided = match signature
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .map(hex::decode)
    {
        Some(Ok(bytes)) => bytes,
        _ => {
            warn!(signature_length = signature.len(), "slack_signature_malformed");
            return Err(AuthenticationError::BadSignature);
        }
    };

    let mac = signing_mac(&context.secret, timestamp.trim(), raw_body)?;

    // verify_slice compares in constant time
    if mac.verify_slice(&provided).is_err() {
        warn!(actual_length = provided.len(), "slack_signature_mismatch");
        return Err(AuthenticationError::BadSignature);
    }

    Ok(Verified { _private: () })
}

/// Compute `v0=hex(HMAC-SHA256(secret, "v0:{timestamp}:{body}"))`.
pub fn compute_signature(
    secret: &[u8],
    timestamp: &str,
    raw_body: &[u8],
) -> Result<String, AuthenticationError> {
    let mac = signing_mac(secret, timestamp, raw_body)?;

    Ok(format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// HMAC keyed with `secret` and fed the `v0:{timestamp}:{body}` base string.
fn signing_mac(
    secret: &[u8],
    timestamp: &str,
    raw_body: &[u8],
) -> Result<HmacSha256, AuthenticationError> {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => {
            warn!("slack_signature_invalid_key");
            return Err(AuthenticationError::BadSignature);
        }
    };

    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(raw_body);

    Ok(mac)
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Current time in Unix epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
