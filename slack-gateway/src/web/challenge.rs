//! Slack `url_verification` handshake.
//!
//! Slack proves endpoint ownership before it provisions the signing secret,
//! so this path is authenticated by the verification token only.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuthenticationError;
use crate::web::signature::constant_time_compare;

/// Successful handshake body. The challenge is echoed unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
}

/// Answer a handshake if the presented token matches the configured one.
pub fn respond(
    challenge: &str,
    presented_token: &str,
    configured_token: &str,
) -> Result<ChallengeResponse, AuthenticationError> {
    if configured_token.is_empty()
        || !constant_time_compare(presented_token.as_bytes(), configured_token.as_bytes())
    {
        warn!(
            presented_length = presented_token.len(),
            "slack_verification_token_mismatch"
        );
        return Err(AuthenticationError::InvalidVerificationToken);
    }

    Ok(ChallengeResponse {
        challenge: challenge.to_string(),
    })
}
