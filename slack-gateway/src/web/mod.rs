//! Web server module for receiving Slack callbacks.
//!
//! This module provides a thin, fast web server that:
//! - Answers the `url_verification` handshake
//! - Verifies request signatures
//! - Publishes verified payloads to RabbitMQ
//! - Returns 200 OK once the broker confirms
//!
//! All business processing happens in the worker.

pub mod challenge;
pub mod handlers;
pub mod signature;

pub use challenge::{respond, ChallengeResponse};
pub use handlers::{handle_request, health, router, slack_webhook, AppState, PipelineOutcome};
pub use signature::{verify_slack_signature, SigningContext, Verified};
