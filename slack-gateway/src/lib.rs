//! SlackGate - Inbound Slack webhook gateway.
//!
//! This library provides shared modules for the two SlackGate binaries:
//! - `slackgate-web`: Thin web server that authenticates and enqueues callbacks
//! - `slackgate-worker`: Consumer that runs business handlers or acknowledges
//!
//! ## Architecture
//!
//! ```text
//! Slack → Web Server → slack_gateway exchange → slack_dispatch → Worker → response_url
//! ```

pub mod callback;
pub mod classify;
pub mod config;
pub mod error;
pub mod processor;
pub mod queue;
pub mod secrets;
pub mod web;

// Re-export commonly used types
pub use classify::{classify, ClassifiedEvent, ContentKind, EventKind};
pub use config::Config;
pub use error::{
    AuthenticationError, ClassificationError, DispatchError, GatewayError, MissingField,
    SecretError,
};
pub use processor::{BusinessHandler, CommandView, Handlers, InteractionView, Outcome, Processor};
pub use queue::{
    AmqpPublisher, DispatchEnvelope, EnvelopeKind, EnvelopePublisher, DISPATCH_EXCHANGE,
    DISPATCH_QUEUE,
};
pub use web::AppState;
