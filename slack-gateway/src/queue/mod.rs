//! Hand-off channel between the web server and the worker.
//!
//! This module provides:
//! - The [`DispatchEnvelope`] wire type
//! - The [`EnvelopePublisher`] seam and its RabbitMQ implementation
//!
//! ## Topology
//!
//! ```text
//! Web Server → slack_gateway (topic) → slack.# → slack_dispatch → Worker
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{declare_topology, dispatch, AmqpPublisher, EnvelopePublisher};
pub use types::{
    DispatchEnvelope, EnvelopeKind, DISPATCH_BINDING, DISPATCH_EXCHANGE, DISPATCH_QUEUE,
};
