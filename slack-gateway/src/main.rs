//! SlackGate Worker - async RabbitMQ consumer for dispatched Slack callbacks.
//!
//! Drains the slack_dispatch queue. Envelopes go to a registered business
//! handler, or get the configured default acknowledgment posted to their
//! `response_url`.

mod consumer;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slackgate::callback::ReqwestCallback;
use slackgate::{Config, Handlers, Processor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration
    let config = Config::from_env();
    tracing::info!(
        cloudamqp_url_set = !config.cloudamqp_url.is_empty(),
        concurrency = config.worker_concurrency,
        callback_timeout_ms = config.callback_timeout_ms,
        ack_text_configured = config.ack_text.is_some(),
        "config_loaded"
    );

    // Shared HTTP client for response_url callbacks
    let callback = ReqwestCallback::new(config.callback_timeout())?;

    // Business handlers are registered here by the deploying application.
    let processor = Processor::new(
        Handlers::default(),
        Arc::new(callback),
        config.ack_text.clone(),
    );

    // Run the consumer until shutdown
    consumer::run(config, processor).await?;

    Ok(())
}
