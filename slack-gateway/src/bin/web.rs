//! SlackGate Web Server - Slack callback receiver.
//!
//! This binary provides a thin, fast web server that:
//! - Answers the Slack `url_verification` handshake
//! - Verifies request signatures
//! - Publishes verified payloads to RabbitMQ
//! - Returns 200 OK once the broker confirms
//!
//! All business processing happens in the worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slackgate::secrets::{CachedSecretStore, EnvSecretStore, SecretStore};
use slackgate::web::{router, AppState};
use slackgate::{AmqpPublisher, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        replay_window_secs = config.replay_window_secs,
        dispatch_timeout_ms = config.dispatch_timeout_ms,
        secret_cache_ttl_secs = config.secret_cache_ttl_secs,
        "config_loaded"
    );

    // Create RabbitMQ publisher (connects lazily on first dispatch)
    let publisher = AmqpPublisher::new(config.cloudamqp_url.clone());
    info!("rabbitmq_publisher_created");

    // Signing secret and verification token lookups
    let secrets: Arc<dyn SecretStore> = match config.secret_cache_ttl() {
        Some(ttl) => Arc::new(CachedSecretStore::new(EnvSecretStore, ttl)),
        None => Arc::new(EnvSecretStore),
    };

    // Build the router
    let port = config.port;
    let state = AppState::new(config, Arc::new(publisher.clone()), secrets);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close publisher connection
    publisher.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
