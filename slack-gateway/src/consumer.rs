//! RabbitMQ consumer module using lapin.
//!
//! Connects to RabbitMQ, consumes envelopes from the `slack_dispatch` queue
//! and spawns a task per delivery. Each task maps the processor's
//! [`Outcome`] onto `basic_ack` / `basic_nack`.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use tokio::signal;
use tracing::{error, info, warn};

use slackgate::queue::declare_topology;
use slackgate::{Config, Outcome, Processor, DISPATCH_QUEUE};

/// Run the RabbitMQ consumer until SIGINT/SIGTERM or the broker closes it.
pub async fn run(config: Config, processor: Processor) -> Result<()> {
    let processor = Arc::new(processor);

    // Connect to RabbitMQ
    info!(url_length = config.cloudamqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.cloudamqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    // Create a channel
    let channel = conn.create_channel().await.context("Failed to create channel")?;

    // Set QoS (prefetch count bounds how many deliveries are in flight)
    let prefetch = prefetch_count(config.worker_concurrency);
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch, "rabbitmq_qos_set");

    // Declare exchange, queue and binding
    declare_topology(&channel).await?;

    // Start consuming messages
    let mut consumer = channel
        .basic_consume(
            DISPATCH_QUEUE,
            "slackgate-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = DISPATCH_QUEUE, "rabbitmq_consumer_started");
    info!("worker_ready");

    let channel = Arc::new(channel);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        let message_id = delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                        info!(
                            queue = DISPATCH_QUEUE,
                            message_id = %message_id,
                            delivery_tag = delivery_tag,
                            redelivered = delivery.redelivered,
                            "rabbitmq_envelope_received"
                        );

                        // Clone resources for the spawned task
                        let processor = Arc::clone(&processor);
                        let channel = Arc::clone(&channel);

                        // Spawn a task so deliveries are processed concurrently
                        tokio::spawn(async move {
                            let outcome = processor.process_delivery(&delivery.data).await;

                            // Settle the delivery according to the outcome
                            let result = match outcome {
                                Outcome::Ack => {
                                    channel
                                        .basic_ack(delivery_tag, BasicAckOptions::default())
                                        .await
                                }
                                Outcome::Nack { requeue } => {
                                    channel
                                        .basic_nack(
                                            delivery_tag,
                                            BasicNackOptions {
                                                requeue,
                                                ..Default::default()
                                            },
                                        )
                                        .await
                                }
                            };

                            match result {
                                Ok(()) => info!(
                                    message_id = %message_id,
                                    outcome = ?outcome,
                                    "rabbitmq_envelope_settled"
                                ),
                                Err(e) => error!(
                                    delivery_tag = delivery_tag,
                                    outcome = ?outcome,
                                    error = %e,
                                    "rabbitmq_settle_failed"
                                ),
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    info!("worker_shutdown_complete");
    Ok(())
}

/// AMQP prefetch for the configured concurrency. A prefetch of 0 means
/// "unlimited" to the broker, so the value is kept within `1..=u16::MAX`.
fn prefetch_count(concurrency: usize) -> u16 {
    concurrency.clamp(1, u16::MAX as usize) as u16
}

/// Completes when SIGINT or SIGTERM is received.
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
}
