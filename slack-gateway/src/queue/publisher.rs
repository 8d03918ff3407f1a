//! Async RabbitMQ publisher for the hand-off channel.
//!
//! The publisher keeps one connection and channel shared across request
//! tasks, reconnecting lazily. Publisher confirms are enabled, so a publish
//! only succeeds once the broker has taken responsibility for the message.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::types::{
    DispatchEnvelope, DISPATCH_BINDING, DISPATCH_EXCHANGE, DISPATCH_QUEUE,
};
use crate::classify::ClassifiedEvent;
use crate::error::DispatchError;
use crate::web::signature::Verified;

/// Durable hand-off channel.
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    /// Publish an envelope, returning only after the broker acknowledged it.
    async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), DispatchError>;
}

/// Seal a verified event and publish it, bounded by `timeout`.
///
/// No retry happens here. A failure is reported to the caller, which answers
/// Slack with a server error so Slack re-delivers the request.
pub async fn dispatch(
    publisher: &dyn EnvelopePublisher,
    event: ClassifiedEvent,
    proof: Verified,
    timeout: Duration,
) -> Result<(), DispatchError> {
    let envelope = DispatchEnvelope::seal(event, proof)?;

    match tokio::time::timeout(timeout, publisher.publish(&envelope)).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                routing_key = %envelope.routing_key,
                timeout_ms = timeout.as_millis() as u64,
                "dispatch_publish_timeout"
            );
            Err(DispatchError::unavailable("broker acknowledgment timed out"))
        }
    }
}

/// RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct AmqpPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpPublisher {
    /// Create a new publisher with the given RabbitMQ URL.
    pub fn new(url: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        declare_topology(&ch).await?;

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }

    async fn publish_confirmed(&self, envelope: &DispatchEnvelope) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = envelope.to_bytes().context("Failed to serialize envelope")?;
        let message_id = DispatchEnvelope::message_id(&body);

        let confirmation = channel
            .basic_publish(
                DISPATCH_EXCHANGE,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into()),
            )
            .await
            .context("Failed to publish envelope")?
            .await
            .context("Failed to confirm publish")?;

        if confirmation.is_nack() {
            anyhow::bail!("Broker rejected envelope {}", message_id);
        }

        info!(
            exchange = DISPATCH_EXCHANGE,
            routing_key = %envelope.routing_key,
            message_id = %message_id,
            body_length = body.len(),
            "rabbitmq_envelope_published"
        );

        Ok(())
    }
}

#[async_trait]
impl EnvelopePublisher for AmqpPublisher {
    async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), DispatchError> {
        self.publish_confirmed(envelope).await.map_err(|e| {
            error!(error = %e, routing_key = %envelope.routing_key, "rabbitmq_publish_failed");
            DispatchError::unavailable(e.to_string())
        })
    }
}

/// Declare the exchange, queue and binding (idempotent).
pub async fn declare_topology(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(
            DISPATCH_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare dispatch exchange")?;

    channel
        .queue_declare(
            DISPATCH_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare dispatch queue")?;

    channel
        .queue_bind(
            DISPATCH_QUEUE,
            DISPATCH_EXCHANGE,
            DISPATCH_BINDING,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to bind dispatch queue")?;

    info!(
        exchange = DISPATCH_EXCHANGE,
        queue = DISPATCH_QUEUE,
        binding = DISPATCH_BINDING,
        "rabbitmq_topology_declared"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::classify::{classify, ContentKind};
    use crate::queue::types::tests::verified;
    use crate::queue::EnvelopeKind;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<DispatchEnvelope>>,
    }

    #[async_trait]
    impl EnvelopePublisher for RecordingPublisher {
        async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), DispatchError> {
            self.published.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl EnvelopePublisher for HangingPublisher {
        async fn publish(&self, _envelope: &DispatchEnvelope) -> Result<(), DispatchError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_publisher_creation() {
        let publisher = AmqpPublisher::new("amqp://localhost:5672".to_string());
        assert!(Arc::strong_count(&publisher.inner) == 1);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_sealed_envelope() {
        let body = b"command=%2Fdeploy&text=prod";
        let event = classify("commands", body, ContentKind::FormEncoded).unwrap();
        let publisher = RecordingPublisher::default();

        dispatch(&publisher, event, verified(body), Duration::from_secs(1))
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, EnvelopeKind::Command);
        assert_eq!(published[0].field("text"), Some("prod"));
    }

    #[tokio::test]
    async fn test_dispatch_times_out_as_unavailable() {
        let body = b"command=%2Fdeploy";
        let event = classify("commands", body, ContentKind::FormEncoded).unwrap();

        let err = dispatch(&HangingPublisher, event, verified(body), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable() {
        let publisher = AmqpPublisher::new("amqp://127.0.0.1:1/".to_string());
        let body = b"command=%2Fdeploy";
        let event = classify("commands", body, ContentKind::FormEncoded).unwrap();

        let err = dispatch(&publisher, event, verified(body), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Unavailable { .. }));
    }
}
