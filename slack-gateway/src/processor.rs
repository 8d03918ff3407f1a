//! Envelope processing for the worker.
//!
//! Delivery is at-least-once: the same envelope can arrive more than once.
//! The worker does not deduplicate, so every [`BusinessHandler`] must be
//! idempotent (for example keyed on `trigger_id`).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::callback::{Callback, CallbackMessage, DEFAULT_RESPONSE_TYPE};
use crate::error::MissingField;
use crate::queue::{DispatchEnvelope, EnvelopeKind};

/// Broker acknowledgment for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// `requeue: false` drops (or dead-letters) a message that can never succeed.
    Nack { requeue: bool },
}

/// Business logic for a validated envelope. Must be idempotent.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    async fn handle(&self, envelope: &DispatchEnvelope) -> Result<()>;
}

/// Handlers per envelope kind. A missing handler means the default
/// acknowledgment is sent instead.
#[derive(Clone, Default)]
pub struct Handlers {
    pub command: Option<Arc<dyn BusinessHandler>>,
    pub interaction: Option<Arc<dyn BusinessHandler>>,
}

/// Fields read from a slash command. Only `command` is required; the
/// optional fields are read when they are strings and ignored otherwise.
#[derive(Debug)]
pub struct CommandView<'a> {
    pub command: &'a str,
    pub text: &'a str,
    pub response_url: Option<&'a str>,
    pub response_type: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub channel_id: Option<&'a str>,
    pub trigger_id: Option<&'a str>,
}

impl<'a> CommandView<'a> {
    pub fn from_payload(payload: &'a Map<String, Value>) -> Result<Self, MissingField> {
        Ok(Self {
            command: string_field(payload, "command").ok_or(MissingField("command"))?,
            text: string_field(payload, "text").unwrap_or_default(),
            response_url: string_field(payload, "response_url"),
            response_type: string_field(payload, "response_type"),
            user_id: string_field(payload, "user_id"),
            channel_id: string_field(payload, "channel_id"),
            trigger_id: string_field(payload, "trigger_id"),
        })
    }
}

/// Fields read from an interaction or event callback. Only `type` is required.
#[derive(Debug)]
pub struct InteractionView<'a> {
    pub interaction_type: &'a str,
    pub response_url: Option<&'a str>,
}

impl<'a> InteractionView<'a> {
    pub fn from_payload(payload: &'a Map<String, Value>) -> Result<Self, MissingField> {
        Ok(Self {
            interaction_type: string_field(payload, "type").ok_or(MissingField("type"))?,
            response_url: string_field(payload, "response_url"),
        })
    }
}

fn string_field<'a>(payload: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    payload.get(name).and_then(Value::as_str)
}

/// Where and how to acknowledge the requester.
struct ReplyTarget<'a> {
    response_url: Option<&'a str>,
    response_type: Option<&'a str>,
}

pub struct Processor {
    handlers: Handlers,
    callback: Arc<dyn Callback>,
    ack_text: Option<String>,
}

impl Processor {
    pub fn new(handlers: Handlers, callback: Arc<dyn Callback>, ack_text: Option<String>) -> Self {
        Self {
            handlers,
            callback,
            ack_text,
        }
    }

    /// Decode and process a raw delivery body.
    pub async fn process_delivery(&self, data: &[u8]) -> Outcome {
        match DispatchEnvelope::from_bytes(data) {
            Ok(envelope) => self.process(envelope).await,
            Err(e) => {
                error!(
                    error = %e,
                    body_preview = %String::from_utf8_lossy(&data[..data.len().min(500)]),
                    "worker_envelope_parse_failed"
                );
                Outcome::Nack { requeue: false }
            }
        }
    }

    /// Process one envelope.
    pub async fn process(&self, envelope: DispatchEnvelope) -> Outcome {
        info!(
            kind = ?envelope.kind,
            routing_key = %envelope.routing_key,
            created_at = envelope.created_at,
            "worker_envelope_received"
        );

        let target = match reply_target(&envelope) {
            Ok(target) => target,
            Err(e) => {
                warn!(kind = ?envelope.kind, error = %e, "worker_envelope_missing_required_fields");
                return Outcome::Nack { requeue: false };
            }
        };

        let handler = match envelope.kind {
            EnvelopeKind::Command => self.handlers.command.as_ref(),
            EnvelopeKind::Interaction => self.handlers.interaction.as_ref(),
        };

        match handler {
            Some(handler) => match handler.handle(&envelope).await {
                Ok(()) => {
                    info!(kind = ?envelope.kind, "worker_handler_completed");
                    Outcome::Ack
                }
                Err(e) => {
                    error!(kind = ?envelope.kind, error = %e, "worker_handler_failed");
                    Outcome::Nack { requeue: true }
                }
            },
            None => {
                self.default_ack(target).await;
                Outcome::Ack
            }
        }
    }

    /// Best-effort acknowledgment to the requester's `response_url`.
    async fn default_ack(&self, target: ReplyTarget<'_>) {
        let Some(url) = target.response_url.filter(|u| !u.is_empty()) else {
            info!("worker_no_callback_address");
            return;
        };

        let Some(text) = self.ack_text.clone() else {
            warn!("worker_ack_text_unconfigured");
            return;
        };

        let message = CallbackMessage {
            text,
            response_type: target
                .response_type
                .unwrap_or(DEFAULT_RESPONSE_TYPE)
                .to_string(),
        };

        if let Err(e) = self.callback.post(url, &message).await {
            warn!(error = %e, "worker_default_ack_failed");
        }
    }
}

fn reply_target(envelope: &DispatchEnvelope) -> Result<ReplyTarget<'_>, MissingField> {
    match envelope.kind {
        EnvelopeKind::Command => {
            let view = CommandView::from_payload(&envelope.payload)?;
            info!(
                command = %view.command,
                text_length = view.text.len(),
                user_id = ?view.user_id,
                channel_id = ?view.channel_id,
                has_trigger_id = view.trigger_id.is_some(),
                "worker_command_view"
            );
            Ok(ReplyTarget {
                response_url: view.response_url,
                response_type: view.response_type,
            })
        }
        EnvelopeKind::Interaction => {
            let view = InteractionView::from_payload(&envelope.payload)?;
            info!(interaction_type = %view.interaction_type, "worker_interaction_view");
            Ok(ReplyTarget {
                response_url: view.response_url,
                response_type: None,
            })
        }
    }
}
