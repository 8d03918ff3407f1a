//! Hand-off message types.
//!
//! The web server publishes one [`DispatchEnvelope`] per verified request to
//! the `slack_gateway` topic exchange. The worker drains `slack_dispatch`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::classify::{ClassifiedEvent, EventKind};
use crate::error::DispatchError;
use crate::web::signature::{unix_now, Verified};

/// Topic exchange receiving every dispatched envelope.
pub const DISPATCH_EXCHANGE: &str = "slack_gateway";

/// Durable queue the worker consumes.
pub const DISPATCH_QUEUE: &str = "slack_dispatch";

/// Binding pattern connecting [`DISPATCH_QUEUE`] to [`DISPATCH_EXCHANGE`].
pub const DISPATCH_BINDING: &str = "slack.#";

/// Kinds that may travel through the hand-off channel.
///
/// Handshakes are answered inline and have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Command,
    Interaction,
}

impl TryFrom<EventKind> for EnvelopeKind {
    type Error = DispatchError;

    fn try_from(kind: EventKind) -> Result<Self, Self::Error> {
        match kind {
            EventKind::Command => Ok(EnvelopeKind::Command),
            EventKind::Interaction => Ok(EnvelopeKind::Interaction),
            EventKind::Handshake => Err(DispatchError::NotDispatchable(kind)),
        }
    }
}

/// Unit of work placed on the hand-off channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub kind: EnvelopeKind,
    pub routing_key: String,
    /// Classified payload, preserved key for key including nested values
    pub payload: Map<String, Value>,
    /// Unix epoch seconds at which the envelope was sealed
    pub created_at: i64,
}

impl DispatchEnvelope {
    /// Seal a verified event into an envelope.
    ///
    /// The [`Verified`] proof is consumed so every envelope corresponds to
    /// exactly one successful signature check.
    pub fn seal(event: ClassifiedEvent, _proof: Verified) -> Result<Self, DispatchError> {
        let kind = EnvelopeKind::try_from(event.kind())?;
        let (_, routing_key, payload) = event.into_parts();

        Ok(Self {
            kind,
            routing_key,
            payload,
            created_at: unix_now(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Content hash of the serialized envelope, used as the AMQP message id.
    pub fn message_id(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    /// String field of the payload, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}
