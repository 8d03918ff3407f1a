//! Request classification.
//!
//! Every inbound request resolves to exactly one [`EventKind`] here, once.
//! Downstream code matches on the kind exhaustively instead of re-reading
//! a loosely typed `type` field.
//!
//! ## Form bodies
//!
//! Form-encoded bodies are read as an ordered sequence of pairs. When a key
//! repeats, the **last occurrence wins**.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ClassificationError;

/// `type` value Slack uses for the endpoint-ownership handshake.
pub const HANDSHAKE_TYPE: &str = "url_verification";

/// Form field Slack uses to carry interaction payloads as JSON.
const INTERACTION_PAYLOAD_FIELD: &str = "payload";

/// Closed set of request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Command,
    Interaction,
    Handshake,
}

impl EventKind {
    pub fn routing_key(self) -> &'static str {
        match self {
            EventKind::Command => "slack.command",
            EventKind::Interaction => "slack.interaction",
            EventKind::Handshake => "slack.handshake",
        }
    }
}

/// Body encoding implied by the `Content-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    FormEncoded,
    Json,
}

impl ContentKind {
    /// `application/x-www-form-urlencoded` is form data; anything else is
    /// treated as JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let is_form = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|mime| {
                mime.trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            })
            .unwrap_or(false);

        if is_form {
            ContentKind::FormEncoded
        } else {
            ContentKind::Json
        }
    }
}

/// Known inbound routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Slash command submissions
    Commands,
    /// Events API callbacks and interactive components
    Events,
}

impl Route {
    pub fn parse(route: &str) -> Result<Self, ClassificationError> {
        match route.trim_matches('/') {
            "commands" => Ok(Route::Commands),
            "events" => Ok(Route::Events),
            other => Err(ClassificationError::UnknownRoute(other.to_string())),
        }
    }

    fn default_kind(self) -> EventKind {
        match self {
            Route::Commands => EventKind::Command,
            Route::Events => EventKind::Interaction,
        }
    }
}

/// A classified inbound request. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEvent {
    kind: EventKind,
    payload: Map<String, Value>,
    routing_key: String,
}

impl ClassifiedEvent {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn into_parts(self) -> (EventKind, String, Map<String, Value>) {
        (self.kind, self.routing_key, self.payload)
    }

    /// String field of the payload, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

/// Classify a raw request body arriving on `route`.
pub fn classify(
    route: &str,
    raw_body: &[u8],
    content: ContentKind,
) -> Result<ClassifiedEvent, ClassificationError> {
    let route = Route::parse(route)?;

    let payload = match content {
        ContentKind::FormEncoded => {
            let fields = parse_form(raw_body)?;
            match route {
                Route::Events => unwrap_interaction_payload(fields)?,
                Route::Commands => fields,
            }
        }
        ContentKind::Json => parse_json(raw_body)?,
    };

    let kind = if is_handshake(&payload) {
        EventKind::Handshake
    } else {
        route.default_kind()
    };

    info!(
        route = ?route,
        kind = ?kind,
        field_count = payload.len(),
        "slack_request_classified"
    );

    Ok(ClassifiedEvent {
        kind,
        routing_key: kind.routing_key().to_string(),
        payload,
    })
}

fn is_handshake(payload: &Map<String, Value>) -> bool {
    payload.get("type").and_then(Value::as_str) == Some(HANDSHAKE_TYPE)
}

/// Parse form data into a mapping; the last occurrence of a key wins.
///
/// Percent escapes are decoded strictly: a key or value that does not
/// decode to UTF-8 rejects the whole body.
fn parse_form(raw_body: &[u8]) -> Result<Map<String, Value>, ClassificationError> {
    let raw = std::str::from_utf8(raw_body).map_err(|_| ClassificationError::BadPayload {
        reason: "form body is not valid UTF-8".to_string(),
    })?;

    let mut fields = Map::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_form_component(key)?;
        let value = decode_form_component(value)?;
        fields.insert(key, Value::String(value));
    }
    Ok(fields)
}

/// Decode one `application/x-www-form-urlencoded` component.
fn decode_form_component(component: &str) -> Result<String, ClassificationError> {
    let spaced = component.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| {
            warn!(component_length = component.len(), "slack_form_invalid_utf8");
            ClassificationError::BadPayload {
                reason: "form field is not valid UTF-8 after percent-decoding".to_string(),
            }
        })
}

fn parse_json(raw_body: &[u8]) -> Result<Map<String, Value>, ClassificationError> {
    match serde_json::from_slice::<Value>(raw_body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ClassificationError::BadPayload {
            reason: "JSON body is not an object".to_string(),
        }),
        Err(e) => {
            warn!(error = %e, body_length = raw_body.len(), "slack_json_parse_failed");
            Err(ClassificationError::BadPayload {
                reason: e.to_string(),
            })
        }
    }
}

/// Interactive components post `payload=<json>` as form data. Unwrap that
/// JSON object so the envelope carries the structured interaction.
fn unwrap_interaction_payload(
    fields: Map<String, Value>,
) -> Result<Map<String, Value>, ClassificationError> {
    match fields.get(INTERACTION_PAYLOAD_FIELD) {
        Some(Value::String(raw)) => parse_json(raw.as_bytes()),
        _ => Ok(fields),
    }
}
