//! Slack endpoint handlers.
//!
//! Every request runs the same ordered pipeline:
//! 1. Classify the raw body
//! 2. Answer a handshake directly and stop
//! 3. Verify the signature
//! 4. Publish to the hand-off channel and return
//!
//! Business processing happens in the worker.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::classify::{classify, ClassifiedEvent, ContentKind, EventKind};
use crate::error::{ClassificationError, DispatchError, GatewayError};
use crate::queue::{dispatch, EnvelopePublisher};
use crate::secrets::SecretStore;
use crate::web::challenge::{respond, ChallengeResponse};
use crate::web::signature::{
    verify_slack_signature, SigningContext, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::Config;

/// Delivery-attempt headers Slack adds to retried requests.
const RETRY_NUM_HEADER: &str = "x-slack-retry-num";
const RETRY_REASON_HEADER: &str = "x-slack-retry-reason";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: Arc<dyn EnvelopePublisher>,
    pub secrets: Arc<dyn SecretStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        publisher: Arc<dyn EnvelopePublisher>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
            secrets,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slack/:route", post(slack_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Slack Webhook
// =============================================================================

/// Result of a request that made it through the pipeline.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Handshake answered inline
    Challenge(ChallengeResponse),
    /// Payload accepted by the broker
    Dispatched,
}

impl IntoResponse for PipelineOutcome {
    fn into_response(self) -> Response {
        match self {
            PipelineOutcome::Challenge(body) => (StatusCode::OK, Json(body)).into_response(),
            // Slack renders any body on a slash command; stay silent.
            PipelineOutcome::Dispatched => StatusCode::OK.into_response(),
        }
    }
}

/// Slack webhook endpoint for `/slack/commands` and `/slack/events`.
pub async fn slack_webhook(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<PipelineOutcome, GatewayError> {
    info!(
        route = %route,
        body_length = body.len(),
        has_signature = headers.contains_key(SIGNATURE_HEADER),
        retry_num = ?header_str(&headers, RETRY_NUM_HEADER),
        retry_reason = ?header_str(&headers, RETRY_REASON_HEADER),
        "slack_request_received"
    );

    let outcome = handle_request(&state, &route, &headers, &body).await;

    match &outcome {
        Ok(PipelineOutcome::Challenge(_)) => info!(route = %route, "slack_handshake_answered"),
        Ok(PipelineOutcome::Dispatched) => info!(route = %route, "slack_request_enqueued"),
        Err(e) => warn!(route = %route, error = %e, "slack_request_rejected"),
    }

    outcome
}

/// classify → handshake? respond-and-stop → verify → dispatch
pub async fn handle_request(
    state: &AppState,
    route: &str,
    headers: &HeaderMap,
    raw_body: &[u8],
) -> Result<PipelineOutcome, GatewayError> {
    let content = ContentKind::from_content_type(header_str(headers, CONTENT_TYPE.as_str()));
    let event = classify(route, raw_body, content)?;

    if event.kind() == EventKind::Handshake {
        return answer_handshake(state, &event).await;
    }

    let secret = fetch_secret(state, &state.config.signing_secret_name).await?;
    let context = SigningContext::at_current_time(secret.into_bytes());

    let proof = verify_slack_signature(
        header_str(headers, SIGNATURE_HEADER).unwrap_or_default(),
        header_str(headers, TIMESTAMP_HEADER).unwrap_or_default(),
        raw_body,
        &context,
        state.config.replay_window_secs,
    )?;

    dispatch(
        state.publisher.as_ref(),
        event,
        proof,
        state.config.dispatch_timeout(),
    )
    .await?;

    Ok(PipelineOutcome::Dispatched)
}

async fn answer_handshake(
    state: &AppState,
    event: &ClassifiedEvent,
) -> Result<PipelineOutcome, GatewayError> {
    let challenge = event
        .field("challenge")
        .ok_or_else(|| ClassificationError::BadPayload {
            reason: "handshake without challenge".to_string(),
        })?;

    let configured = fetch_secret(state, &state.config.verification_token_name).await?;
    let response = respond(
        challenge,
        event.field("token").unwrap_or_default(),
        &configured,
    )?;

    Ok(PipelineOutcome::Challenge(response))
}

/// Fetch a secret, bounded by the dispatch timeout.
async fn fetch_secret(state: &AppState, name: &str) -> Result<String, GatewayError> {
    match tokio::time::timeout(state.config.dispatch_timeout(), state.secrets.fetch(name)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(secret = name, "secret_fetch_timeout");
            Err(DispatchError::unavailable("secret store timed out").into())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::error::SecretError;
    use crate::processor::tests::RecordingCallback;
    use crate::processor::{Handlers, Outcome, Processor};
    use crate::queue::{DispatchEnvelope, EnvelopeKind};
    use crate::web::signature::{compute_signature, unix_now};

    const SIGNING_SECRET: &str = "test-signing-secret";
    const VERIFICATION_TOKEN: &str = "legacy-token";

    #[derive(Default)]
    struct MemoryQueue {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl EnvelopePublisher for MemoryQueue {
        async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), DispatchError> {
            let bytes = envelope
                .to_bytes()
                .map_err(|e| DispatchError::unavailable(e.to_string()))?;
            self.messages.lock().unwrap().push(bytes);
            Ok(())
        }
    }

    struct DownQueue;

    #[async_trait]
    impl EnvelopePublisher for DownQueue {
        async fn publish(&self, _envelope: &DispatchEnvelope) -> Result<(), DispatchError> {
            Err(DispatchError::unavailable("connection refused"))
        }
    }

    struct StaticSecrets(HashMap<String, String>);

    #[async_trait]
    impl SecretStore for StaticSecrets {
        async fn fetch(&self, name: &str) -> Result<String, SecretError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| SecretError::NotFound(name.to_string()))
        }
    }

    fn secrets() -> Arc<StaticSecrets> {
        Arc::new(StaticSecrets(HashMap::from([
            ("SLACK_SIGNING_SECRET".to_string(), SIGNING_SECRET.to_string()),
            (
                "SLACK_VERIFICATION_TOKEN".to_string(),
                VERIFICATION_TOKEN.to_string(),
            ),
        ])))
    }

    fn app(publisher: Arc<dyn EnvelopePublisher>) -> Router {
        let config = Config {
            dispatch_timeout_ms: 1000,
            ..Config::default()
        };
        router(AppState::new(config, publisher, secrets()))
    }

    fn signed_request(route: &str, content_type: &str, body: &str, timestamp: i64) -> Request<Body> {
        let ts = timestamp.to_string();
        let sig = compute_signature(SIGNING_SECRET.as_bytes(), &ts, body.as_bytes()).unwrap();

        Request::builder()
            .method("POST")
            .uri(format!("/slack/{}", route))
            .header("Content-Type", content_type)
            .header("X-Slack-Signature", sig)
            .header("X-Slack-Request-Timestamp", ts)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const FORM: &str = "application/x-www-form-urlencoded";
    const COMMAND_BODY: &str = "token=legacy-token&team_id=T1&user_id=U1&command=%2Fdeploy&text=prod&text=staging&response_url=https%3A%2F%2Fhooks.slack.com%2Fcommands%2FT1%2F1%2Fabc&trigger_id=t-1";

    #[tokio::test]
    async fn test_health() {
        let response = app(Arc::new(MemoryQueue::default()))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_command_end_to_end() {
        let queue = Arc::new(MemoryQueue::default());
        let response = app(queue.clone())
            .oneshot(signed_request("commands", FORM, COMMAND_BODY, unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let messages = queue.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);

        let envelope = DispatchEnvelope::from_bytes(&messages[0]).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Command);
        assert_eq!(envelope.field("command"), Some("/deploy"));
        assert_eq!(envelope.field("text"), Some("staging"));
        assert_eq!(envelope.field("user_id"), Some("U1"));

        let callback = Arc::new(RecordingCallback::default());
        let processor = Processor::new(
            Handlers::default(),
            callback.clone(),
            Some("Working on it".to_string()),
        );
        assert_eq!(processor.process_delivery(&messages[0]).await, Outcome::Ack);

        let posts = callback.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "https://hooks.slack.com/commands/T1/1/abc");
        assert!(!posts[0].1.text.is_empty());
    }

    #[tokio::test]
    async fn test_event_json_dispatched() {
        let queue = Arc::new(MemoryQueue::default());
        let body = r#"{"type":"event_callback","event":{"type":"app_mention","text":"hi"}}"#;

        let response = app(queue.clone())
            .oneshot(signed_request("events", "application/json", body, unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let messages = queue.messages.lock().unwrap();
        let envelope = DispatchEnvelope::from_bytes(&messages[0]).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Interaction);
        assert_eq!(envelope.payload["event"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_and_not_queued() {
        let queue = Arc::new(MemoryQueue::default());
        let mut request = signed_request("commands", FORM, COMMAND_BODY, unix_now());
        request
            .headers_mut()
            .insert("x-slack-signature", "v0=deadbeef".parse().unwrap());

        let response = app(queue.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_headers_rejected() {
        let queue = Arc::new(MemoryQueue::default());
        let request = Request::builder()
            .method("POST")
            .uri("/slack/commands")
            .header("Content-Type", FORM)
            .body(Body::from(COMMAND_BODY))
            .unwrap();

        let response = app(queue.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_request_rejected() {
        let queue = Arc::new(MemoryQueue::default());
        let response = app(queue.clone())
            .oneshot(signed_request("commands", FORM, COMMAND_BODY, unix_now() - 3600))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_answered_without_signature() {
        let queue = Arc::new(MemoryQueue::default());
        let body = r#"{"token":"legacy-token","challenge":"abc123","type":"url_verification"}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/slack/events")
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let response = app(queue.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"challenge": "abc123"})
        );
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_with_wrong_token_rejected() {
        let queue = Arc::new(MemoryQueue::default());
        let body = r#"{"token":"nope","challenge":"abc123","type":"url_verification"}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/slack/events")
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let response = app(queue.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_not_found() {
        let queue = Arc::new(MemoryQueue::default());
        let response = app(queue.clone())
            .oneshot(signed_request("shortcuts", FORM, COMMAND_BODY, unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_bad_request() {
        let queue = Arc::new(MemoryQueue::default());
        let response = app(queue.clone())
            .oneshot(signed_request("events", "application/json", "{oops", unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_down_is_server_error() {
        let response = app(Arc::new(DownQueue))
            .oneshot(signed_request("commands", FORM, COMMAND_BODY, unix_now()))
            .await
            .unwrap();

        assert!(response.status().is_server_error());
        assert_eq!(body_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn test_missing_signing_secret_is_server_error() {
        let config = Config {
            signing_secret_name: "UNSET_SECRET".to_string(),
            dispatch_timeout_ms: 1000,
            ..Config::default()
        };
        let queue = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config, queue.clone(), secrets()));

        let response = app
            .oneshot(signed_request("commands", FORM, COMMAND_BODY, unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_secret_store_fails_fast() {
        struct SlowSecrets;

        #[async_trait]
        impl SecretStore for SlowSecrets {
            async fn fetch(&self, _name: &str) -> Result<String, SecretError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
        }

        let config = Config {
            dispatch_timeout_ms: 20,
            ..Config::default()
        };
        let queue = Arc::new(MemoryQueue::default());
        let app = router(AppState::new(config, queue.clone(), Arc::new(SlowSecrets)));

        let response = app
            .oneshot(signed_request("commands", FORM, COMMAND_BODY, unix_now()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(queue.messages.lock().unwrap().is_empty());
    }
}
