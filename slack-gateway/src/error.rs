//! Error taxonomy for the request pipeline.
//!
//! Authentication and classification failures are client errors and are
//! never retried. Dispatch and secret-store failures are server errors so
//! that Slack re-delivers the original request under its own retry policy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::classify::EventKind;

/// Request authenticity failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("request timestamp is missing or not an integer")]
    MalformedTimestamp,

    #[error("request timestamp is outside the replay window")]
    StaleOrFutureRequest,

    #[error("request signature does not match")]
    BadSignature,

    #[error("verification token does not match")]
    InvalidVerificationToken,
}

/// Request shape failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("malformed payload: {reason}")]
    BadPayload { reason: String },
}

/// Hand-off failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("hand-off channel unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("{0:?} events are answered inline and never dispatched")]
    NotDispatchable(EventKind),
}

impl DispatchError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        DispatchError::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Secret-store collaborator failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret store error: {0}")]
    Backend(String),
}

/// A required envelope field is absent or not a string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("required field `{0}` is missing or not a string")]
pub struct MissingField(pub &'static str);

/// Any failure that ends an inbound request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Classification(ClassificationError::UnknownRoute(_)) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Classification(ClassificationError::BadPayload { .. }) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Dispatch(DispatchError::Unavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Dispatch(DispatchError::NotDispatchable(_))
            | GatewayError::Secret(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn status_label(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "unauthorized",
            GatewayError::Classification(_) => "rejected",
            GatewayError::Dispatch(_) | GatewayError::Secret(_) => "error",
        }
    }
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Internal details stay in the logs.
        let error = match &self {
            GatewayError::Secret(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        (
            self.status_code(),
            Json(ErrorResponse {
                status: self.status_label(),
                error,
            }),
        )
            .into_response()
    }
}
