use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use channelgate_xmpp::{
    DiscoveryError, SessionError, StanzaErrorCondition, SubscribeError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Failures surfaced by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Session(SessionError::AuthenticationFailed(_)) => {
                (StatusCode::UNAUTHORIZED, "authentication_failed")
            }
            ApiError::Session(SessionError::Expired) => {
                (StatusCode::UNAUTHORIZED, "session_expired")
            }
            ApiError::Session(SessionError::Connection(_)) => {
                (StatusCode::BAD_GATEWAY, "xmpp_unavailable")
            }
            ApiError::Discovery(DiscoveryError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Discovery(DiscoveryError::Transport { .. }) => {
                (StatusCode::GATEWAY_TIMEOUT, "discovery_failed")
            }
            ApiError::Subscribe(error) => match error.condition() {
                Some(StanzaErrorCondition::Forbidden)
                | Some(StanzaErrorCondition::NotAuthorized)
                | Some(StanzaErrorCondition::RegistrationRequired) => {
                    (StatusCode::FORBIDDEN, "forbidden")
                }
                Some(StanzaErrorCondition::ItemNotFound) => (StatusCode::NOT_FOUND, "not_found"),
                Some(StanzaErrorCondition::RemoteServerTimeout) => {
                    (StatusCode::GATEWAY_TIMEOUT, "subscribe_timeout")
                }
                _ => (StatusCode::BAD_GATEWAY, "subscribe_failed"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(error = %self, %status, "Request failed");
        }
        (status, Json(ErrorResponse::new(code, &self.to_string()))).into_response()
    }
}
