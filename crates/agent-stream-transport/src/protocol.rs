//! Wire protocol for client-server communication.

use agent_stream_session::{BrokerError, SessionSummary};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Body of `POST /sessions/{id}/inject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectRequest {
    pub message: String,
}

/// Accepted injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectResponse {
    pub queued: bool,
}

/// Body returned by `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
}

/// Body returned by `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

/// Resume position for an event feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    pub after: Option<u64>,
}

/// Message from client to server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Queue a message into the running turn.
    Inject { message: String },
    /// Stop the session's stream.
    Abort,
    /// Ping for keepalive.
    Ping,
}

/// Control message from server to client over the WebSocket.
///
/// Session events are sent as plain [`agent_stream_core::StreamEvent`]
/// JSON; these share the `type` field with names no event uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// An injected message was queued.
    Queued,
    /// No live session and the transcript never finished.
    Unavailable { session_id: String, polls: u32 },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resend_as_new_turn: bool,
    },
    Pong,
}

impl From<&BrokerError> for ServerMessage {
    fn from(err: &BrokerError) -> Self {
        Self::Error {
            code: error_code(err).to_string(),
            message: err.to_string(),
            resend_as_new_turn: err.resend_as_new_turn(),
        }
    }
}

/// Stable machine-readable code for a broker error.
#[must_use]
pub const fn error_code(err: &BrokerError) -> &'static str {
    match err {
        BrokerError::Validation(_) => "validation_failed",
        BrokerError::NoActiveStream(_) => "no_active_stream",
        BrokerError::QueueFull { .. } => "queue_full",
        BrokerError::AlreadyStreaming(_) => "already_streaming",
    }
}

/// HTTP API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Broker(BrokerError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Broker(BrokerError::NoActiveStream(_)) => StatusCode::NOT_FOUND,
            Self::Broker(BrokerError::QueueFull { .. } | BrokerError::AlreadyStreaming(_)) => {
                StatusCode::CONFLICT
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    resend_as_new_turn: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, resend_as_new_turn) = match &self {
            Self::Broker(err) => (error_code(err), err.resend_as_new_turn()),
            Self::BadRequest(_) => ("bad_request", false),
        };
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::debug!(%status, "{self}");
        }
        let body = ErrorBody {
            error,
            message: self.to_string(),
            resend_as_new_turn,
        };
        (status, Json(body)).into_response()
    }
}
