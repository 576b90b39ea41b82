//! Collaborator traits: the upstream agent client and the transcript store.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::{InjectedMessage, InputReceiver, StreamEvent, TurnRequest};

/// Item yielded by an upstream agent turn.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamItem {
    /// The upstream assigned its own session id.
    SessionStarted { upstream_id: String },
    TextDelta(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: Value,
        is_error: bool,
    },
    Question {
        id: String,
        prompt: String,
    },
}

/// Upstream failure, as reported by the agent client.
///
/// Not every variant is fatal: tool and attachment failures are reported
/// as stream items and the turn keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },
    #[error("attachment `{name}` failed: {message}")]
    Attachment { name: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cancelled upstream")]
    Cancelled,
}

/// Ordered output of one upstream turn. The turn is over when it ends.
pub type UpstreamStream = BoxStream<'static, Result<UpstreamItem, UpstreamError>>;

/// Trait for upstream agent clients.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Start the first turn of a session.
    async fn start(
        &self,
        request: &TurnRequest,
        input: InputReceiver,
    ) -> Result<UpstreamStream, UpstreamError>;

    /// Continue a finished turn with messages that arrived too late for it.
    async fn follow_up(
        &self,
        upstream_id: Option<&str>,
        messages: Vec<InjectedMessage>,
        input: InputReceiver,
    ) -> Result<UpstreamStream, UpstreamError>;
}

/// Events persisted for a session by the transcript writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub events: Vec<StreamEvent>,
}

impl Transcript {
    /// Whether the transcript already holds the terminal event.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.events.last().is_some_and(StreamEvent::is_terminal)
    }
}

/// Transcript store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Read-only access to durable transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Events with `sequence > after`, or `None` if the session is unknown.
    async fn events_after(
        &self,
        session_id: &str,
        after: Option<u64>,
    ) -> Result<Option<Transcript>, StoreError>;
}
