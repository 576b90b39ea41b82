//! Stream events published by a session producer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::FailureKind;

/// Why a session ended with an `aborted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A client asked for the stream to stop.
    Cancelled,
    /// The session was evicted to make room for a newer one.
    Evicted,
}

/// Machine-readable code carried by a `warning` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    ToolLoadFailed,
    AttachmentFailed,
    /// More than one kind of non-fatal failure was aggregated.
    PartialFailure,
}

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// Incremental assistant text.
    #[serde(rename = "text-delta")]
    TextDelta { text: String },
    /// The agent invoked a tool.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// A tool invocation finished.
    ToolResult {
        id: String,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// The agent is asking the user something.
    Question { id: String, prompt: String },
    /// An injected message was handed to the agent.
    UserMessage { content: String },
    /// The session moved from its provisional id to the upstream id.
    SessionActivated { provisional_id: String },
    /// Aggregated non-fatal failures.
    Warning {
        code: WarningCode,
        message: String,
        details: Vec<String>,
        #[serde(default)]
        omitted: usize,
    },
    /// Terminal failure.
    TypedError {
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
    /// Terminal stop requested by a client or by eviction.
    Aborted {
        reason: AbortReason,
        #[serde(default)]
        undelivered_messages: usize,
    },
    /// Terminal success.
    Done,
}

impl EventPayload {
    /// Create a text delta payload.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// Text of a text delta.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { text } => Some(text),
            _ => None,
        }
    }

    /// Whether no further events may follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TypedError { .. } | Self::Aborted { .. } | Self::Done
        )
    }

    /// Whether this payload is primary content a warning may follow.
    #[must_use]
    pub const fn is_content(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. }
                | Self::ToolUse { .. }
                | Self::ToolResult { .. }
                | Self::Question { .. }
                | Self::UserMessage { .. }
        )
    }

    /// Wire name of the event type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::ToolUse { .. } => "toolUse",
            Self::ToolResult { .. } => "toolResult",
            Self::Question { .. } => "question",
            Self::UserMessage { .. } => "userMessage",
            Self::SessionActivated { .. } => "sessionActivated",
            Self::Warning { .. } => "warning",
            Self::TypedError { .. } => "typedError",
            Self::Aborted { .. } => "aborted",
            Self::Done => "done",
        }
    }
}

/// A sequenced event as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Session id at the time the event was published.
    pub session_id: String,
    /// Per-session sequence number, starting at 1.
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Whether this is the last event of its session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// Convert to an SSE frame: `id` is the sequence, `event` the type name.
    ///
    /// # Errors
    /// Returns error if the event cannot be serialized.
    #[cfg(feature = "sse")]
    pub fn to_sse_event(&self) -> Result<axum::response::sse::Event, axum::Error> {
        axum::response::sse::Event::default()
            .id(self.sequence.to_string())
            .event(self.payload.type_name())
            .json_data(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_delta_wire_shape() {
        let event = StreamEvent {
            session_id: "s1".into(),
            sequence: 3,
            payload: EventPayload::text("hi"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "text-delta",
                "sessionId": "s1",
                "sequence": 3,
                "text": "hi",
            })
        );
    }

    #[test]
    fn test_camel_case_fields() {
        let event = StreamEvent {
            session_id: "s1".into(),
            sequence: 9,
            payload: EventPayload::Aborted {
                reason: AbortReason::Evicted,
                undelivered_messages: 2,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"aborted""#));
        assert!(json.contains(r#""undeliveredMessages":2"#));
        assert!(json.contains(r#""reason":"evicted""#));

        let parsed: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_terminal_types() {
        assert!(EventPayload::Done.is_terminal());
        assert!(
            EventPayload::TypedError {
                kind: FailureKind::ConnectionFailure,
                message: "reset".into(),
                retryable: true,
            }
            .is_terminal()
        );
        assert!(!EventPayload::text("x").is_terminal());
        assert!(
            !EventPayload::Warning {
                code: WarningCode::ToolLoadFailed,
                message: "w".into(),
                details: vec![],
                omitted: 0,
            }
            .is_terminal()
        );
    }
}
