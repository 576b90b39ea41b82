//! The request that opens a streaming session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{ValidationError, validate_message};

/// A file or blob handed to the agent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub media_type: Option<String>,
    pub content: String,
}

/// First message of a session plus whatever the agent needs with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Initial user message.
    pub prompt: String,

    /// Caller-chosen session id; a provisional id is generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TurnRequest {
    /// Create a request with just a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Use a caller-chosen session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Check the prompt against the message limits.
    ///
    /// # Errors
    /// Returns error if the prompt is empty or too long.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_message(&self.prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal() {
        let req: TurnRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert!(req.session_id.is_none());
        assert!(req.attachments.is_empty());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        assert_eq!(TurnRequest::new("").validate(), Err(ValidationError::Empty));
    }

    #[test]
    fn test_metadata() {
        let mut req = TurnRequest::new("hi").with_session_id("s1");
        req.set_metadata("channel", Value::from("web"));
        assert_eq!(req.get_metadata("channel"), Some(&Value::from("web")));
        assert_eq!(req.session_id.as_deref(), Some("s1"));
    }
}
