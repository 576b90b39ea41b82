//! Failure classification and warning aggregation.
//!
//! Every upstream failure is classified exactly once, at the producer
//! boundary, into either a terminal event or a non-fatal issue. Non-fatal
//! issues are collected by a [`WarningAggregator`] and surface as a single
//! `warning` event.

use serde::{Deserialize, Serialize};

use crate::{
    event::{AbortReason, EventPayload, WarningCode},
    traits::UpstreamError,
};

/// Default number of detail lines kept in one warning event.
pub const DEFAULT_WARNING_DETAIL_CAP: usize = 5;

/// Failure taxonomy, by kind rather than by error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionFailure,
    UpstreamToolFailure,
    AttachmentFailure,
    ValidationFailure,
    Cancelled,
}

impl FailureKind {
    /// Whether a failure of this kind ends the stream.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::UpstreamToolFailure | Self::AttachmentFailure)
    }

    /// Whether resending the same turn may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionFailure)
    }

    const fn warning_code(self) -> WarningCode {
        match self {
            Self::AttachmentFailure => WarningCode::AttachmentFailed,
            Self::UpstreamToolFailure => WarningCode::ToolLoadFailed,
            _ => WarningCode::PartialFailure,
        }
    }
}

impl From<&UpstreamError> for FailureKind {
    fn from(err: &UpstreamError) -> Self {
        match err {
            UpstreamError::Connection(_) | UpstreamError::Timeout(_) => Self::ConnectionFailure,
            UpstreamError::Tool { .. } => Self::UpstreamToolFailure,
            UpstreamError::Attachment { .. } => Self::AttachmentFailure,
            UpstreamError::InvalidRequest(_) => Self::ValidationFailure,
            UpstreamError::Cancelled => Self::Cancelled,
        }
    }
}

/// A non-fatal failure awaiting aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub kind: FailureKind,
    pub detail: String,
}

/// Outcome of classifying one upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Publish this payload and stop the stream.
    Terminal(EventPayload),
    /// Aggregate into the next warning.
    NonFatal(Issue),
}

/// Classify an upstream failure.
#[must_use]
pub fn classify(err: &UpstreamError) -> Classification {
    let kind = FailureKind::from(err);
    if !kind.is_terminal() {
        return Classification::NonFatal(Issue {
            kind,
            detail: err.to_string(),
        });
    }

    let payload = match kind {
        FailureKind::Cancelled => EventPayload::Aborted {
            reason: AbortReason::Cancelled,
            undelivered_messages: 0,
        },
        _ => EventPayload::TypedError {
            kind,
            message: err.to_string(),
            retryable: kind.is_retryable(),
        },
    };
    Classification::Terminal(payload)
}

/// Collects non-fatal issues into one capped warning.
#[derive(Debug, Clone)]
pub struct WarningAggregator {
    cap: usize,
    kinds: Vec<FailureKind>,
    details: Vec<String>,
    omitted: usize,
}

impl Default for WarningAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WARNING_DETAIL_CAP)
    }
}

impl WarningAggregator {
    /// Create an aggregator keeping at most `cap` detail lines.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            kinds: Vec::new(),
            details: Vec::new(),
            omitted: 0,
        }
    }

    /// Record an issue.
    pub fn record(&mut self, issue: Issue) {
        if !self.kinds.contains(&issue.kind) {
            self.kinds.push(issue.kind);
        }
        if self.details.len() < self.cap {
            self.details.push(issue.detail);
        } else {
            self.omitted += 1;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    /// Take the aggregated warning, leaving the aggregator empty.
    pub fn take(&mut self) -> Option<EventPayload> {
        if self.is_empty() {
            return None;
        }

        let total = self.details.len() + self.omitted;
        let code = match self.kinds.as_slice() {
            [single] => single.warning_code(),
            _ => WarningCode::PartialFailure,
        };
        let message = match code {
            WarningCode::ToolLoadFailed => plural(total, "tool failed", "tools failed"),
            WarningCode::AttachmentFailed => plural(
                total,
                "attachment could not be processed",
                "attachments could not be processed",
            ),
            WarningCode::PartialFailure => plural(
                total,
                "non-fatal issue occurred",
                "non-fatal issues occurred",
            ),
        };

        self.kinds.clear();
        Some(EventPayload::Warning {
            code,
            message,
            details: std::mem::take(&mut self.details),
            omitted: std::mem::take(&mut self.omitted),
        })
    }
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("1 {one}")
    } else {
        format!("{n} {many}")
    }
}
