//! Core building blocks for multiplexed agent streaming sessions.
//!
//! This crate provides:
//! - `EventLog` - Broadcast + ring buffer for reattachment support
//! - `InjectionQueue` - Bounded FIFO for mid-stream user input
//! - `StreamEvent` - Sequenced, typed event envelope
//! - Failure classification and warning aggregation
//! - `AgentClient` and `TranscriptStore` collaborator traits

pub mod classify;
pub mod context;
pub mod event;
pub mod event_log;
pub mod queue;
pub mod traits;

pub use classify::{Classification, FailureKind, Issue, WarningAggregator, classify};
pub use context::{Attachment, TurnRequest};
pub use event::{AbortReason, EventPayload, StreamEvent, WarningCode};
pub use event_log::{EventLog, EventLogError, Subscription};
pub use queue::{
    EnqueueError, InjectedMessage, InjectionQueue, InputReceiver, ValidationError,
};
pub use traits::{
    AgentClient, StoreError, Transcript, TranscriptStore, UpstreamError, UpstreamItem,
    UpstreamStream,
};
