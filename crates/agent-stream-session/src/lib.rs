//! Session orchestration for multiplexed agent streams.
//!
//! Provides:
//! - `SessionBroker` - Start, inject into, abort and follow sessions
//! - `StreamRegistry` - Bounded map of live sessions with re-keying
//! - `StreamProducer` - Drives one upstream turn into a session's log
//! - `ReattachController` - Live catch-up or bounded transcript polling
//! - `ScriptedAgent` - Deterministic agent client for demos and tests
//! - Storage implementations (memory)

pub mod config;
pub mod manager;
pub mod producer;
pub mod reattach;
pub mod registry;
pub mod scripted;
pub mod storage;

pub use config::BrokerConfig;
pub use manager::{BrokerError, SessionBroker, StartedSession};
pub use producer::StreamProducer;
pub use reattach::{AttachMode, ReattachController, ReattachItem, Reattachment};
pub use registry::{RegistryError, SessionState, SessionSummary, StreamRegistry, StreamSession};
pub use scripted::{ScriptStep, ScriptedAgent};
