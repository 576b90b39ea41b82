//! Broker configuration.

use std::time::Duration;

use agent_stream_core::{
    classify::DEFAULT_WARNING_DETAIL_CAP,
    event_log::{DEFAULT_HISTORY_CAPACITY, DEFAULT_LIVE_BUFFER},
    queue::DEFAULT_QUEUE_CAPACITY,
};
use serde::{Deserialize, Serialize};

/// Tunables for the session broker. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Concurrent live sessions before the oldest is evicted.
    pub max_sessions: usize,
    /// Pending injected messages per session.
    pub queue_capacity: usize,
    /// Events kept per session for catch-up.
    pub history_capacity: usize,
    /// Live channel depth before a subscriber resyncs from history.
    pub live_buffer: usize,
    /// How often the producer checks whether its log was closed from outside.
    pub poll_interval_ms: u64,
    /// Transcript poll interval when no live session is found.
    pub fallback_tick_ms: u64,
    /// Transcript polls before reporting the session as unavailable.
    pub fallback_max_ticks: u32,
    /// Detail lines kept in one warning event.
    pub warning_detail_cap: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            live_buffer: DEFAULT_LIVE_BUFFER,
            poll_interval_ms: 500,
            fallback_tick_ms: 1_000,
            fallback_max_ticks: 60,
            warning_detail_cap: DEFAULT_WARNING_DETAIL_CAP,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn fallback_tick(&self) -> Duration {
        Duration::from_millis(self.fallback_tick_ms)
    }
}
