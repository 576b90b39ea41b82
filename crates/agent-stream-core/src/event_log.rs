//! Broadcast + ring buffer event log for one session.
//!
//! Essential for reattachment: a subscriber receives the buffered events
//! after its cursor, then seamlessly switches to live updates. Publishing
//! never waits on subscribers; a subscriber that falls behind the live
//! channel resynchronizes from the ring buffer.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::event::{EventPayload, StreamEvent};

/// Default number of events kept for catch-up.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Default per-subscriber live channel depth.
pub const DEFAULT_LIVE_BUFFER: usize = 256;

/// Event log error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventLogError {
    #[error("session {0} already ended")]
    Terminated(String),
}

struct Inner {
    session_id: String,
    next_sequence: u64,
    history: VecDeque<StreamEvent>,
    /// Dropped once the terminal event is published, which closes every
    /// live receiver after it drains.
    sender: Option<broadcast::Sender<StreamEvent>>,
}

/// Ordered, sequenced event log with live fan-out.
pub struct EventLog {
    history_capacity: usize,
    inner: Mutex<Inner>,
}

impl EventLog {
    /// Create an empty log for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, history_capacity: usize, live_buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(live_buffer.max(1));
        let history_capacity = history_capacity.max(1);
        Self {
            history_capacity,
            inner: Mutex::new(Inner {
                session_id: session_id.into(),
                next_sequence: 1,
                history: VecDeque::with_capacity(history_capacity.min(64)),
                sender: Some(sender),
            }),
        }
    }

    /// Create a log with the default capacities.
    #[must_use]
    pub fn with_defaults(session_id: impl Into<String>) -> Self {
        Self::new(session_id, DEFAULT_HISTORY_CAPACITY, DEFAULT_LIVE_BUFFER)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session id stamped on newly published events.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    /// Stamp future events with a new session id.
    pub fn rename(&self, session_id: impl Into<String>) {
        self.lock().session_id = session_id.into();
    }

    /// Assign the next sequence number and fan the event out.
    ///
    /// # Errors
    /// Returns error if a terminal event was already published.
    pub fn publish(&self, payload: EventPayload) -> Result<u64, EventLogError> {
        let mut inner = self.lock();
        let Some(sender) = inner.sender.clone() else {
            return Err(EventLogError::Terminated(inner.session_id.clone()));
        };

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let event = StreamEvent {
            session_id: inner.session_id.clone(),
            sequence,
            payload,
        };
        let terminal = event.is_terminal();

        if inner.history.len() >= self.history_capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        // No receivers is fine: the ring buffer still has it.
        let _ = sender.send(event);
        if terminal {
            inner.sender = None;
            tracing::debug!(session_id = %inner.session_id, sequence, "event log sealed");
        }
        drop(inner);

        Ok(sequence)
    }

    /// Whether a terminal event has been published.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.lock().sender.is_none()
    }

    /// Sequence of the newest event, or 0 if none.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.lock().next_sequence - 1
    }

    /// Number of attached live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .sender
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Buffered events with `sequence > after` (all of them for `None`).
    #[must_use]
    pub fn events_after(&self, after: Option<u64>) -> Vec<StreamEvent> {
        self.lock()
            .history
            .iter()
            .filter(|e| after.is_none_or(|last| e.sequence > last))
            .cloned()
            .collect()
    }

    /// Attach a subscriber positioned after `after`.
    ///
    /// The backlog snapshot and the live receiver are taken under the same
    /// lock as [`EventLog::publish`], so no event falls between them.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, after: Option<u64>) -> Subscription {
        let inner = self.lock();
        let backlog = inner
            .history
            .iter()
            .filter(|e| after.is_none_or(|last| e.sequence > last))
            .cloned()
            .collect();
        let receiver = inner
            .sender
            .as_ref()
            .map(|sender| BroadcastStream::new(sender.subscribe()));
        drop(inner);

        Subscription {
            log: Arc::clone(self),
            backlog,
            receiver,
            cursor: after.unwrap_or(0),
            missed: 0,
            finished: false,
        }
    }
}

/// One consumer's view of an [`EventLog`].
///
/// Dropping the subscription detaches only this consumer.
pub struct Subscription {
    log: Arc<EventLog>,
    backlog: VecDeque<StreamEvent>,
    receiver: Option<BroadcastStream<StreamEvent>>,
    cursor: u64,
    missed: u64,
    finished: bool,
}

impl Subscription {
    /// Sequence of the last delivered event.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Events that rolled out of the ring buffer before delivery.
    #[must_use]
    pub const fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event in sequence order; `None` after the terminal event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.finished {
                return None;
            }

            let event = if let Some(event) = self.backlog.pop_front() {
                event
            } else {
                let Some(receiver) = self.receiver.as_mut() else {
                    self.finished = true;
                    return None;
                };
                match receiver.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::debug!(
                            session_id = %self.log.session_id(),
                            skipped,
                            cursor = self.cursor,
                            "subscriber lagged, resyncing from history"
                        );
                        self.resync();
                        continue;
                    }
                    None => {
                        self.receiver = None;
                        self.resync();
                        continue;
                    }
                }
            };

            if event.sequence <= self.cursor {
                continue;
            }
            let gap = event.sequence - self.cursor - 1;
            if gap > 0 {
                self.missed += gap;
                tracing::warn!(
                    session_id = %event.session_id,
                    from = self.cursor + 1,
                    to = event.sequence - 1,
                    "events fell out of the buffered window"
                );
            }
            self.cursor = event.sequence;
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }
    }

    fn resync(&mut self) {
        self.backlog.extend(self.log.events_after(Some(self.cursor)));
    }

    /// Convert into a stream that ends after the terminal event.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
        .boxed()
    }
}
