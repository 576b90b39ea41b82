//! Reattachment: catch-up plus live tail, or a bounded transcript poll.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use agent_stream_core::{StreamEvent, Subscription, TranscriptStore};
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use tokio::time::{Interval, MissedTickBehavior};

use crate::registry::StreamRegistry;

/// How a consumer is being fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// A live session was found; events are pushed.
    Live,
    /// No live session; the transcript store is polled.
    Polling,
}

/// Item delivered to a reattached consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReattachItem {
    Event(StreamEvent),
    /// Polling gave up without seeing a terminal event.
    Unavailable { session_id: String, polls: u32 },
}

/// Picks push or poll delivery for a (re)connecting consumer.
pub struct ReattachController {
    registry: Arc<StreamRegistry>,
    store: Arc<dyn TranscriptStore>,
    tick: Duration,
    max_ticks: u32,
}

impl ReattachController {
    #[must_use]
    pub fn new(
        registry: Arc<StreamRegistry>,
        store: Arc<dyn TranscriptStore>,
        tick: Duration,
        max_ticks: u32,
    ) -> Self {
        Self {
            registry,
            store,
            tick,
            max_ticks,
        }
    }

    /// Attach to `session_id`, resuming after `last_seen` (from the start
    /// when `None`).
    #[must_use]
    pub fn attach(&self, session_id: &str, last_seen: Option<u64>) -> Reattachment {
        if let Some(session) = self.registry.lookup(session_id) {
            tracing::debug!(%session_id, ?last_seen, "attaching to live session");
            return Reattachment::Live(session.log().subscribe(last_seen));
        }

        tracing::debug!(%session_id, ?last_seen, "no live session, polling transcript");
        Reattachment::Polling(TranscriptPoll {
            store: Arc::clone(&self.store),
            session_id: session_id.to_string(),
            cursor: last_seen,
            tick: self.tick.max(Duration::from_millis(1)),
            interval: None,
            polls: 0,
            max_polls: self.max_ticks,
            pending: VecDeque::new(),
            finished: false,
        })
    }
}

/// A consumer's attachment, in one of the two delivery states.
pub enum Reattachment {
    Live(Subscription),
    Polling(TranscriptPoll),
}

impl Reattachment {
    #[must_use]
    pub const fn mode(&self) -> AttachMode {
        match self {
            Self::Live(_) => AttachMode::Live,
            Self::Polling(_) => AttachMode::Polling,
        }
    }

    /// Next item; `None` once the session ended or polling gave up.
    pub async fn next(&mut self) -> Option<ReattachItem> {
        match self {
            Self::Live(sub) => sub.next().await.map(ReattachItem::Event),
            Self::Polling(poll) => poll.next().await,
        }
    }

    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, ReattachItem> {
        futures::stream::unfold(self, |mut attachment| async move {
            attachment.next().await.map(|item| (item, attachment))
        })
        .boxed()
    }
}

/// Bounded poll of the transcript store.
pub struct TranscriptPoll {
    store: Arc<dyn TranscriptStore>,
    session_id: String,
    cursor: Option<u64>,
    tick: Duration,
    interval: Option<Interval>,
    polls: u32,
    max_polls: u32,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl TranscriptPoll {
    /// Polls made so far.
    #[must_use]
    pub const fn polls(&self) -> u32 {
        self.polls
    }

    pub async fn next(&mut self) -> Option<ReattachItem> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                    self.pending.clear();
                }
                self.cursor = Some(event.sequence);
                return Some(ReattachItem::Event(event));
            }
            if self.finished {
                return None;
            }
            if self.polls >= self.max_polls {
                self.finished = true;
                tracing::info!(
                    session_id = %self.session_id,
                    polls = self.polls,
                    "transcript poll exhausted, session state unknown"
                );
                return Some(ReattachItem::Unavailable {
                    session_id: self.session_id.clone(),
                    polls: self.polls,
                });
            }

            let tick = self.tick;
            self.interval
                .get_or_insert_with(|| {
                    let mut interval = tokio::time::interval(tick);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                })
                .tick()
                .await;
            self.polls += 1;
            match self.store.events_after(&self.session_id, self.cursor).await {
                Ok(Some(transcript)) => {
                    let cursor = self.cursor;
                    self.pending.extend(
                        transcript
                            .events
                            .into_iter()
                            .filter(|e| cursor.is_none_or(|last| e.sequence > last)),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, "transcript poll failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_stream_core::EventPayload;

    use super::*;
    use crate::{
        config::BrokerConfig,
        registry::{SessionState, StreamSession},
        storage::MemoryTranscriptStore,
    };

    fn controller(
        registry: &Arc<StreamRegistry>,
        store: &Arc<MemoryTranscriptStore>,
    ) -> ReattachController {
        ReattachController::new(
            Arc::clone(registry),
            Arc::clone(store) as Arc<dyn TranscriptStore>,
            Duration::from_secs(1),
            5,
        )
    }

    fn stored(session_id: &str, sequence: u64, payload: EventPayload) -> StreamEvent {
        StreamEvent {
            session_id: session_id.into(),
            sequence,
            payload,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_session_is_pushed() {
        let registry = Arc::new(StreamRegistry::new(5));
        let store = Arc::new(MemoryTranscriptStore::new());
        let (session, _) = registry
            .register(StreamSession::new(
                "s1",
                SessionState::Active,
                &BrokerConfig::default(),
            ))
            .unwrap();
        session.log().publish(EventPayload::text("a")).unwrap();
        session.log().publish(EventPayload::text("b")).unwrap();

        let mut attachment = controller(&registry, &store).attach("s1", Some(1));
        assert_eq!(attachment.mode(), AttachMode::Live);

        session.log().publish(EventPayload::Done).unwrap();
        let mut seqs = Vec::new();
        while let Some(ReattachItem::Event(event)) = attachment.next().await {
            seqs.push(event.sequence);
        }
        assert_eq!(seqs, [2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_picks_up_finished_transcript() {
        let registry = Arc::new(StreamRegistry::new(5));
        let store = Arc::new(MemoryTranscriptStore::new());
        store.append("s1", stored("s1", 1, EventPayload::text("a"))).unwrap();
        store.append("s1", stored("s1", 2, EventPayload::text("b"))).unwrap();
        store.append("s1", stored("s1", 3, EventPayload::Done)).unwrap();

        let attachment = controller(&registry, &store).attach("s1", Some(1));
        assert_eq!(attachment.mode(), AttachMode::Polling);

        let items: Vec<_> = attachment.into_stream().collect().await;
        let seqs: Vec<_> = items
            .iter()
            .map(|item| match item {
                ReattachItem::Event(e) => e.sequence,
                ReattachItem::Unavailable { .. } => panic!("should have finished"),
            })
            .collect();
        assert_eq!(seqs, [2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_with_unknown_state() {
        let registry = Arc::new(StreamRegistry::new(5));
        let store = Arc::new(MemoryTranscriptStore::new());

        let started = tokio::time::Instant::now();
        let Reattachment::Polling(mut poll) = controller(&registry, &store).attach("ghost", None)
        else {
            panic!("expected polling");
        };

        assert_eq!(
            poll.next().await,
            Some(ReattachItem::Unavailable {
                session_id: "ghost".into(),
                polls: 5,
            })
        );
        assert_eq!(poll.next().await, None);
        assert_eq!(poll.polls(), 5);
        // First tick is immediate, the other four wait one interval each.
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_follows_growing_transcript() {
        let registry = Arc::new(StreamRegistry::new(5));
        let store = Arc::new(MemoryTranscriptStore::new());
        store.append("s1", stored("s1", 1, EventPayload::text("a"))).unwrap();

        let mut attachment = controller(&registry, &store).attach("s1", None);
        assert!(matches!(
            attachment.next().await,
            Some(ReattachItem::Event(StreamEvent { sequence: 1, .. }))
        ));

        store.append("s1", stored("s1", 2, EventPayload::Done)).unwrap();
        assert!(matches!(
            attachment.next().await,
            Some(ReattachItem::Event(StreamEvent { sequence: 2, .. }))
        ));
        assert_eq!(attachment.next().await, None);
    }
}
