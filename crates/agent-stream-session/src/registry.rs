//! Registry of live stream sessions.
//!
//! Every mutation (register, re-key, unregister, eviction) goes through one
//! mutex, so creation, injection and re-keying never interleave.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_stream_core::{
    AbortReason, EnqueueError, EventLog, EventPayload, InjectedMessage, InjectionQueue,
};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::config::BrokerConfig;

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session {0} already has an active stream")]
    AlreadyActive(String),
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Running under a provisional id; the upstream id is not known yet.
    Pending,
    /// Keyed by its stable id.
    Active,
}

struct Identity {
    id: String,
    state: SessionState,
}

/// One live session: its event log, injection queue and stop signal.
pub struct StreamSession {
    ordinal: u64,
    created_at: Instant,
    identity: Mutex<Identity>,
    log: Arc<EventLog>,
    queue: Arc<InjectionQueue>,
    stop: watch::Sender<Option<AbortReason>>,
}

impl StreamSession {
    /// Create a session sized by `config`.
    #[must_use]
    pub fn new(id: impl Into<String>, state: SessionState, config: &BrokerConfig) -> Self {
        let id = id.into();
        let (stop, _) = watch::channel(None);
        Self {
            ordinal: 0,
            created_at: Instant::now(),
            log: Arc::new(EventLog::new(
                id.clone(),
                config.history_capacity,
                config.live_buffer,
            )),
            queue: Arc::new(InjectionQueue::new(config.queue_capacity)),
            identity: Mutex::new(Identity { id, state }),
            stop,
        }
    }

    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session id.
    #[must_use]
    pub fn id(&self) -> String {
        self.identity().id.clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.identity().state
    }

    #[must_use]
    pub const fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<InjectionQueue> {
        &self.queue
    }

    /// Receiver that fires when the session is cancelled or evicted.
    #[must_use]
    pub fn stop_signal(&self) -> watch::Receiver<Option<AbortReason>> {
        self.stop.subscribe()
    }

    /// Queue a message for the running upstream turn.
    ///
    /// # Errors
    /// Returns error if the queue is full or the session is ending.
    pub fn inject(&self, msg: InjectedMessage) -> Result<(), EnqueueError> {
        self.queue.enqueue(msg)
    }

    /// Ask the producer to stop. Returns false if a stop was already requested.
    pub fn cancel(&self) -> bool {
        self.stop.send_if_modified(|reason| {
            if reason.is_some() {
                return false;
            }
            *reason = Some(AbortReason::Cancelled);
            true
        })
    }

    /// Close the session from outside its producer.
    ///
    /// Pending messages are counted in the terminal event; the producer sees
    /// the sealed log and stops on its own.
    fn evict(&self) {
        let undelivered = self.queue.close_and_drain();
        let sealed = self
            .log
            .publish(EventPayload::Aborted {
                reason: AbortReason::Evicted,
                undelivered_messages: undelivered.len(),
            })
            .is_ok();
        self.stop.send_replace(Some(AbortReason::Evicted));
        tracing::warn!(
            session_id = %self.id(),
            undelivered = undelivered.len(),
            sealed,
            "session evicted"
        );
    }

    fn summary(&self) -> SessionSummary {
        let identity = self.identity();
        SessionSummary {
            session_id: identity.id.clone(),
            state: identity.state,
            last_sequence: self.log.last_sequence(),
            pending_messages: self.queue.len(),
            subscribers: self.log.subscriber_count(),
            age_ms: u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Snapshot of a live session for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub last_sequence: u64,
    pub pending_messages: usize,
    pub subscribers: usize,
    pub age_ms: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<StreamSession>>,
    /// Provisional id -> current id, for sessions that were re-keyed.
    aliases: HashMap<String, String>,
}

impl Inner {
    fn resolve(&self, id: &str) -> Option<&Arc<StreamSession>> {
        self.sessions.get(id).or_else(|| {
            self.aliases
                .get(id)
                .and_then(|current| self.sessions.get(current))
        })
    }

    fn remove(&mut self, id: &str) -> Option<Arc<StreamSession>> {
        let session = self.sessions.remove(id)?;
        self.aliases.retain(|_, current| current != id);
        Some(session)
    }
}

/// Maps session ids to live sessions and bounds how many exist.
pub struct StreamRegistry {
    max_sessions: usize,
    next_ordinal: AtomicU64,
    inner: Mutex<Inner>,
}

impl StreamRegistry {
    /// Create a registry holding at most `max_sessions` live sessions.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            next_ordinal: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session under its id, evicting the oldest one on overflow.
    ///
    /// Returns the evicted session, already closed.
    ///
    /// # Errors
    /// Returns error if the id already has a live session.
    pub fn register(
        &self,
        mut session: StreamSession,
    ) -> Result<(Arc<StreamSession>, Option<Arc<StreamSession>>), RegistryError> {
        let id = session.id();
        let (session, evicted) = {
            let mut inner = self.lock();
            if inner.sessions.contains_key(&id) {
                return Err(RegistryError::AlreadyActive(id));
            }

            let evicted = if inner.sessions.len() >= self.max_sessions {
                let oldest = inner
                    .sessions
                    .iter()
                    .min_by_key(|(_, s)| s.ordinal)
                    .map(|(key, _)| key.clone());
                oldest.and_then(|key| inner.remove(&key))
            } else {
                None
            };

            session.ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
            let session = Arc::new(session);
            inner.aliases.remove(&id);
            inner.sessions.insert(id.clone(), Arc::clone(&session));
            (session, evicted)
        };

        if let Some(evicted) = &evicted {
            evicted.evict();
        }
        tracing::debug!(session_id = %id, evicted = evicted.is_some(), "session registered");
        Ok((session, evicted))
    }

    /// Find a live session by id (or by its provisional id after a re-key).
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.lock().resolve(id).cloned()
    }

    /// Move a session from `old_id` to `new_id` in one step.
    ///
    /// The queue and event log travel with the session, and lookups of
    /// `old_id` keep resolving to it.
    ///
    /// # Errors
    /// Returns error if `old_id` is gone or `new_id` is taken.
    pub fn rekey(&self, old_id: &str, new_id: &str) -> Result<Arc<StreamSession>, RegistryError> {
        let mut inner = self.lock();
        if old_id == new_id {
            return inner
                .sessions
                .get(old_id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(old_id.to_string()));
        }
        if inner.sessions.contains_key(new_id) {
            return Err(RegistryError::AlreadyActive(new_id.to_string()));
        }
        let session = inner
            .sessions
            .remove(old_id)
            .ok_or_else(|| RegistryError::NotFound(old_id.to_string()))?;

        {
            let mut identity = session.identity();
            identity.id = new_id.to_string();
            identity.state = SessionState::Active;
        }
        session.log.rename(new_id);
        for current in inner.aliases.values_mut() {
            if current == old_id {
                *current = new_id.to_string();
            }
        }
        inner.aliases.insert(old_id.to_string(), new_id.to_string());
        inner.sessions.insert(new_id.to_string(), Arc::clone(&session));
        drop(inner);

        tracing::info!(from = %old_id, to = %new_id, "session re-keyed");
        Ok(session)
    }

    /// Remove a session by id. Idempotent.
    pub fn unregister(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.lock().remove(id)
    }

    /// Remove `session` if it is still the one registered under its id.
    ///
    /// Returns false when it was already removed or replaced.
    pub fn release(&self, session: &Arc<StreamSession>) -> bool {
        let mut inner = self.lock();
        let id = session.id();
        let registered = inner
            .sessions
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            inner.remove(&id);
        }
        registered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Summaries of live sessions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.ordinal);
        sessions.iter().map(|s| s.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> StreamSession {
        StreamSession::new(id, SessionState::Active, &BrokerConfig::default())
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let registry = StreamRegistry::new(5);
        registry.register(session("s1")).unwrap();
        assert_eq!(
            registry.register(session("s1")).err(),
            Some(RegistryError::AlreadyActive("s1".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_exactly_the_oldest() {
        let registry = StreamRegistry::new(3);
        let mut kept = Vec::new();
        for id in ["a", "b", "c"] {
            let (s, evicted) = registry.register(session(id)).unwrap();
            assert!(evicted.is_none());
            kept.push(s);
        }

        let (_, evicted) = registry.register(session("d")).unwrap();
        let evicted = evicted.unwrap();
        assert_eq!(evicted.id(), "a");
        assert!(evicted.log().is_terminal());
        assert!(evicted.queue().is_closed());
        assert_eq!(*evicted.stop_signal().borrow(), Some(AbortReason::Evicted));

        let ids: Vec<_> = registry.list().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, ["b", "c", "d"]);
        for s in &kept[1..] {
            assert!(!s.log().is_terminal());
            assert!(!s.queue().is_closed());
        }
    }

    #[test]
    fn test_eviction_reports_pending_messages() {
        let registry = StreamRegistry::new(1);
        let (first, _) = registry.register(session("a")).unwrap();
        first.inject(InjectedMessage::new("one").unwrap()).unwrap();
        first.inject(InjectedMessage::new("two").unwrap()).unwrap();

        registry.register(session("b")).unwrap();

        let last = first.log().events_after(None).pop().unwrap();
        assert_eq!(
            last.payload,
            EventPayload::Aborted {
                reason: AbortReason::Evicted,
                undelivered_messages: 2,
            }
        );
        assert_eq!(
            first.inject(InjectedMessage::new("three").unwrap()),
            Err(EnqueueError::Closed)
        );
    }

    #[test]
    fn test_rekey_moves_queue_and_log() {
        let registry = StreamRegistry::new(5);
        let (pending, _) = registry
            .register(StreamSession::new(
                "pending-1",
                SessionState::Pending,
                &BrokerConfig::default(),
            ))
            .unwrap();
        pending.log().publish(EventPayload::text("before")).unwrap();
        pending.inject(InjectedMessage::new("queued").unwrap()).unwrap();

        let moved = registry.rekey("pending-1", "upstream-1").unwrap();
        assert!(Arc::ptr_eq(&moved, &pending));
        assert_eq!(moved.state(), SessionState::Active);
        assert_eq!(moved.queue().len(), 1);
        assert_eq!(moved.log().last_sequence(), 1);

        let by_new = registry.lookup("upstream-1").unwrap();
        let by_old = registry.lookup("pending-1").unwrap();
        assert!(Arc::ptr_eq(&by_new, &by_old));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rekey_to_taken_id_fails() {
        let registry = StreamRegistry::new(5);
        registry.register(session("a")).unwrap();
        registry.register(session("b")).unwrap();
        assert_eq!(
            registry.rekey("a", "b").err(),
            Some(RegistryError::AlreadyActive("b".into()))
        );
        assert!(registry.lookup("a").is_some());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = StreamRegistry::new(5);
        registry.register(session("a")).unwrap();
        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_ignores_replacement() {
        let registry = StreamRegistry::new(5);
        let (old, _) = registry.register(session("a")).unwrap();
        registry.unregister("a");
        let (new, _) = registry.register(session("a")).unwrap();

        assert!(!registry.release(&old));
        assert!(registry.lookup("a").is_some());
        assert!(registry.release(&new));
        assert!(registry.lookup("a").is_none());
    }

    #[test]
    fn test_release_after_rekey_drops_alias() {
        let registry = StreamRegistry::new(5);
        let (s, _) = registry.register(session("p")).unwrap();
        registry.rekey("p", "u").unwrap();
        assert!(registry.release(&s));
        assert!(registry.lookup("p").is_none());
        assert!(registry.lookup("u").is_none());
    }

    #[test]
    fn test_cancel_fires_once() {
        let s = session("a");
        assert!(s.cancel());
        assert!(!s.cancel());
        assert_eq!(*s.stop_signal().borrow(), Some(AbortReason::Cancelled));
    }
}
