//! Session broker: the entry point for starting, feeding and following streams.

use std::sync::Arc;

use agent_stream_core::{
    AgentClient, EnqueueError, InjectedMessage, Subscription, TranscriptStore, TurnRequest,
    ValidationError,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    config::BrokerConfig,
    producer::StreamProducer,
    reattach::{ReattachController, Reattachment},
    registry::{RegistryError, SessionState, SessionSummary, StreamRegistry, StreamSession},
};

/// Session broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),
    #[error("No active stream for session {0}")]
    NoActiveStream(String),
    #[error("Injection queue for session {session_id} is full ({capacity} pending)")]
    QueueFull { session_id: String, capacity: usize },
    #[error("Session {0} already has an active stream")]
    AlreadyStreaming(String),
}

impl BrokerError {
    /// Whether the caller should send the message as a new turn instead.
    #[must_use]
    pub const fn resend_as_new_turn(&self) -> bool {
        matches!(self, Self::NoActiveStream(_) | Self::QueueFull { .. })
    }
}

/// A session that was just started.
pub struct StartedSession {
    /// Id the session was registered under. Provisional until re-keyed.
    pub session_id: String,
    /// Subscription positioned before the first event.
    pub subscription: Subscription,
    pub task: JoinHandle<()>,
}

/// Orchestrates live stream sessions over one agent client.
pub struct SessionBroker {
    config: BrokerConfig,
    client: Arc<dyn AgentClient>,
    registry: Arc<StreamRegistry>,
    reattach: ReattachController,
    #[cfg(feature = "memory")]
    recorder: Option<Arc<crate::storage::MemoryTranscriptStore>>,
}

impl SessionBroker {
    /// Create a broker. `store` backs reattachment once a session is gone.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        client: Arc<dyn AgentClient>,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new(config.max_sessions));
        let reattach = ReattachController::new(
            Arc::clone(&registry),
            store,
            config.fallback_tick(),
            config.fallback_max_ticks,
        );
        Self {
            config,
            client,
            registry,
            reattach,
            #[cfg(feature = "memory")]
            recorder: None,
        }
    }

    /// Record every session's events into `store`.
    #[cfg(feature = "memory")]
    #[must_use]
    pub fn with_recorder(mut self, store: Arc<crate::storage::MemoryTranscriptStore>) -> Self {
        self.recorder = Some(store);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Start a session and spawn its producer.
    ///
    /// Without a caller-supplied id the session runs under a provisional
    /// `pending-` id until the upstream announces its own.
    ///
    /// # Errors
    /// Returns error if the prompt is invalid or the id is already streaming.
    pub fn start_session(&self, request: TurnRequest) -> Result<StartedSession, BrokerError> {
        request.validate()?;
        let (session_id, state) = match &request.session_id {
            Some(id) => (id.clone(), SessionState::Active),
            None => (format!("pending-{}", Uuid::new_v4()), SessionState::Pending),
        };

        let (session, evicted) = self
            .registry
            .register(StreamSession::new(&session_id, state, &self.config))
            .map_err(|e| match e {
                RegistryError::AlreadyActive(id) | RegistryError::NotFound(id) => {
                    BrokerError::AlreadyStreaming(id)
                }
            })?;
        if let Some(evicted) = evicted {
            tracing::info!(
                session_id = %session_id,
                evicted = %evicted.id(),
                "session limit reached, evicted oldest"
            );
        }

        #[cfg(feature = "memory")]
        if let Some(store) = &self.recorder {
            Arc::clone(store).spawn_recorder(session_id.clone(), session.log().subscribe(None));
        }

        let producer = StreamProducer::new(
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            session,
            self.config.poll_interval(),
            self.config.warning_detail_cap,
        );
        let (subscription, task) = producer.start(request);
        tracing::info!(%session_id, ?state, "session started");

        Ok(StartedSession {
            session_id,
            subscription,
            task,
        })
    }

    /// Queue a message for the session's running turn.
    ///
    /// # Errors
    /// Returns error if the message is invalid, no stream is live for
    /// `session_id`, or its queue is full.
    pub fn inject(&self, session_id: &str, content: impl Into<String>) -> Result<(), BrokerError> {
        let msg = InjectedMessage::new(content)?;
        let session = self
            .registry
            .lookup(session_id)
            .filter(|s| !s.log().is_terminal())
            .ok_or_else(|| BrokerError::NoActiveStream(session_id.to_string()))?;

        session.inject(msg).map_err(|e| match e {
            EnqueueError::Full { capacity } => BrokerError::QueueFull {
                session_id: session_id.to_string(),
                capacity,
            },
            EnqueueError::Closed => BrokerError::NoActiveStream(session_id.to_string()),
        })?;
        tracing::debug!(
            %session_id,
            pending = session.queue().len(),
            "message injected"
        );
        Ok(())
    }

    /// Like [`SessionBroker::inject`], reporting only whether it was queued.
    pub fn try_inject(&self, session_id: &str, content: impl Into<String>) -> bool {
        match self.inject(session_id, content) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%session_id, "injection refused: {e}");
                false
            }
        }
    }

    /// Stop the session's stream; subscribers receive `aborted`.
    ///
    /// # Errors
    /// Returns error if no stream is live for `session_id`.
    pub fn abort(&self, session_id: &str) -> Result<(), BrokerError> {
        let session = self
            .registry
            .lookup(session_id)
            .ok_or_else(|| BrokerError::NoActiveStream(session_id.to_string()))?;
        if !session.cancel() {
            tracing::debug!(%session_id, "abort already requested");
        }
        Ok(())
    }

    /// Follow a session from after `last_seen`, live or from its transcript.
    #[must_use]
    pub fn attach(&self, session_id: &str, last_seen: Option<u64>) -> Reattachment {
        self.reattach.attach(session_id, last_seen)
    }

    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list()
    }
}
