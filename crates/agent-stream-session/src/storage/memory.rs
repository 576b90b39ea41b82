//! In-memory transcript storage.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use agent_stream_core::{
    EventPayload, StoreError, StreamEvent, Subscription, Transcript, TranscriptStore,
};
use async_trait::async_trait;

/// In-memory transcript store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryTranscriptStore {
    transcripts: RwLock<HashMap<String, Vec<StreamEvent>>>,
}

impl MemoryTranscriptStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transcripts: RwLock::new(HashMap::new()),
        }
    }

    /// Append an event to the transcript kept under `key`.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn append(&self, key: &str, event: StreamEvent) -> Result<(), StoreError> {
        self.transcripts
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .entry(key.to_string())
            .or_default()
            .push(event);
        Ok(())
    }

    /// Number of stored events under `key`.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self
            .transcripts
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(key)
            .map_or(0, Vec::len))
    }

    /// Copy every event from `subscription` into this store.
    ///
    /// Events are kept under `session_id` and, after a re-key, under the
    /// upstream id as well, so either id finds the transcript.
    pub fn spawn_recorder(
        self: Arc<Self>,
        session_id: String,
        mut subscription: Subscription,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut keys = vec![session_id];
            while let Some(event) = subscription.next().await {
                if matches!(event.payload, EventPayload::SessionActivated { .. })
                    && !keys.contains(&event.session_id)
                {
                    let history = self.copy_of(&keys[0]);
                    for past in history {
                        if let Err(e) = self.append(&event.session_id, past) {
                            tracing::warn!("transcript copy failed: {e}");
                        }
                    }
                    keys.push(event.session_id.clone());
                }
                for key in &keys {
                    if let Err(e) = self.append(key, event.clone()) {
                        tracing::warn!(session_id = %key, "transcript append failed: {e}");
                    }
                }
            }
        })
    }

    fn copy_of(&self, key: &str) -> Vec<StreamEvent> {
        self.transcripts
            .read()
            .map(|t| t.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Default for MemoryTranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn events_after(
        &self,
        session_id: &str,
        after: Option<u64>,
    ) -> Result<Option<Transcript>, StoreError> {
        let transcripts = self
            .transcripts
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        Ok(transcripts.get(session_id).map(|events| Transcript {
            events: events
                .iter()
                .filter(|e| after.is_none_or(|last| e.sequence > last))
                .cloned()
                .collect(),
        }))
    }
}
