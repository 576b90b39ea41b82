//! Stream producer: drives one upstream agent turn into a session's log.

use std::{sync::Arc, time::Duration};

use agent_stream_core::{
    AbortReason, AgentClient, Classification, EventLogError, EventPayload, InjectedMessage,
    Subscription, TurnRequest, UpstreamError, UpstreamItem, UpstreamStream, WarningAggregator,
    classify,
};
use futures::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::registry::{RegistryError, SessionState, StreamRegistry, StreamSession};

/// Messages the running upstream turn has pulled from the queue.
type Taken = mpsc::UnboundedReceiver<InjectedMessage>;

/// Whether the producer keeps running after handling something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Unregisters the session on every exit path, including task abort.
struct CleanupGuard {
    registry: Arc<StreamRegistry>,
    session: Arc<StreamSession>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let leftover = self.session.queue().close_and_drain();
        if !self.session.log().is_terminal() {
            // Only reachable when the task was aborted or panicked.
            let _ = self.session.log().publish(EventPayload::Aborted {
                reason: AbortReason::Cancelled,
                undelivered_messages: leftover.len(),
            });
        }
        let released = self.registry.release(&self.session);
        tracing::debug!(
            session_id = %self.session.id(),
            released,
            last_sequence = self.session.log().last_sequence(),
            "stream producer exited"
        );
    }
}

/// Wraps one agent invocation and publishes its output as session events.
pub struct StreamProducer {
    client: Arc<dyn AgentClient>,
    registry: Arc<StreamRegistry>,
    session: Arc<StreamSession>,
    poll_interval: Duration,
    warnings: WarningAggregator,
    upstream_id: Option<String>,
}

impl StreamProducer {
    #[must_use]
    pub fn new(
        client: Arc<dyn AgentClient>,
        registry: Arc<StreamRegistry>,
        session: Arc<StreamSession>,
        poll_interval: Duration,
        warning_detail_cap: usize,
    ) -> Self {
        Self {
            client,
            registry,
            session,
            poll_interval,
            warnings: WarningAggregator::new(warning_detail_cap),
            upstream_id: None,
        }
    }

    /// Spawn the producer task for `request`.
    ///
    /// The returned subscription starts at the first event, so the caller
    /// sees everything even if it reads late.
    pub fn start(self, request: TurnRequest) -> (Subscription, JoinHandle<()>) {
        let subscription = self.session.log().subscribe(None);
        let task = tokio::spawn(self.run(request));
        (subscription, task)
    }

    async fn run(mut self, request: TurnRequest) {
        let _guard = CleanupGuard {
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&self.session),
        };
        let mut stop = self.session.stop_signal();
        if stop.borrow().is_some() {
            return self.stopped(&stop);
        }

        let (taken_tx, taken) = mpsc::unbounded_channel();
        let input = self.session.queue().receiver(taken_tx);
        let opened = tokio::select! {
            biased;
            _ = stop.changed() => None,
            result = self.client.start(&request, input) => Some(result),
        };
        let upstream = match opened {
            None => return self.stopped(&stop),
            Some(Ok(upstream)) => upstream,
            Some(Err(err)) => return self.fail(&err),
        };

        self.pump(upstream, taken, &mut stop).await;
    }

    async fn pump(
        &mut self,
        mut upstream: UpstreamStream,
        mut taken: Taken,
        stop: &mut watch::Receiver<Option<AbortReason>>,
    ) {
        let mut poll = tokio::time::interval(self.poll_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => return self.stopped(stop),
                Some(msg) = taken.recv() => {
                    if self.delivered(&msg) == Flow::Stop {
                        return;
                    }
                }
                item = upstream.next() => {
                    let flow = match item {
                        Some(Ok(item)) => self.on_item(item),
                        Some(Err(err)) => self.on_error(&err),
                        None => match self.finalize(&mut taken, stop).await {
                            Some((next, next_taken)) => {
                                upstream = next;
                                taken = next_taken;
                                Flow::Continue
                            }
                            None => Flow::Stop,
                        },
                    };
                    if flow == Flow::Stop {
                        return;
                    }
                }
                _ = poll.tick() => {
                    if self.session.log().is_terminal() {
                        tracing::debug!(session_id = %self.session.id(), "event log closed externally");
                        return;
                    }
                }
            }
        }
    }

    /// The upstream turn ended: finish, or continue with late messages.
    async fn finalize(
        &mut self,
        taken: &mut Taken,
        stop: &mut watch::Receiver<Option<AbortReason>>,
    ) -> Option<(UpstreamStream, Taken)> {
        // Ends the turn's input handle; anything it did not pull stays queued.
        taken.close();
        while let Ok(msg) = taken.try_recv() {
            if self.delivered(&msg) == Flow::Stop {
                return None;
            }
        }

        let pending = match self.session.queue().close_if_empty() {
            Ok(()) => {
                self.flush_warnings();
                let _ = self.publish(EventPayload::Done);
                return None;
            }
            Err(pending) => pending,
        };

        tracing::debug!(
            session_id = %self.session.id(),
            count = pending.len(),
            "continuing with messages queued during finalize"
        );
        for msg in &pending {
            let payload = EventPayload::UserMessage {
                content: msg.content.clone(),
            };
            if self.emit(payload) == Flow::Stop {
                return None;
            }
        }

        let (taken_tx, next_taken) = mpsc::unbounded_channel();
        let input = self.session.queue().receiver(taken_tx);
        let client = Arc::clone(&self.client);
        let upstream_id = self.upstream_id.clone();
        let opened = tokio::select! {
            biased;
            _ = stop.changed() => None,
            result = client.follow_up(upstream_id.as_deref(), pending, input) => Some(result),
        };
        match opened {
            None => {
                self.stopped(stop);
                None
            }
            Some(Ok(next)) => Some((next, next_taken)),
            Some(Err(err)) => {
                self.fail(&err);
                None
            }
        }
    }

    /// The upstream pulled `msg` from the queue.
    fn delivered(&mut self, msg: &InjectedMessage) -> Flow {
        tracing::debug!(session_id = %self.session.id(), waited = ?msg.waited(), "injected message delivered");
        self.emit(EventPayload::UserMessage {
            content: msg.content.clone(),
        })
    }

    fn on_item(&mut self, item: UpstreamItem) -> Flow {
        let payload = match item {
            UpstreamItem::SessionStarted { upstream_id } => return self.activate(upstream_id),
            UpstreamItem::TextDelta(text) => EventPayload::TextDelta { text },
            UpstreamItem::ToolUse { id, name, input } => EventPayload::ToolUse { id, name, input },
            UpstreamItem::ToolResult {
                id,
                output,
                is_error,
            } => EventPayload::ToolResult {
                id,
                output,
                is_error,
            },
            UpstreamItem::Question { id, prompt } => EventPayload::Question { id, prompt },
        };
        self.emit(payload)
    }

    fn on_error(&mut self, err: &UpstreamError) -> Flow {
        match classify(err) {
            Classification::NonFatal(issue) => {
                tracing::warn!(session_id = %self.session.id(), kind = ?issue.kind, "{err}");
                self.warnings.record(issue);
                Flow::Continue
            }
            Classification::Terminal(payload) => {
                tracing::error!(session_id = %self.session.id(), "upstream failed: {err}");
                self.terminate(payload);
                Flow::Stop
            }
        }
    }

    /// The upstream could not be opened at all; every failure is terminal here.
    fn fail(&mut self, err: &UpstreamError) {
        tracing::error!(session_id = %self.session.id(), "upstream unavailable: {err}");
        let payload = match classify(err) {
            Classification::Terminal(payload) => payload,
            Classification::NonFatal(issue) => EventPayload::TypedError {
                kind: issue.kind,
                message: issue.detail,
                retryable: false,
            },
        };
        self.terminate(payload);
    }

    fn activate(&mut self, upstream_id: String) -> Flow {
        self.upstream_id = Some(upstream_id.clone());
        if self.session.state() != SessionState::Pending {
            return Flow::Continue;
        }

        let provisional_id = self.session.id();
        match self.registry.rekey(&provisional_id, &upstream_id) {
            Ok(_) => self.emit(EventPayload::SessionActivated { provisional_id }),
            Err(RegistryError::AlreadyActive(taken)) => {
                tracing::warn!(
                    session_id = %provisional_id,
                    upstream_id = %taken,
                    "upstream id already streaming, keeping provisional id"
                );
                Flow::Continue
            }
            Err(RegistryError::NotFound(_)) => {
                tracing::debug!(session_id = %provisional_id, "session no longer registered");
                Flow::Stop
            }
        }
    }

    /// Publish a terminal payload, reporting messages that never got delivered.
    fn terminate(&mut self, payload: EventPayload) {
        let undelivered = self.session.queue().close_and_drain();

        let payload = match payload {
            EventPayload::Aborted { reason, .. } => EventPayload::Aborted {
                reason,
                undelivered_messages: undelivered.len(),
            },
            other => {
                if !undelivered.is_empty() {
                    tracing::warn!(
                        session_id = %self.session.id(),
                        count = undelivered.len(),
                        "stream failed with injected messages pending"
                    );
                }
                other
            }
        };

        self.flush_warnings();
        let _ = self.publish(payload);
    }

    fn stopped(&mut self, stop: &watch::Receiver<Option<AbortReason>>) {
        let reason = (*stop.borrow()).unwrap_or(AbortReason::Cancelled);
        tracing::info!(session_id = %self.session.id(), ?reason, "stream stopped");
        if reason == AbortReason::Cancelled {
            self.terminate(EventPayload::Aborted {
                reason,
                undelivered_messages: 0,
            });
        }
    }

    /// Publish content, then any warning that was waiting for it.
    fn emit(&mut self, payload: EventPayload) -> Flow {
        let content = payload.is_content();
        if self.publish(payload) == Flow::Stop {
            return Flow::Stop;
        }
        if content {
            if let Some(warning) = self.warnings.take() {
                return self.publish(warning);
            }
        }
        Flow::Continue
    }

    fn flush_warnings(&mut self) {
        if let Some(warning) = self.warnings.take() {
            let _ = self.publish(warning);
        }
    }

    fn publish(&self, payload: EventPayload) -> Flow {
        match self.session.log().publish(payload) {
            Ok(_) => Flow::Continue,
            Err(EventLogError::Terminated(id)) => {
                tracing::debug!(session_id = %id, "event log already sealed");
                Flow::Stop
            }
        }
    }
}
