//! Scripted agent client for demos and tests.
//!
//! Replays a fixed list of steps (or steps computed from the prompt) as an
//! upstream turn. Injected input is acknowledged in the output as
//! `[ack] <message>`; follow-up turns open with `[follow-up] <message>`.
//! Input still queued when the script runs out is left for a follow-up.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use agent_stream_core::{
    AgentClient, InjectedMessage, InputReceiver, TurnRequest, UpstreamError, UpstreamItem,
    UpstreamStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type Responder = dyn Fn(&str) -> Vec<ScriptStep> + Send + Sync;

/// One step of a scripted turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Item(UpstreamItem),
    Fail(UpstreamError),
    Pause(Duration),
    /// Take injected input for up to this long.
    AwaitInput(Duration),
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Item(UpstreamItem::TextDelta(text.into()))
    }
}

enum Script {
    Fixed(Vec<ScriptStep>),
    Dynamic(Arc<Responder>),
}

/// [`AgentClient`] that plays back a script.
pub struct ScriptedAgent {
    script: Script,
    upstream_id: Option<String>,
    accepts_input: bool,
    start_error: Option<UpstreamError>,
    follow_ups: Mutex<Vec<Vec<String>>>,
}

impl ScriptedAgent {
    /// Play `steps` for every turn.
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_script(Script::Fixed(steps))
    }

    /// Compute the steps from the prompt (or the follow-up message).
    #[must_use]
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Vec<ScriptStep> + Send + Sync + 'static,
    {
        Self::with_script(Script::Dynamic(Arc::new(responder)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            upstream_id: None,
            accepts_input: true,
            start_error: None,
            follow_ups: Mutex::new(Vec::new()),
        }
    }

    /// Announce `id` as the upstream session id at the start of the first turn.
    #[must_use]
    pub fn with_upstream_id(mut self, id: impl Into<String>) -> Self {
        self.upstream_id = Some(id.into());
        self
    }

    /// Refuse mid-turn input; injected messages wait for a follow-up turn.
    #[must_use]
    pub const fn without_input(mut self) -> Self {
        self.accepts_input = false;
        self
    }

    /// Fail every attempt to open a turn.
    #[must_use]
    pub fn failing_start(mut self, err: UpstreamError) -> Self {
        self.start_error = Some(err);
        self
    }

    /// Messages passed to each follow-up turn so far.
    #[must_use]
    pub fn follow_ups(&self) -> Vec<Vec<String>> {
        self.follow_ups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn steps_for(&self, input: &str) -> Vec<ScriptStep> {
        match &self.script {
            Script::Fixed(steps) => steps.clone(),
            Script::Dynamic(responder) => responder(input),
        }
    }

    fn open(&self, steps: Vec<ScriptStep>, input: InputReceiver) -> UpstreamStream {
        let (tx, rx) = mpsc::channel(64);
        let input = self.accepts_input.then_some(input);
        tokio::spawn(play(steps, input, tx));
        ReceiverStream::new(rx).boxed()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn start(
        &self,
        request: &TurnRequest,
        input: InputReceiver,
    ) -> Result<UpstreamStream, UpstreamError> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }

        let mut steps = Vec::new();
        if let Some(upstream_id) = &self.upstream_id {
            steps.push(ScriptStep::Item(UpstreamItem::SessionStarted {
                upstream_id: upstream_id.clone(),
            }));
        }
        steps.extend(self.steps_for(&request.prompt));
        Ok(self.open(steps, input))
    }

    async fn follow_up(
        &self,
        upstream_id: Option<&str>,
        messages: Vec<InjectedMessage>,
        input: InputReceiver,
    ) -> Result<UpstreamStream, UpstreamError> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        tracing::debug!(?upstream_id, count = messages.len(), "scripted follow-up turn");

        let contents: Vec<String> = messages.into_iter().map(|m| m.content).collect();
        let mut steps = Vec::new();
        for content in &contents {
            steps.push(ScriptStep::text(format!("[follow-up] {content}")));
            if matches!(self.script, Script::Dynamic(_)) {
                steps.extend(self.steps_for(content));
            }
        }
        self.follow_ups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(contents);
        Ok(self.open(steps, input))
    }
}

type ItemSender = mpsc::Sender<Result<UpstreamItem, UpstreamError>>;

async fn play(steps: Vec<ScriptStep>, mut input: Option<InputReceiver>, tx: ItemSender) {
    for step in steps {
        if !ack_ready(&mut input, &tx).await {
            return;
        }
        let sent = match step {
            ScriptStep::Item(item) => tx.send(Ok(item)).await.is_ok(),
            ScriptStep::Fail(err) => tx.send(Err(err)).await.is_ok(),
            ScriptStep::Pause(duration) => {
                tokio::time::sleep(duration).await;
                true
            }
            ScriptStep::AwaitInput(duration) => await_input(&mut input, &tx, duration).await,
        };
        if !sent {
            return;
        }
    }
}

async fn ack(tx: &ItemSender, msg: InjectedMessage) -> bool {
    let reply = UpstreamItem::TextDelta(format!("[ack] {}", msg.content));
    tx.send(Ok(reply)).await.is_ok()
}

async fn ack_ready(input: &mut Option<InputReceiver>, tx: &ItemSender) -> bool {
    let Some(rx) = input.as_mut() else {
        return true;
    };
    while let Some(msg) = rx.try_recv() {
        if !ack(tx, msg).await {
            return false;
        }
    }
    true
}

async fn await_input(
    input: &mut Option<InputReceiver>,
    tx: &ItemSender,
    duration: Duration,
) -> bool {
    let Some(rx) = input.as_mut() else {
        tokio::time::sleep(duration).await;
        return true;
    };
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(msg)) => {
                if !ack(tx, msg).await {
                    return false;
                }
            }
            Ok(None) | Err(_) => return true,
        }
    }
}
