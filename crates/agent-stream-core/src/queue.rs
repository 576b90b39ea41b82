//! Bounded injection queue for mid-stream user input.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};

/// Default number of pending injected messages per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Maximum length of one injected message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 32_000;

/// Rejected message content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    Empty,
    #[error("message is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Check message content against the length limits.
///
/// # Errors
/// Returns error if the content is empty or longer than [`MAX_MESSAGE_CHARS`].
pub fn validate_message(content: &str) -> Result<(), ValidationError> {
    if content.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = content.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}

/// A user message injected while a stream is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedMessage {
    pub content: String,
    pub enqueued_at: Instant,
}

impl InjectedMessage {
    /// Validate and timestamp a message.
    ///
    /// # Errors
    /// Returns error if the content fails validation.
    pub fn new(content: impl Into<String>) -> Result<Self, ValidationError> {
        let content = content.into();
        validate_message(&content)?;
        Ok(Self {
            content,
            enqueued_at: Instant::now(),
        })
    }

    /// Time spent since the message was created.
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("injection queue is full ({capacity} pending)")]
    Full { capacity: usize },
    #[error("injection queue is closed")]
    Closed,
}

struct QueueState {
    items: VecDeque<InjectedMessage>,
    closed: bool,
}

/// Bounded FIFO between the inject API and the upstream turn.
///
/// Enqueueing never blocks; overflow is reported to the caller. A message
/// counts against the capacity until the upstream pulls it through an
/// [`InputReceiver`]. Once closed, the queue refuses new messages but
/// still hands out what it holds through [`InjectionQueue::drain_all`].
pub struct InjectionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for InjectionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl InjectionQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append a message.
    ///
    /// # Errors
    /// Returns error if the queue is full or closed. The message is not kept.
    pub fn enqueue(&self, msg: InjectedMessage) -> Result<(), EnqueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(EnqueueError::Closed);
            }
            if state.items.len() >= self.capacity {
                return Err(EnqueueError::Full {
                    capacity: self.capacity,
                });
            }
            state.items.push_back(msg);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Append a message, reporting only whether it was accepted.
    pub fn try_enqueue(&self, msg: InjectedMessage) -> bool {
        self.enqueue(msg).is_ok()
    }

    /// Pop the oldest message without waiting.
    pub fn try_dequeue(&self) -> Option<InjectedMessage> {
        self.lock().items.pop_front()
    }

    /// Wait up to `timeout` for the oldest message.
    ///
    /// Returns `None` on timeout or once the queue is closed and empty.
    pub async fn dequeue(&self, timeout: Duration) -> Option<InjectedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(msg) = state.items.pop_front() {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Take every pending message in FIFO order.
    pub fn drain_all(&self) -> Vec<InjectedMessage> {
        self.lock().items.drain(..).collect()
    }

    /// Close the queue only if nothing is pending.
    ///
    /// This is the finalize check: it runs under the same lock as
    /// [`InjectionQueue::enqueue`], so a message is either returned here or
    /// refused with [`EnqueueError::Closed`].
    ///
    /// # Errors
    /// Returns the pending messages (queue left open) if any exist.
    pub fn close_if_empty(&self) -> Result<(), Vec<InjectedMessage>> {
        let pending = {
            let mut state = self.lock();
            if state.items.is_empty() {
                state.closed = true;
                None
            } else {
                Some(state.items.drain(..).collect())
            }
        };
        match pending {
            None => {
                self.notify.notify_waiters();
                Ok(())
            }
            Some(items) => Err(items),
        }
    }

    /// Close the queue and return whatever was still pending.
    pub fn close_and_drain(&self) -> Vec<InjectedMessage> {
        let items = {
            let mut state = self.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.notify.notify_waiters();
        items
    }

    /// Hand an upstream turn a pull handle on this queue.
    ///
    /// Every message the handle takes is reported on `taken`. Dropping or
    /// closing the receiver side of `taken` ends the handle; messages it
    /// never took stay queued.
    #[must_use]
    pub fn receiver(
        self: &Arc<Self>,
        taken: mpsc::UnboundedSender<InjectedMessage>,
    ) -> InputReceiver {
        InputReceiver {
            queue: Arc::clone(self),
            taken,
            done: false,
        }
    }

    fn take(&self, taken: &mpsc::UnboundedSender<InjectedMessage>) -> Take {
        let mut state = self.lock();
        let Some(msg) = state.items.pop_front() else {
            return if state.closed { Take::Ended } else { Take::Empty };
        };
        // Reported under the lock, so the finalize check either sees the
        // message in the queue or its report on `taken`.
        match taken.send(msg.clone()) {
            Ok(()) => Take::Message(msg),
            Err(_) => {
                state.items.push_front(msg);
                Take::Ended
            }
        }
    }
}

enum Take {
    Message(InjectedMessage),
    Empty,
    Ended,
}

/// Upstream side of an [`InjectionQueue`] for one turn.
///
/// An upstream that cannot take mid-flight input simply drops the
/// receiver; whatever it never pulled is carried into a follow-up turn.
pub struct InputReceiver {
    queue: Arc<InjectionQueue>,
    taken: mpsc::UnboundedSender<InjectedMessage>,
    done: bool,
}

impl InputReceiver {
    /// Wait for the next injected message.
    ///
    /// Returns `None` once the queue is closed and empty, the turn is over,
    /// or [`InputReceiver::close`] was called.
    pub async fn recv(&mut self) -> Option<InjectedMessage> {
        loop {
            if self.done {
                return None;
            }
            let notified = self.queue.notify.notified();
            match self.queue.take(&self.taken) {
                Take::Message(msg) => return Some(msg),
                Take::Ended => self.done = true,
                Take::Empty => {
                    tokio::select! {
                        () = notified => {}
                        () = self.taken.closed() => self.done = true,
                    }
                }
            }
        }
    }

    /// Take the next message if one is waiting.
    pub fn try_recv(&mut self) -> Option<InjectedMessage> {
        if self.done {
            return None;
        }
        match self.queue.take(&self.taken) {
            Take::Message(msg) => Some(msg),
            Take::Ended => {
                self.done = true;
                None
            }
            Take::Empty => None,
        }
    }

    /// Stop taking input. Pending messages stay in the queue.
    pub fn close(&mut self) {
        self.done = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.done || self.taken.is_closed()
    }
}

impl std::fmt::Debug for InputReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputReceiver")
            .field("pending", &self.queue.len())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn msg(content: &str) -> InjectedMessage {
        InjectedMessage::new(content).unwrap()
    }

    #[test]
    fn test_validation_bounds() {
        assert_eq!(validate_message(""), Err(ValidationError::Empty));
        assert!(validate_message("x").is_ok());
        assert!(validate_message(&"é".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert_eq!(
            validate_message(&"a".repeat(MAX_MESSAGE_CHARS + 1)),
            Err(ValidationError::TooLong {
                len: MAX_MESSAGE_CHARS + 1,
                max: MAX_MESSAGE_CHARS
            })
        );
    }

    #[test]
    fn test_overflow_keeps_prior_entries() {
        let queue = InjectionQueue::new(3);
        for i in 0..3 {
            assert!(queue.try_enqueue(msg(&format!("m{i}"))));
        }
        assert!(!queue.try_enqueue(msg("overflow")));
        assert_eq!(
            queue.enqueue(msg("overflow")),
            Err(EnqueueError::Full { capacity: 3 })
        );

        let drained: Vec<_> = queue.drain_all().into_iter().map(|m| m.content).collect();
        assert_eq!(drained, ["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = InjectionQueue::new(4);
        queue.enqueue(msg("a")).unwrap();
        queue.enqueue(msg("b")).unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.dequeue(timeout).await.unwrap().content, "a");
        assert_eq!(queue.dequeue(timeout).await.unwrap().content, "b");
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out() {
        let queue = InjectionQueue::new(1);
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(500)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InjectionQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.enqueue(msg("late")).unwrap();

        let received = consumer.await.unwrap();
        assert_eq!(received.map(|m| m.content).as_deref(), Some("late"));
    }

    #[test]
    fn test_close_if_empty_refuses_later_enqueue() {
        let queue = InjectionQueue::new(2);
        queue.enqueue(msg("pending")).unwrap();

        let pending = queue.close_if_empty().unwrap_err();
        assert_eq!(pending.len(), 1);
        assert!(!queue.is_closed());

        tokio_test::assert_ok!(queue.close_if_empty());
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(msg("late")), Err(EnqueueError::Closed));
    }

    fn handle(
        queue: &Arc<InjectionQueue>,
    ) -> (InputReceiver, mpsc::UnboundedReceiver<InjectedMessage>) {
        let (taken_tx, taken_rx) = mpsc::unbounded_channel();
        (queue.receiver(taken_tx), taken_rx)
    }

    #[tokio::test]
    async fn test_receiver_reports_what_it_takes() {
        let queue = Arc::new(InjectionQueue::new(2));
        let (mut input, mut taken) = handle(&queue);
        queue.enqueue(msg("one")).unwrap();
        queue.enqueue(msg("two")).unwrap();

        assert_eq!(input.recv().await.unwrap().content, "one");
        assert_eq!(queue.len(), 1);
        assert_eq!(taken.try_recv().unwrap().content, "one");
        assert!(taken.try_recv().is_err());
    }

    #[test]
    fn test_unread_messages_count_against_capacity() {
        let queue = Arc::new(InjectionQueue::new(2));
        let (input, _taken) = handle(&queue);
        queue.enqueue(msg("a")).unwrap();
        queue.enqueue(msg("b")).unwrap();

        assert_eq!(
            queue.enqueue(msg("c")),
            Err(EnqueueError::Full { capacity: 2 })
        );
        drop(input);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_wakes_on_enqueue() {
        let queue = Arc::new(InjectionQueue::new(2));
        let (mut input, _taken) = handle(&queue);
        let consumer = tokio::spawn(async move { input.recv().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.enqueue(msg("late")).unwrap();

        let received = consumer.await.unwrap();
        assert_eq!(received.map(|m| m.content).as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_ended_turn_leaves_message_queued() {
        let queue = Arc::new(InjectionQueue::new(2));
        let (mut input, mut taken) = handle(&queue);
        taken.close();
        queue.enqueue(msg("kept")).unwrap();

        assert!(input.try_recv().is_none());
        assert!(input.recv().await.is_none());
        assert!(input.is_closed());
        let pending = queue.close_if_empty().unwrap_err();
        assert_eq!(pending[0].content, "kept");
    }

    #[tokio::test]
    async fn test_closed_queue_ends_dequeue() {
        let queue = InjectionQueue::new(2);
        queue.enqueue(msg("left")).unwrap();

        let left = queue.close_and_drain();
        assert_eq!(left.len(), 1);
        assert!(queue.dequeue(Duration::from_secs(60)).await.is_none());
    }
}
