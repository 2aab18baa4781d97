//! Per-consumer mailbox between the transport's inbound path and the
//! application.
//!
//! A [`DispatchChannel`] buffers [`MessageDispatch`]es for one consumer until
//! a synchronous receiver dequeues them or the session executor redispatches
//! them to a listener. The channel is a small state machine: it starts
//! `Stopped`, delivers only while `Running`, and once `Closed` never delivers
//! again. Every state change wakes all waiters so blocked receivers observe
//! stops and closes promptly.
//!
//! Two buffering flavours exist: strict FIFO arrival order, and a
//! priority-aware flavour with one FIFO bucket per JMS priority level that
//! dequeues high before low. The flavour is fixed at construction from the
//! connection's priority support.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};

use crate::command::{Message, MessageDispatch};

/// Number of priority buckets; JMS priorities are `0..=9`.
const PRIORITY_LEVELS: usize = 10;

/// Lifecycle of a dispatch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelState {
    Closed,
    Stopped,
    Running,
}

enum Buffer {
    Fifo(VecDeque<MessageDispatch>),
    Priority(Box<[VecDeque<MessageDispatch>; PRIORITY_LEVELS]>),
}

impl Buffer {
    fn fifo() -> Self { Self::Fifo(VecDeque::new()) }

    fn priority() -> Self {
        Self::Priority(Box::new(std::array::from_fn(|_| VecDeque::new())))
    }

    fn push_back(&mut self, dispatch: MessageDispatch) {
        match self {
            Self::Fifo(queue) => queue.push_back(dispatch),
            Self::Priority(buckets) => buckets[bucket_for(&dispatch)].push_back(dispatch),
        }
    }

    fn push_front(&mut self, dispatch: MessageDispatch) {
        match self {
            Self::Fifo(queue) => queue.push_front(dispatch),
            Self::Priority(buckets) => buckets[bucket_for(&dispatch)].push_front(dispatch),
        }
    }

    fn pop(&mut self) -> Option<MessageDispatch> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::Priority(buckets) => buckets
                .iter_mut()
                .rev()
                .find_map(|bucket| bucket.pop_front()),
        }
    }

    /// Drain every buffered dispatch in dequeue order.
    fn drain(&mut self) -> Vec<MessageDispatch> {
        match self {
            Self::Fifo(queue) => queue.drain(..).collect(),
            Self::Priority(buckets) => buckets
                .iter_mut()
                .rev()
                .flat_map(|bucket| bucket.drain(..))
                .collect(),
        }
    }
}

/// The priority bucket a dispatch sorts into; null-message wake markers use
/// the default priority.
fn bucket_for(dispatch: &MessageDispatch) -> usize {
    let priority = dispatch
        .message
        .as_ref()
        .map_or(Message::DEFAULT_PRIORITY, |message| message.priority);
    usize::from(priority).min(PRIORITY_LEVELS - 1)
}

struct ChannelInner {
    state: ChannelState,
    buffer: Buffer,
    size: usize,
}

/// Closeable mailbox of pending dispatches for one consumer.
pub struct DispatchChannel {
    inner: Mutex<ChannelInner>,
    notify: Notify,
}

impl DispatchChannel {
    /// Create a strict-FIFO channel in the `Stopped` state.
    #[must_use]
    pub fn fifo() -> Self { Self::with_buffer(Buffer::fifo()) }

    /// Create a priority-aware channel in the `Stopped` state.
    #[must_use]
    pub fn priority() -> Self { Self::with_buffer(Buffer::priority()) }

    fn with_buffer(buffer: Buffer) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Stopped,
                buffer,
                size: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a dispatch; no-op once closed.
    pub fn enqueue(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Closed {
            return;
        }
        inner.buffer.push_back(dispatch);
        inner.size += 1;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Push a dispatch at the head so it is delivered before anything already
    /// buffered at its priority.
    pub fn enqueue_first(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Closed {
            return;
        }
        inner.buffer.push_front(dispatch);
        inner.size += 1;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Dequeue the next dispatch, waiting up to `timeout`.
    ///
    /// `None` as the timeout waits indefinitely; `Some(Duration::ZERO)` polls
    /// without waiting. Returns `None` when the timeout elapses, when the
    /// channel is closed, or when it is stopped and the wait runs out.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                match inner.state {
                    ChannelState::Closed => return None,
                    ChannelState::Running => {
                        if let Some(dispatch) = inner.buffer.pop() {
                            inner.size -= 1;
                            return Some(dispatch);
                        }
                    }
                    ChannelState::Stopped => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Dequeue without waiting.
    pub fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Running {
            return None;
        }
        let dispatch = inner.buffer.pop();
        if dispatch.is_some() {
            inner.size -= 1;
        }
        dispatch
    }

    /// Remove and return everything buffered, in dequeue order.
    pub fn remove_all(&self) -> Vec<MessageDispatch> {
        let mut inner = self.inner.lock();
        inner.size = 0;
        inner.buffer.drain()
    }

    /// Discard everything buffered.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.buffer.drain();
        inner.size = 0;
    }

    /// Allow delivery; wakes all waiters.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Stopped {
            inner.state = ChannelState::Running;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Suspend delivery without discarding buffered dispatches.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Running {
            inner.state = ChannelState::Stopped;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Close the channel permanently; all waiters observe `None`.
    pub fn close(&self) {
        self.inner.lock().state = ChannelState::Closed;
        self.notify.notify_waiters();
    }

    /// Number of buffered dispatches.
    #[must_use]
    pub fn len(&self) -> usize { self.inner.lock().size }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.lock().state == ChannelState::Closed }

    #[must_use]
    pub fn is_running(&self) -> bool { self.inner.lock().state == ChannelState::Running }
}
