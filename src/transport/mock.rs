//! In-process transport double for tests.
//!
//! `MockTransport` records every outbound command, answers synchronous
//! requests through a scriptable responder, and lets tests inject inbound
//! dispatches and interruption events as if a broker were attached.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Transport, TransportListener};
use crate::{
    command::{Command, MessageAck, MessageDispatch, MessagePull, Response},
    error::{Result, WirebusError},
};

type Responder = Box<dyn Fn(&Command) -> Result<Response> + Send + Sync>;

#[derive(Default)]
struct MockInner {
    sent: Mutex<Vec<Command>>,
    requests: Mutex<Vec<Command>>,
    responder: Mutex<Option<Responder>>,
    oneway_failure: Mutex<Option<String>>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    interruption_completions: AtomicUsize,
}

/// Scripted transport recording everything the runtime sends.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Every command sent so far, oneway and request alike, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Command> { self.inner.sent.lock().clone() }

    /// The acks sent so far, in order.
    #[must_use]
    pub fn acks(&self) -> Vec<MessageAck> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter_map(|command| match command {
                Command::MessageAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    /// The message pulls sent so far, in order.
    #[must_use]
    pub fn pulls(&self) -> Vec<MessagePull> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter_map(|command| match command {
                Command::MessagePull(pull) => Some(pull.clone()),
                _ => None,
            })
            .collect()
    }

    /// The subset of [`sent`](Self::sent) that went out as synchronous
    /// requests.
    #[must_use]
    pub fn requests(&self) -> Vec<Command> { self.inner.requests.lock().clone() }

    /// Forget everything recorded so far.
    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
        self.inner.requests.lock().clear();
    }

    /// Script the reply for synchronous requests. Without a responder every
    /// request succeeds with [`Response::Ok`].
    pub fn set_responder(
        &self,
        responder: impl Fn(&Command) -> Result<Response> + Send + Sync + 'static,
    ) {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// Fail the next oneway send with a broken-pipe transport error.
    pub fn fail_next_oneway(&self, reason: impl Into<String>) {
        *self.inner.oneway_failure.lock() = Some(reason.into());
    }

    /// Inject an inbound dispatch as if the broker pushed it.
    pub async fn dispatch(&self, dispatch: MessageDispatch) {
        self.inject(Command::MessageDispatch(dispatch)).await;
    }

    /// Inject an arbitrary inbound command.
    pub async fn inject(&self, command: Command) {
        if let Some(listener) = self.listener() {
            listener.on_command(command).await;
        }
    }

    /// Simulate a transport interruption.
    pub async fn interrupt(&self) {
        if let Some(listener) = self.listener() {
            listener.on_interrupted().await;
        }
    }

    /// Simulate the transport reconnecting.
    pub async fn resume(&self) {
        if let Some(listener) = self.listener() {
            listener.on_resumed().await;
        }
    }

    /// Simulate an unrecoverable transport failure.
    pub async fn fail(&self, error: impl Into<String>) {
        if let Some(listener) = self.listener() {
            listener.on_exception(error.into()).await;
        }
    }

    /// How many times the runtime reported interruption processing complete.
    #[must_use]
    pub fn interruption_completions(&self) -> usize {
        self.inner.interruption_completions.load(Ordering::SeqCst)
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.inner.listener.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn oneway(&self, command: Command) -> Result<()> {
        if let Some(reason) = self.inner.oneway_failure.lock().take() {
            return Err(WirebusError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                reason,
            )));
        }
        self.inner.sent.lock().push(command);
        Ok(())
    }

    async fn request(&self, command: Command, _timeout: Option<Duration>) -> Result<Response> {
        let reply = match &*self.inner.responder.lock() {
            Some(responder) => responder(&command),
            None => Ok(Response::Ok),
        };
        if reply.is_ok() {
            self.inner.sent.lock().push(command.clone());
            self.inner.requests.lock().push(command);
        }
        reply
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    async fn interruption_processing_complete(&self) {
        self.inner
            .interruption_completions
            .fetch_add(1, Ordering::SeqCst);
    }
}
