//! Message producer and its window-based flow control.

use std::{
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    command::{Command, Message, MessageId, ProducerInfo, RemoveInfo, RemovedObject},
    destination::Destination,
    error::{Result, WirebusError},
    session::SessionHandle,
};

/// Hook applied to every outbound message before it is stamped and sent.
pub type MessageTransformer = Box<dyn Fn(Message) -> Message + Send + Sync>;

/// Usage-accounted back-pressure for asynchronous sends.
///
/// Each fire-and-forget send grows the window by the message size; the
/// broker's `ProducerAck` shrinks it. Senders wait while the window is full.
pub(crate) struct ProducerWindow {
    max_usage: usize,
    usage: Mutex<usize>,
    notify: Notify,
}

impl ProducerWindow {
    pub(crate) fn new(max_usage: usize) -> Self {
        Self {
            max_usage,
            usage: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) async fn wait_for_space(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.usage.lock() < self.max_usage {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn increase(&self, amount: usize) { *self.usage.lock() += amount; }

    pub(crate) fn decrease(&self, amount: usize) {
        let mut usage = self.usage.lock();
        *usage = usage.saturating_sub(amount);
        drop(usage);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn usage(&self) -> usize { *self.usage.lock() }
}

/// Client-side producer bound to one destination.
pub struct MessageProducer {
    info: ProducerInfo,
    session: SessionHandle,
    sequence: AtomicI64,
    window: Option<ProducerWindow>,
    transformer: Option<MessageTransformer>,
    /// Positive send timeout forces synchronous requests.
    send_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl MessageProducer {
    pub(crate) fn new(
        session: SessionHandle,
        info: ProducerInfo,
        transformer: Option<MessageTransformer>,
        send_timeout: Option<Duration>,
    ) -> Self {
        let window = (info.producer_window_size > 0)
            .then(|| ProducerWindow::new(info.producer_window_size as usize));
        Self {
            info,
            session,
            sequence: AtomicI64::new(0),
            window,
            transformer,
            send_timeout,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn info(&self) -> &ProducerInfo { &self.info }

    #[must_use]
    pub fn destination(&self) -> &Destination { &self.info.destination }

    /// Send a message to the producer's destination.
    ///
    /// The send is fire-and-forget when no send timeout is configured, the
    /// connection is not in always-sync mode, and the message is
    /// non-persistent, async-send is enabled, or the send is transacted.
    /// Everything else goes out as a synchronous request so broker
    /// rejections surface here.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after close, or the transport or
    /// broker error from the send.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WirebusError::Disposed("producer"));
        }
        if let Some(transformer) = &self.transformer {
            message = transformer(message);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        message.message_id = Some(MessageId {
            producer_id: self.info.producer_id.clone(),
            producer_sequence_id: sequence,
            broker_sequence_id: 0,
        });
        message.destination = Some(self.info.destination.clone());
        message.redelivery_counter = 0;
        message.redelivered = false;
        message.timestamp = now_millis();

        if self.session.is_transacted() {
            let transaction_id = self.session.ensure_transaction_started().await?;
            message.transaction_id = Some(transaction_id);
        }

        if let Some(window) = &self.window {
            window.wait_for_space().await;
        }
        let size = message.size();

        let oneway = self.send_timeout.is_none()
            && !self.session.always_sync_send()
            && (!message.persistent
                || self.session.async_send()
                || message.transaction_id.is_some());

        if oneway {
            self.session.oneway(Command::Message(message)).await?;
            if let Some(window) = &self.window {
                window.increase(size);
            }
        } else {
            self.session
                .sync_request(Command::Message(message), self.send_timeout)
                .await?;
        }
        Ok(())
    }

    /// Release window usage from a broker `ProducerAck`.
    pub(crate) fn on_producer_ack(&self, size: usize) {
        if let Some(window) = &self.window {
            window.decrease(size);
        }
    }

    /// Tear down local state without telling the broker.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.remove_producer(&self.info.producer_id);
    }

    /// Close the producer and deregister it at the broker.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the teardown command.
    pub async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown();
        self.session
            .oneway(Command::RemoveInfo(RemoveInfo {
                object: RemovedObject::Producer(self.info.producer_id.clone()),
                last_delivered_sequence_id: 0,
            }))
            .await
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::{Duration, timeout};

    use super::*;

    #[tokio::test]
    async fn window_blocks_when_full_and_releases_on_ack() {
        let window = Arc::new(ProducerWindow::new(100));
        window.increase(100);

        let mut blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.wait_for_space().await })
        };
        assert!(
            timeout(Duration::from_millis(50), &mut blocked)
                .await
                .is_err()
        );

        window.decrease(40);
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("waiter should wake after the window shrinks")
            .expect("waiter task should not panic");
        assert_eq!(window.usage(), 60);
    }
}
