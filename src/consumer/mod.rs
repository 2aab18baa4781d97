//! Message consumer runtime.
//!
//! A consumer turns the broker's asynchronous dispatch stream into ordered,
//! acknowledged delivery. Inbound dispatches land in the consumer's
//! [`DispatchChannel`]; synchronous receivers dequeue from it directly, while
//! an attached listener is driven by the session executor. The ack engine in
//! [`ack`](self) keeps the broker's prefetch credit flowing and guarantees
//! that consumed, poison, and redelivered acks always reach the broker, while
//! delivered acks remain best-effort credit hints.
//!
//! The implementation is split by behaviour: this file owns construction,
//! the receive API, listener management, and lifecycle; `dispatch.rs` owns
//! the inbound pipeline, rollback, and transport-interrupt clearing; `ack.rs`
//! owns the ack engine.

mod ack;
mod dispatch;

use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use self::ack::DeliveryState;
use crate::{
    channel::DispatchChannel,
    command::{Command, ConsumerInfo, Message, MessageId, MessagePull, RemoveInfo, RemovedObject},
    error::{Result, WirebusError},
    policy::{AckMode, RedeliveryPolicy},
    session::SessionHandle,
};

/// Application callback driven by the session executor.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Handle one delivery. Returning an error invokes the per-ack-mode
    /// failure policy: auto, dups-ok, and individual modes mark the message
    /// for redelivery; client-ack and transacted sessions treat it as
    /// consumed and report the error to the connection.
    async fn on_message(
        &self,
        message: ReceivedMessage,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A delivered message plus the capability to acknowledge it.
pub struct ReceivedMessage {
    message: Message,
    acknowledger: Acknowledger,
}

impl ReceivedMessage {
    pub(crate) fn new(message: Message, acknowledger: Acknowledger) -> Self {
        Self {
            message,
            acknowledger,
        }
    }

    #[must_use]
    pub fn message(&self) -> &Message { &self.message }

    #[must_use]
    pub fn body(&self) -> &Bytes { &self.message.body }

    #[must_use]
    pub fn is_redelivered(&self) -> bool { self.message.redelivered }

    /// Acknowledge per the session's ack mode.
    ///
    /// In client-ack mode this acknowledges every message delivered to the
    /// consumer so far; in individual-ack mode, exactly this message. Auto
    /// and transacted modes manage acknowledgement themselves, so the call
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] if the owning consumer was closed.
    pub async fn acknowledge(&self) -> Result<()> {
        let consumer = || {
            self.acknowledger
                .consumer
                .upgrade()
                .ok_or(WirebusError::Disposed("consumer"))
        };
        match self.acknowledger.mode {
            AckMode::ClientAcknowledge => consumer()?.acknowledge().await,
            AckMode::IndividualAcknowledge => {
                let Some(message_id) = &self.message.message_id else {
                    return Ok(());
                };
                consumer()?.acknowledge_individual(message_id).await
            }
            _ => Ok(()),
        }
    }
}

/// Ack capability carried by every [`ReceivedMessage`].
#[derive(Clone)]
pub(crate) struct Acknowledger {
    mode: AckMode,
    consumer: Weak<MessageConsumer>,
}

/// Client-side consumer bound to one broker subscription.
pub struct MessageConsumer {
    pub(crate) info: ConsumerInfo,
    pub(crate) session: SessionHandle,
    pub(crate) ack_mode: AckMode,
    /// Consumed ack per delivery: auto-ack, or dups-ok on a queue.
    pub(crate) auto_ack_each: bool,
    /// Coalesced consumed acks: dups-ok on a topic.
    pub(crate) auto_ack_batch: bool,
    pub(crate) unconsumed: DispatchChannel,
    /// Serializes the dispatch pipeline against transport-interrupt clearing
    /// and rollback. Always acquired before the delivery lock.
    pub(crate) dispatch_lock: tokio::sync::Mutex<()>,
    pub(crate) delivery: Mutex<DeliveryState>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    pub(crate) delivering_acks: AtomicBool,
    pub(crate) started: AtomicBool,
    disposed: AtomicBool,
    pub(crate) in_progress_clear_required: AtomicBool,
    pub(crate) clear_dispatch_list: AtomicBool,
    failure: Mutex<Option<String>>,
    pub(crate) ignore_expiration: bool,
    pub(crate) redelivery_policy: RedeliveryPolicy,
    /// Cancelled on shutdown so a scheduled redelivery start never outlives
    /// the consumer.
    pub(crate) redelivery_guard: CancellationToken,
    pub(crate) weak: Weak<MessageConsumer>,
}

impl MessageConsumer {
    pub(crate) fn new(
        session: SessionHandle,
        info: ConsumerInfo,
        ack_mode: AckMode,
        ignore_expiration: bool,
        redelivery_policy: RedeliveryPolicy,
        priority_supported: bool,
    ) -> Arc<Self> {
        let auto_ack_each = matches!(ack_mode, AckMode::AutoAcknowledge)
            || (matches!(ack_mode, AckMode::DupsOkAcknowledge) && info.destination.is_queue());
        let auto_ack_batch =
            matches!(ack_mode, AckMode::DupsOkAcknowledge) && info.destination.is_topic();
        let unconsumed = if priority_supported {
            DispatchChannel::priority()
        } else {
            DispatchChannel::fifo()
        };
        Arc::new_cyclic(|weak| Self {
            info,
            session,
            ack_mode,
            auto_ack_each,
            auto_ack_batch,
            unconsumed,
            dispatch_lock: tokio::sync::Mutex::new(()),
            delivery: Mutex::new(DeliveryState::new()),
            listener: RwLock::new(None),
            delivering_acks: AtomicBool::new(false),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            in_progress_clear_required: AtomicBool::new(false),
            clear_dispatch_list: AtomicBool::new(false),
            failure: Mutex::new(None),
            ignore_expiration,
            redelivery_policy,
            redelivery_guard: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    /// The broker-side subscription description.
    #[must_use]
    pub fn info(&self) -> &ConsumerInfo { &self.info }

    /// Highest broker sequence delivered so far.
    #[must_use]
    pub fn last_delivered_sequence_id(&self) -> i64 {
        self.delivery.lock().last_delivered_sequence_id
    }

    /// Messages delivered to the application but not yet acked at the
    /// broker.
    #[must_use]
    pub fn outstanding_deliveries(&self) -> usize { self.delivery.lock().dispatched.len() }

    /// The kind of the coalesced unsent ack, if one is pending.
    #[must_use]
    pub fn pending_ack_kind(&self) -> Option<crate::command::AckType> {
        self.delivery.lock().pending_ack.as_ref().map(|ack| ack.ack_type)
    }

    /// Receive the next message, waiting until one arrives or the consumer
    /// closes.
    ///
    /// With a prefetch of zero a `MessagePull` asking the broker to wait is
    /// sent first; the broker replies with a message or, once its own wait
    /// ends, an empty marker.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::ConnectionFailure`] if the connection failed
    /// while waiting, and [`WirebusError::InvalidOperation`] while a listener
    /// is attached.
    pub async fn receive(&self) -> Result<Option<ReceivedMessage>> {
        self.check_receivable()?;
        self.send_pull(0).await?;
        self.receive_dispatch(None).await
    }

    /// Receive the next message, waiting up to `timeout`.
    ///
    /// With a prefetch of zero the timeout is delegated to the broker via
    /// `MessagePull` and the call waits on the channel: the broker sends at
    /// most one message per pull and terminates an expired pull with an empty
    /// marker.
    ///
    /// # Errors
    ///
    /// As [`receive`](Self::receive).
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        self.check_receivable()?;
        if self.info.prefetch_size == 0 {
            self.send_pull(timeout.as_millis() as i64).await?;
            self.receive_dispatch(None).await
        } else {
            self.receive_dispatch(Some(timeout)).await
        }
    }

    /// Receive a message if one is immediately available.
    ///
    /// The zero-prefetch path sends a pull with a timeout of `-1`, asking the
    /// broker to reply immediately with a message or an empty marker.
    ///
    /// # Errors
    ///
    /// As [`receive`](Self::receive).
    pub async fn receive_no_wait(&self) -> Result<Option<ReceivedMessage>> {
        self.check_receivable()?;
        if self.info.prefetch_size == 0 {
            self.send_pull(-1).await?;
            self.receive_dispatch(None).await
        } else {
            self.receive_dispatch(Some(Duration::ZERO)).await
        }
    }

    /// Attach a listener, redispatching anything already buffered so order is
    /// preserved.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] for zero-prefetch consumers:
    /// pull-mode delivery cannot drive a push listener.
    pub async fn set_listener(&self, listener: Arc<dyn MessageListener>) -> Result<()> {
        self.check_closed()?;
        if self.info.prefetch_size == 0 {
            return Err(WirebusError::InvalidOperation(
                "a listener cannot be attached to a zero-prefetch consumer",
            ));
        }
        *self.listener.write() = Some(listener);
        self.session.stop_executor(None).await;
        self.session.redispatch(&self.unconsumed)?;
        self.session.start_executor()?;
        Ok(())
    }

    /// Detach the listener. Dispatches already queued on the executor may
    /// still fire.
    pub fn clear_listener(&self) { *self.listener.write() = None; }

    pub(crate) fn listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener.read().clone()
    }

    pub(crate) fn acknowledger(&self) -> Acknowledger {
        Acknowledger {
            mode: self.ack_mode,
            consumer: self.weak.clone(),
        }
    }

    /// Begin delivery: flush retained acks, start the channel, and wake the
    /// executor.
    pub(crate) async fn start(&self) {
        if self.unconsumed.is_closed() {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        self.deliver_acks().await;
        self.unconsumed.start();
        self.session.wakeup_executor();
    }

    /// Suspend delivery without discarding buffered dispatches.
    pub(crate) fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.unconsumed.stop();
    }

    /// Record an asynchronous connection failure for waiting receivers.
    pub(crate) fn set_failure(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        // Waiters observe the closed channel, then surface the failure.
        self.unconsumed.close();
    }

    /// Close the consumer.
    ///
    /// Inside an open transaction the close is deferred to the transaction
    /// boundary via a synchronization; otherwise the consumer shuts down and
    /// tells the broker immediately.
    pub async fn close(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.session.is_transacted() && self.session.in_local_transaction() {
            self.session
                .register_synchronization(crate::transaction::Synchronization::DeferredClose(
                    self.weak.clone(),
                ))
                .await?;
            return Ok(());
        }
        self.do_close().await
    }

    /// Shut down and send the broker the teardown command with the highest
    /// delivered sequence.
    pub(crate) async fn do_close(&self) -> Result<()> {
        self.shutdown().await;
        let last_delivered = self.last_delivered_sequence_id().max(0);
        self.session
            .oneway(Command::RemoveInfo(RemoveInfo {
                object: RemovedObject::Consumer(self.info.consumer_id.clone()),
                last_delivered_sequence_id: last_delivered,
            }))
            .await
    }

    /// Tear down local state: flush auto-acks, clear non-transacted
    /// dispatched messages, deregister, and close the channel.
    ///
    /// Used directly on session close, where the session's own teardown
    /// command covers its children.
    pub(crate) async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.redelivery_guard.cancel();
        self.deliver_acks().await;
        if !self.ack_mode.is_transacted() {
            self.delivery.lock().dispatched.clear();
        }
        self.session.remove_consumer(&self.info.consumer_id);
        self.unconsumed.close();
    }

    async fn send_pull(&self, timeout: i64) -> Result<()> {
        if self.info.prefetch_size == 0 && self.unconsumed.is_empty() {
            self.session
                .oneway(Command::MessagePull(MessagePull {
                    consumer_id: self.info.consumer_id.clone(),
                    destination: self.info.destination.clone(),
                    timeout,
                }))
                .await?;
        }
        Ok(())
    }

    /// Dequeue loop shared by the receive family.
    ///
    /// Expired dispatches are consumed implicitly (delivered-ack via the
    /// before/after hooks) and the wait continues against the original
    /// deadline. A dispatch with no message is the channel-closing wake or an
    /// exhausted pull and yields `None`.
    async fn receive_dispatch(&self, timeout: Option<Duration>) -> Result<Option<ReceivedMessage>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let Some(dispatch) = self.unconsumed.dequeue(remaining).await else {
                if let Some(reason) = self.failure.lock().clone() {
                    return Err(WirebusError::ConnectionFailure(reason));
                }
                return Ok(None);
            };
            let Some(message) = dispatch.message.clone() else {
                return Ok(None);
            };
            if !self.ignore_expiration && message.is_expired() {
                self.before_message_is_consumed(&dispatch).await?;
                self.after_message_is_consumed(&dispatch, true).await;
                continue;
            }
            self.before_message_is_consumed(&dispatch).await?;
            self.after_message_is_consumed(&dispatch, false).await;
            return Ok(Some(ReceivedMessage::new(message, self.acknowledger())));
        }
    }

    fn check_receivable(&self) -> Result<()> {
        self.check_closed()?;
        if self.listener.read().is_some() {
            return Err(WirebusError::InvalidOperation(
                "receive may not be called while a listener is attached",
            ));
        }
        Ok(())
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(WirebusError::Disposed("consumer"))
        } else {
            Ok(())
        }
    }
}

/// Per-message ack helper used by individual-ack mode.
impl MessageConsumer {
    pub(crate) async fn acknowledge_individual(&self, message_id: &MessageId) -> Result<()> {
        self.check_closed()?;
        let ack = self.delivery.lock().take_individual(
            &self.info.consumer_id,
            &self.info.destination,
            message_id,
        );
        match ack {
            Some(ack) => self.session.send_ack(ack, false).await,
            None => {
                log::debug!("individual ack for unknown message {message_id}; ignoring");
                Ok(())
            }
        }
    }
}
