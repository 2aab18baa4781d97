//! The consumer's acknowledgement engine.
//!
//! Five regimes share one mechanism: a coalesced `pending_ack` plus the
//! `dispatched` list of deliveries the broker still considers outstanding.
//! Coalescing never reorders: a consumed ack range always covers a
//! contiguous prefix of the dispatched messages. Delivered acks are optional
//! prefetch-credit hints and may be dropped when superseded; consumed,
//! poison, and redelivered acks must reach the broker, so a pending ack of
//! those kinds is flushed before being replaced by a different kind.

use std::{collections::VecDeque, sync::atomic::Ordering};

use tokio::time::Duration;

use super::MessageConsumer;
use crate::{
    command::{AckType, ConsumerId, MessageAck, MessageDispatch, MessageId, TransactionId},
    destination::Destination,
    error::Result,
    transaction::Synchronization,
};

/// Mutable delivery bookkeeping, guarded by the consumer's delivery lock.
pub(crate) struct DeliveryState {
    /// Deliveries not yet acked by the broker; front is the most recent.
    pub(crate) dispatched: VecDeque<MessageDispatch>,
    /// At most one unsent, coalesced ack.
    pub(crate) pending_ack: Option<MessageAck>,
    pub(crate) delivered_counter: i64,
    pub(crate) additional_window_size: i64,
    pub(crate) last_delivered_sequence_id: i64,
    pub(crate) redelivery_delay: Duration,
    pub(crate) synchronization_registered: bool,
}

impl DeliveryState {
    pub(crate) fn new() -> Self {
        Self {
            dispatched: VecDeque::new(),
            pending_ack: None,
            delivered_counter: 0,
            additional_window_size: 0,
            last_delivered_sequence_id: 0,
            redelivery_delay: Duration::ZERO,
            synchronization_registered: false,
        }
    }

    /// Fold `ack` into the pending ack.
    ///
    /// Same-kind acks extend the range; a pending delivered ack is dropped
    /// silently when superseded; any other pending kind is returned so the
    /// caller sends it before the replacement takes its slot.
    pub(crate) fn coalesce(&mut self, mut ack: MessageAck) -> Option<MessageAck> {
        match self.pending_ack.take() {
            None => {
                self.pending_ack = Some(ack);
                None
            }
            Some(old) if old.ack_type == ack.ack_type => {
                ack.first_message_id = old.first_message_id;
                ack.message_count += old.message_count;
                self.pending_ack = Some(ack);
                None
            }
            Some(old) if old.ack_type == AckType::Delivered => {
                self.pending_ack = Some(ack);
                None
            }
            Some(old) => {
                self.pending_ack = Some(ack);
                Some(old)
            }
        }
    }

    /// Whether the half-prefetch heuristic says the pending ack should go
    /// out now.
    pub(crate) fn should_flush(&self, prefetch_size: i32) -> bool {
        prefetch_size > 0
            && 2 * (self.delivered_counter - self.additional_window_size)
                >= i64::from(prefetch_size)
    }

    /// Take the pending ack for sending and reset the credit window.
    pub(crate) fn take_flush(&mut self) -> Option<MessageAck> {
        let ack = self.pending_ack.take()?;
        self.delivered_counter = 0;
        self.additional_window_size = 0;
        Some(ack)
    }

    /// Build an ack of `ack_type` spanning every dispatched message, oldest
    /// to newest. `None` when nothing is outstanding.
    pub(crate) fn make_ack_for_all(
        &self,
        ack_type: AckType,
        consumer_id: &ConsumerId,
        destination: &Destination,
    ) -> Option<MessageAck> {
        let newest = self.dispatched.front()?;
        let oldest = self.dispatched.back()?;
        Some(MessageAck {
            ack_type,
            consumer_id: consumer_id.clone(),
            destination: destination.clone(),
            first_message_id: message_id_of(oldest),
            last_message_id: message_id_of(newest),
            message_count: self.dispatched.len() as i32,
            transaction_id: None,
        })
    }

    /// Remove the dispatch for `message_id` and build its one-message ack.
    pub(crate) fn take_individual(
        &mut self,
        consumer_id: &ConsumerId,
        destination: &Destination,
        message_id: &MessageId,
    ) -> Option<MessageAck> {
        let position = self
            .dispatched
            .iter()
            .position(|dispatch| message_id_of(dispatch).as_ref() == Some(message_id))?;
        self.dispatched.remove(position);
        Some(MessageAck {
            ack_type: AckType::Individual,
            consumer_id: consumer_id.clone(),
            destination: destination.clone(),
            first_message_id: Some(message_id.clone()),
            last_message_id: Some(message_id.clone()),
            message_count: 1,
            transaction_id: None,
        })
    }

    /// Drop the dispatch matching `dispatch` from the outstanding list.
    pub(crate) fn remove_dispatch(&mut self, dispatch: &MessageDispatch) {
        let target = message_id_of(dispatch);
        if let Some(position) = self
            .dispatched
            .iter()
            .position(|candidate| message_id_of(candidate) == target)
        {
            self.dispatched.remove(position);
        }
    }
}

pub(crate) fn message_id_of(dispatch: &MessageDispatch) -> Option<MessageId> {
    dispatch
        .message
        .as_ref()
        .and_then(|message| message.message_id.clone())
}

impl MessageConsumer {
    /// Record a delivery for later acknowledgement, keeping prefetch credit
    /// flowing.
    ///
    /// In a transacted session this also starts the transaction (the begin
    /// always precedes the first ack on the wire) and registers the
    /// consumer's commit/rollback synchronization once per transaction.
    pub(crate) async fn ack_later(
        &self,
        dispatch: &MessageDispatch,
        ack_type: AckType,
    ) -> Result<()> {
        let mut transaction_id = None;
        if self.ack_mode.is_transacted() {
            transaction_id = Some(self.session.ensure_transaction_started().await?);
            let register = {
                let mut delivery = self.delivery.lock();
                !std::mem::replace(&mut delivery.synchronization_registered, true)
            };
            if register {
                self.session
                    .register_synchronization(Synchronization::ConsumerAck(self.weak.clone()))
                    .await?;
            }
        }

        let (immediate, flush) = {
            let mut delivery = self.delivery.lock();
            delivery.delivered_counter += 1;
            let message_id = message_id_of(dispatch);
            let ack = MessageAck {
                ack_type,
                consumer_id: self.info.consumer_id.clone(),
                destination: dispatch.destination.clone(),
                first_message_id: message_id.clone(),
                last_message_id: message_id,
                message_count: 1,
                transaction_id,
            };
            let immediate = delivery.coalesce(ack);
            let flush = if delivery.should_flush(self.info.prefetch_size) {
                delivery.take_flush()
            } else {
                None
            };
            (immediate, flush)
        };

        if let Some(ack) = immediate {
            self.session.send_ack(ack, true).await?;
        }
        if let Some(ack) = flush {
            self.session.send_ack(ack, true).await?;
        }
        Ok(())
    }

    /// Acknowledge everything delivered so far as consumed.
    ///
    /// This is the client-ack API and the transacted before-end hook. The
    /// ack is sent synchronously; outside a transaction the dispatched list
    /// is cleared, inside one it stays until commit or rollback resolves it.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`](crate::WirebusError::Disposed)
    /// after close, or the transport error from the ack send.
    pub async fn acknowledge(&self) -> Result<()> {
        self.check_closed()?;
        let transaction_id = if self.ack_mode.is_transacted() {
            self.session.transaction_id().await
        } else {
            None
        };
        self.acknowledge_with(transaction_id).await
    }

    pub(crate) async fn acknowledge_with(
        &self,
        transaction_id: Option<TransactionId>,
    ) -> Result<()> {
        let transacted = self.ack_mode.is_transacted();
        let ack = {
            let mut delivery = self.delivery.lock();
            let Some(mut ack) = delivery.make_ack_for_all(
                AckType::Consumed,
                &self.info.consumer_id,
                &self.info.destination,
            ) else {
                return Ok(());
            };
            ack.transaction_id = transaction_id;
            let count = i64::from(ack.message_count);
            delivery.pending_ack = None;
            delivery.delivered_counter = (delivery.delivered_counter - count).max(0);
            delivery.additional_window_size =
                (delivery.additional_window_size - count).max(0);
            if !transacted {
                delivery.dispatched.clear();
            }
            ack
        };
        self.session.send_ack(ack, false).await
    }

    /// Flush retained acks under the single-flight guard.
    ///
    /// Auto-ack-each consumers consume everything still dispatched; other
    /// modes only flush a pending consumed ack. A failed send retains the
    /// ack for the next opportunity.
    pub(crate) async fn deliver_acks(&self) {
        if self
            .delivering_acks
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let ack = {
            let mut delivery = self.delivery.lock();
            if self.auto_ack_each {
                match delivery.make_ack_for_all(
                    AckType::Consumed,
                    &self.info.consumer_id,
                    &self.info.destination,
                ) {
                    Some(ack) => {
                        let count = i64::from(ack.message_count);
                        delivery.dispatched.clear();
                        delivery.delivered_counter =
                            (delivery.delivered_counter - count).max(0);
                        delivery.additional_window_size =
                            (delivery.additional_window_size - count).max(0);
                        Some(ack)
                    }
                    None => delivery.pending_ack.take(),
                }
            } else if delivery
                .pending_ack
                .as_ref()
                .is_some_and(|ack| ack.ack_type == AckType::Consumed)
            {
                delivery.pending_ack.take()
            } else {
                None
            }
        };
        if let Some(ack) = ack {
            if let Err(error) = self.session.send_ack(ack.clone(), true).await {
                log::warn!("ack delivery failed; retaining for retry: {error}");
                self.delivery.lock().pending_ack = Some(ack);
            }
        }
        self.delivering_acks.store(false, Ordering::SeqCst);
    }

    /// Commit bookkeeping: the before-end ack already covered everything, so
    /// only the local state resets.
    pub(crate) fn commit(&self) {
        let mut delivery = self.delivery.lock();
        delivery.dispatched.clear();
        delivery.redelivery_delay = Duration::ZERO;
        delivery.synchronization_registered = false;
    }
}
