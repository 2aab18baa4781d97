//! Inbound dispatch pipeline, rollback, and transport-interrupt clearing.

use std::sync::atomic::Ordering;

use tokio::time::Duration;

use super::{MessageConsumer, ReceivedMessage, ack::message_id_of};
use crate::{
    command::{AckType, MessageDispatch},
    error::Result,
    policy::AckMode,
};

enum RollbackOutcome {
    Nothing,
    Poison(crate::command::MessageAck),
    Redeliver {
        redelivered_ack: Option<crate::command::MessageAck>,
        requeue: Vec<MessageDispatch>,
        delay: Duration,
    },
}

impl MessageConsumer {
    /// Deliver one inbound dispatch, invoked on the session executor.
    ///
    /// With a listener attached and the channel running the message is
    /// consumed synchronously here; otherwise it is buffered for a
    /// synchronous receiver. A pending transport-interrupt clear is applied
    /// first so stale deliveries never cross the reconnect.
    pub(crate) async fn dispatch(&self, dispatch: MessageDispatch) {
        let listener = self.listener();
        let _guard = self.dispatch_lock.lock().await;

        if self.clear_dispatch_list.swap(false, Ordering::SeqCst) {
            self.unconsumed.clear();
            let mut delivery = self.delivery.lock();
            if delivery
                .pending_ack
                .as_ref()
                .is_some_and(|ack| ack.ack_type == AckType::Delivered)
            {
                // A delivered ack is out of sync with the broker after a
                // reconnect; consumed acks must still go out.
                delivery.pending_ack = None;
            }
        }

        if self.unconsumed.is_closed() {
            return;
        }

        match listener {
            Some(listener) if self.unconsumed.is_running() => {
                let Some(message) = dispatch.message.clone() else {
                    return;
                };
                if let Err(error) = self.before_message_is_consumed(&dispatch).await {
                    log::error!("failed to record delivery: {error}");
                    return;
                }
                let expired = !self.ignore_expiration && message.is_expired();
                let mut listener_error = None;
                if !expired {
                    let received = ReceivedMessage::new(message, self.acknowledger());
                    if let Err(error) = listener.on_message(received).await {
                        listener_error = Some(error);
                    }
                }
                match listener_error {
                    Some(error) if self.redelivers_on_listener_error() => {
                        log::warn!("listener failed; scheduling redelivery: {error}");
                        // The channel order lock is already held by this
                        // dispatch.
                        self.rollback_locked().await;
                    }
                    Some(error) => {
                        // Client-ack and transacted sessions advance past the
                        // failed message; the application decides at its ack
                        // or commit point.
                        log::warn!("listener failed; treating delivery as consumed: {error}");
                        self.session.report_async_error(&format!(
                            "listener failed for consumer {}: {error}",
                            self.info.consumer_id
                        ));
                        self.after_message_is_consumed(&dispatch, false).await;
                    }
                    None => self.after_message_is_consumed(&dispatch, expired).await,
                }
            }
            _ => self.unconsumed.enqueue(dispatch),
        }
    }

    fn redelivers_on_listener_error(&self) -> bool {
        matches!(
            self.ack_mode,
            AckMode::AutoAcknowledge | AckMode::DupsOkAcknowledge | AckMode::IndividualAcknowledge
        )
    }

    /// Bookkeeping before the application sees a message.
    pub(crate) async fn before_message_is_consumed(
        &self,
        dispatch: &MessageDispatch,
    ) -> Result<()> {
        {
            let mut delivery = self.delivery.lock();
            if let Some(message_id) = message_id_of(dispatch) {
                delivery.last_delivered_sequence_id = message_id.broker_sequence_id;
            }
            if !self.auto_ack_batch {
                delivery.dispatched.push_front(dispatch.clone());
            }
        }
        if !self.auto_ack_batch && self.ack_mode.is_transacted() {
            self.ack_later(dispatch, AckType::Delivered).await?;
        }
        Ok(())
    }

    /// Bookkeeping after the application saw (or skipped) a message.
    pub(crate) async fn after_message_is_consumed(
        &self,
        dispatch: &MessageDispatch,
        message_expired: bool,
    ) {
        if self.unconsumed.is_closed() {
            return;
        }
        if message_expired {
            self.delivery.lock().remove_dispatch(dispatch);
            if let Err(error) = self.ack_later(dispatch, AckType::Delivered).await {
                log::warn!("failed to ack expired message: {error}");
            }
            return;
        }
        if self.ack_mode.is_transacted() {
            return;
        }
        if self.auto_ack_each {
            self.flush_consumed_acks().await;
        } else if self.auto_ack_batch {
            if let Err(error) = self.ack_later(dispatch, AckType::Consumed).await {
                log::warn!("failed to batch consumed ack: {error}");
            }
        } else if let Err(error) = self.ack_later(dispatch, AckType::Delivered).await {
            log::warn!("failed to send delivered ack: {error}");
        }
    }

    /// Auto-ack-each: consume everything dispatched, single-flight.
    async fn flush_consumed_acks(&self) {
        if self
            .delivering_acks
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let ack = {
            let mut delivery = self.delivery.lock();
            match delivery.make_ack_for_all(
                AckType::Consumed,
                &self.info.consumer_id,
                &self.info.destination,
            ) {
                Some(ack) => {
                    let count = i64::from(ack.message_count);
                    delivery.dispatched.clear();
                    delivery.delivered_counter = (delivery.delivered_counter - count).max(0);
                    delivery.additional_window_size =
                        (delivery.additional_window_size - count).max(0);
                    Some(ack)
                }
                None => None,
            }
        };
        if let Some(ack) = ack {
            if let Err(error) = self.session.send_ack(ack, false).await {
                log::warn!("failed to send consumed ack: {error}");
            }
        }
        self.delivering_acks.store(false, Ordering::SeqCst);
    }

    /// Undo every outstanding delivery, called on transaction rollback and on
    /// listener failure in the redelivering ack modes.
    ///
    /// Messages past the redelivery limit are poisoned and dropped;
    /// otherwise the batch is pushed back to the head of the channel in its
    /// original order, optionally behind a redelivery delay.
    pub(crate) async fn rollback(&self) {
        let _guard = self.dispatch_lock.lock().await;
        self.rollback_locked().await;
    }

    /// Rollback body, entered with the channel order lock held.
    async fn rollback_locked(&self) {
        let outcome = {
            let mut delivery = self.delivery.lock();
            delivery.synchronization_registered = false;
            if delivery.dispatched.is_empty() {
                RollbackOutcome::Nothing
            } else {
                let previous_rollbacks = delivery
                    .dispatched
                    .front()
                    .and_then(|dispatch| dispatch.message.as_ref())
                    .map_or(0, |message| message.redelivery_counter);
                delivery.redelivery_delay =
                    self.redelivery_policy.redelivery_delay(previous_rollbacks);

                for dispatch in delivery.dispatched.iter_mut() {
                    if let Some(message) = dispatch.message.as_mut() {
                        message.on_rollback();
                        dispatch.redelivery_counter = message.redelivery_counter;
                    }
                }
                let rollbacks = previous_rollbacks + 1;
                let count = delivery.dispatched.len() as i64;

                if self.redelivery_policy.is_exhausted(rollbacks) {
                    let ack = delivery.make_ack_for_all(
                        AckType::Poison,
                        &self.info.consumer_id,
                        &self.info.destination,
                    );
                    delivery.additional_window_size =
                        (delivery.additional_window_size - count).max(0);
                    delivery.delivered_counter = (delivery.delivered_counter - count).max(0);
                    delivery.redelivery_delay = Duration::ZERO;
                    delivery.dispatched.clear();
                    match ack {
                        Some(ack) => RollbackOutcome::Poison(ack),
                        None => RollbackOutcome::Nothing,
                    }
                } else {
                    let redelivered_ack = if previous_rollbacks > 0 {
                        delivery.make_ack_for_all(
                            AckType::Redelivered,
                            &self.info.consumer_id,
                            &self.info.destination,
                        )
                    } else {
                        None
                    };
                    let requeue: Vec<MessageDispatch> =
                        delivery.dispatched.drain(..).collect();
                    delivery.delivered_counter = (delivery.delivered_counter - count).max(0);
                    RollbackOutcome::Redeliver {
                        redelivered_ack,
                        requeue,
                        delay: delivery.redelivery_delay,
                    }
                }
            }
        };

        match outcome {
            RollbackOutcome::Nothing => return,
            RollbackOutcome::Poison(ack) => {
                if let Err(error) = self.session.send_ack(ack, true).await {
                    log::warn!("failed to send poison ack: {error}");
                }
            }
            RollbackOutcome::Redeliver {
                redelivered_ack,
                requeue,
                delay,
            } => {
                // The broker must learn we saw these before they reappear.
                if let Some(ack) = redelivered_ack {
                    if let Err(error) = self.session.send_ack(ack, true).await {
                        log::warn!("failed to send redelivered ack: {error}");
                    }
                }
                self.unconsumed.stop();
                // Front of the dispatched list is the newest delivery, so
                // head-enqueueing in iteration order restores the original
                // order at the head of the channel.
                for dispatch in requeue {
                    self.unconsumed.enqueue_first(dispatch);
                }
                if delay > Duration::ZERO && !self.unconsumed.is_closed() {
                    self.schedule_redelivery_start(delay);
                } else {
                    self.restart_after_rollback();
                }
            }
        }
    }

    fn restart_after_rollback(&self) {
        if self.started.load(Ordering::SeqCst) {
            self.unconsumed.start();
        }
        if self.listener().is_some() {
            if let Err(error) = self.session.redispatch(&self.unconsumed) {
                log::warn!("failed to redispatch after rollback: {error}");
            }
        }
        self.session.wakeup_executor();
    }

    fn schedule_redelivery_start(&self, delay: Duration) {
        let token = self.redelivery_guard.child_token();
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(consumer) = weak.upgrade() {
                        consumer.restart_after_rollback();
                    }
                }
            }
        });
    }

    /// Flag the consumer for clearing when the transport is reconnecting.
    pub(crate) fn in_progress_clear_required(&self) {
        self.in_progress_clear_required.store(true, Ordering::SeqCst);
        self.clear_dispatch_list.store(true, Ordering::SeqCst);
    }

    /// Drop in-flight messages after a transport interruption.
    ///
    /// Runs on a spawned worker so it never deadlocks with an in-flight
    /// dispatch holding the channel order lock. Stale delivered acks are
    /// invalidated; dispatched messages stay, because the broker will
    /// redeliver anything unacked and duplicates are filtered upstream.
    pub(crate) async fn clear_messages_in_progress(&self) {
        if !self.in_progress_clear_required.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.dispatch_lock.lock().await;
        if self.in_progress_clear_required.swap(false, Ordering::SeqCst) {
            self.unconsumed.clear();
            self.clear_dispatch_list.store(false, Ordering::SeqCst);
            {
                let mut delivery = self.delivery.lock();
                if delivery
                    .pending_ack
                    .as_ref()
                    .is_some_and(|ack| ack.ack_type == AckType::Delivered)
                {
                    delivery.pending_ack = None;
                }
            }
            self.session.transport_interruption_processing_complete().await;
        }
    }
}
