//! Per-session dispatch pump.
//!
//! Each session owns one executor so listener invocations for that session
//! are serialized, as the messaging contract requires. The pump drains an
//! ordered queue of inbound dispatches, resolves the target consumer, and
//! hands the dispatch over; redispatch after rollback or listener
//! installation prepends to the queue so original delivery order is
//! preserved.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    command::{ConsumerId, MessageDispatch},
    consumer::MessageConsumer,
};

/// Dispatches delivered between cooperative yields, so one busy session
/// cannot starve the runtime.
const YIELD_INTERVAL: u64 = 1000;

struct Pump {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Single-consumer-at-a-time dispatch pump owned by a session.
pub(crate) struct SessionExecutor {
    queue: Mutex<VecDeque<MessageDispatch>>,
    notify: Notify,
    consumers: Weak<DashMap<ConsumerId, Arc<MessageConsumer>>>,
    pump: Mutex<Option<Pump>>,
}

impl SessionExecutor {
    pub(crate) fn new(consumers: Weak<DashMap<ConsumerId, Arc<MessageConsumer>>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers,
            pump: Mutex::new(None),
        }
    }

    /// Append a dispatch to the tail of the pump queue.
    pub(crate) fn execute(&self, dispatch: MessageDispatch) {
        self.queue.lock().push_back(dispatch);
        self.notify.notify_waiters();
    }

    /// Prepend a dispatch so it is delivered before everything queued.
    pub(crate) fn execute_first(&self, dispatch: MessageDispatch) {
        self.queue.lock().push_front(dispatch);
        self.notify.notify_waiters();
    }

    /// Spawn the pump task if it is not already running.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(Arc::clone(self), token.clone()));
        *pump = Some(Pump { token, handle });
    }

    /// Stop the pump, waiting up to `timeout` for the in-flight dispatch to
    /// finish. `None` waits indefinitely; on timeout the pump is aborted.
    pub(crate) async fn stop(&self, timeout: Option<Duration>) {
        let Some(Pump { token, handle }) = self.pump.lock().take() else {
            return;
        };
        token.cancel();
        self.notify.notify_waiters();
        let mut handle = handle;
        match timeout {
            None => {
                let _ = (&mut handle).await;
            }
            Some(timeout) => {
                if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                    log::warn!("session executor did not stop within {timeout:?}; aborting");
                    handle.abort();
                }
            }
        }
    }

    /// Whether the pump task is alive.
    pub(crate) fn is_running(&self) -> bool { self.pump.lock().is_some() }

    /// Wake the pump without queueing anything, e.g. after a channel start.
    pub(crate) fn wakeup(&self) { self.notify.notify_waiters(); }

    /// Drop every queued dispatch; used while clearing a transport
    /// interruption.
    pub(crate) fn clear(&self) { self.queue.lock().clear(); }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut delivered: u64 = 0;
        loop {
            if token.is_cancelled() {
                return;
            }
            let next = self.queue.lock().pop_front();
            match next {
                Some(dispatch) => {
                    self.deliver(dispatch).await;
                    delivered += 1;
                    if delivered % YIELD_INTERVAL == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                None => {
                    let notified = self.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !self.queue.lock().is_empty() {
                        continue;
                    }
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return,
                        () = notified => {}
                    }
                }
            }
        }
    }

    async fn deliver(&self, dispatch: MessageDispatch) {
        let Some(consumers) = self.consumers.upgrade() else {
            return;
        };
        let consumer = consumers
            .get(&dispatch.consumer_id)
            .map(|entry| Arc::clone(entry.value()));
        drop(consumers);
        match consumer {
            Some(consumer) => consumer.dispatch(dispatch).await,
            // Consumer removed mid-flight; the broker will redeliver if the
            // messages were never acked.
            None => log::debug!(
                "dropping dispatch for unknown consumer {}",
                dispatch.consumer_id
            ),
        }
    }
}
