//! Per-session transaction lifecycle.
//!
//! The context owns the current transaction id and the set of registered
//! synchronizations. Work performed inside a transacted session starts the
//! transaction lazily: the first ack or send calls [`TransactionContext::begin`],
//! which sends `TransactionInfo{Begin}` before anything that carries the
//! transaction id, so no ack ever precedes its begin on the wire.
//!
//! Synchronizations are a closed set of behaviours rather than an open
//! callback hierarchy: each variant knows what to do at the three phase
//! points (before end, after commit, after rollback).

use std::sync::{
    Weak,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Mutex;

use crate::{
    command::{Command, TransactionId, TransactionInfo, TransactionType},
    connection::ConnectionHandle,
    consumer::MessageConsumer,
    error::{Result, WirebusError},
};

/// Transaction-lifecycle participant registered with a session's context.
///
/// Consumers register `ConsumerAck` on their first transacted delivery so
/// acks are issued at the commit boundary; a close issued mid-transaction
/// registers `DeferredClose` so teardown happens only once the transaction
/// resolves.
pub(crate) enum Synchronization {
    ConsumerAck(Weak<MessageConsumer>),
    DeferredClose(Weak<MessageConsumer>),
}

impl Synchronization {
    /// Whether `other` refers to the same behaviour on the same object, so
    /// registration stays idempotent.
    fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ConsumerAck(a), Self::ConsumerAck(b))
            | (Self::DeferredClose(a), Self::DeferredClose(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Phase one: runs before the commit or rollback command is sent.
    ///
    /// `committing` distinguishes the two outcomes: consumed acks are only
    /// issued when the transaction is about to commit; a rollback must not
    /// acknowledge anything because the broker will redeliver.
    async fn before_end(&self, transaction_id: &TransactionId, committing: bool) -> Result<()> {
        match self {
            Self::ConsumerAck(consumer) if committing => match consumer.upgrade() {
                Some(consumer) => {
                    consumer
                        .acknowledge_with(Some(transaction_id.clone()))
                        .await
                }
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    async fn after_commit(&self) -> Result<()> {
        match self {
            Self::ConsumerAck(consumer) => {
                if let Some(consumer) = consumer.upgrade() {
                    consumer.commit();
                }
                Ok(())
            }
            Self::DeferredClose(consumer) => match consumer.upgrade() {
                Some(consumer) => consumer.do_close().await,
                None => Ok(()),
            },
        }
    }

    async fn after_rollback(&self) -> Result<()> {
        match self {
            Self::ConsumerAck(consumer) => {
                if let Some(consumer) = consumer.upgrade() {
                    consumer.rollback().await;
                }
                Ok(())
            }
            Self::DeferredClose(consumer) => match consumer.upgrade() {
                Some(consumer) => consumer.do_close().await,
                None => Ok(()),
            },
        }
    }
}

#[derive(Default)]
struct TxState {
    transaction_id: Option<TransactionId>,
    synchronizations: Vec<Synchronization>,
}

/// Binds a session's consumer and producer activity to broker transactions.
pub(crate) struct TransactionContext {
    connection: ConnectionHandle,
    state: Mutex<TxState>,
    in_local: AtomicBool,
}

impl TransactionContext {
    pub(crate) fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            state: Mutex::new(TxState::default()),
            in_local: AtomicBool::new(false),
        }
    }

    /// Start a transaction if none is active; idempotent inside one.
    ///
    /// Sends `TransactionInfo{Begin}` one-way before recording the id, so
    /// every later command carrying the id follows the begin on the wire.
    pub(crate) async fn begin(&self) -> Result<TransactionId> {
        let mut state = self.state.lock().await;
        if let Some(id) = &state.transaction_id {
            return Ok(id.clone());
        }
        let id = self.connection.next_transaction_id()?;
        self.connection
            .oneway(Command::TransactionInfo(TransactionInfo {
                transaction_id: id.clone(),
                transaction_type: TransactionType::Begin,
            }))
            .await?;
        state.transaction_id = Some(id.clone());
        self.in_local.store(true, Ordering::SeqCst);
        Ok(id)
    }

    /// The active transaction id, if a transaction has begun.
    pub(crate) async fn transaction_id(&self) -> Option<TransactionId> {
        self.state.lock().await.transaction_id.clone()
    }

    /// Whether a local transaction is currently active.
    pub(crate) fn in_local_transaction(&self) -> bool { self.in_local.load(Ordering::SeqCst) }

    /// Register a synchronization; idempotent for the same object.
    pub(crate) async fn add_synchronization(&self, synchronization: Synchronization) {
        let mut state = self.state.lock().await;
        if !state
            .synchronizations
            .iter()
            .any(|existing| existing.matches(&synchronization))
        {
            state.synchronizations.push(synchronization);
        }
    }

    /// Commit the active transaction.
    ///
    /// Runs `before_end` on every synchronization in registration order,
    /// sends `CommitOnePhase` synchronously, then runs `after_commit`. A
    /// broker rejection runs `after_rollback` instead and surfaces as
    /// [`WirebusError::TransactionRolledBack`].
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] when no transaction is
    /// active.
    pub(crate) async fn commit(&self) -> Result<()> {
        // The lock is released before any phase callback runs: callbacks
        // reach back into consumers whose dispatch pipeline may itself be
        // starting a transaction.
        let (id, synchronizations) = self.take_transaction().await?;

        for synchronization in &synchronizations {
            if let Err(error) = synchronization.before_end(&id, true).await {
                log::error!("transaction synchronization failed in before_end: {error}");
            }
        }

        let outcome = self
            .connection
            .sync_request(
                Command::TransactionInfo(TransactionInfo {
                    transaction_id: id,
                    transaction_type: TransactionType::CommitOnePhase,
                }),
                None,
            )
            .await;

        match outcome {
            Ok(_) => {
                for synchronization in &synchronizations {
                    if let Err(error) = synchronization.after_commit().await {
                        log::error!("transaction synchronization failed in after_commit: {error}");
                    }
                }
                Ok(())
            }
            Err(cause) => {
                for synchronization in &synchronizations {
                    if let Err(error) = synchronization.after_rollback().await {
                        log::error!(
                            "transaction synchronization failed in after_rollback: {error}"
                        );
                    }
                }
                Err(WirebusError::TransactionRolledBack(Box::new(cause)))
            }
        }
    }

    /// Roll back the active transaction.
    ///
    /// Runs `before_end`, sends `Rollback` synchronously, and always runs
    /// `after_rollback` so consumers re-enqueue their dispatched messages.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] when no transaction is
    /// active.
    pub(crate) async fn rollback(&self) -> Result<()> {
        let (id, synchronizations) = self.take_transaction().await?;

        for synchronization in &synchronizations {
            if let Err(error) = synchronization.before_end(&id, false).await {
                log::error!("transaction synchronization failed in before_end: {error}");
            }
        }

        let outcome = self
            .connection
            .sync_request(
                Command::TransactionInfo(TransactionInfo {
                    transaction_id: id,
                    transaction_type: TransactionType::Rollback,
                }),
                None,
            )
            .await;

        for synchronization in &synchronizations {
            if let Err(error) = synchronization.after_rollback().await {
                log::error!("transaction synchronization failed in after_rollback: {error}");
            }
        }

        outcome.map(|_| ())
    }

    /// Detach the active transaction: later transacted work starts a fresh
    /// one while the phase callbacks for this one run unlocked.
    async fn take_transaction(&self) -> Result<(TransactionId, Vec<Synchronization>)> {
        let mut state = self.state.lock().await;
        let Some(id) = state.transaction_id.take() else {
            return Err(WirebusError::InvalidOperation(
                "no transaction is currently active",
            ));
        };
        let synchronizations = std::mem::take(&mut state.synchronizations);
        self.in_local.store(false, Ordering::SeqCst);
        Ok((id, synchronizations))
    }
}
