//! Connection state tracking for reconnect replay.
//!
//! The tracker records every object the client registers at the broker so a
//! failover transport can re-create them after a reconnect. Restoration must
//! happen parent before child: connection info, then temporary destinations,
//! then sessions, then each session's producers and consumers, then active
//! transactions with their journalled commands. [`StateTracker::replay_commands`]
//! produces exactly that order.
//!
//! The tracker is write-mostly: the runtime feeds it the command stream it
//! sends, and reads happen only during reconnect.

mod connection;
mod session;
mod transaction;

use std::collections::HashMap;

use parking_lot::Mutex;

pub use connection::{ConnectionState, DEFAULT_SESSION_SUFFIX};
pub use session::{ConsumerState, ProducerState, SessionState};
pub use transaction::TransactionState;

use crate::{
    command::{
        Command,
        ConnectionId,
        ConnectionInfo,
        DestinationOperation,
        RemovedObject,
        TransactionInfo,
        TransactionType,
    },
    error::{Result, WirebusError},
};

/// In-memory tree of broker-side objects, keyed by connection.
#[derive(Debug, Default)]
pub struct StateTracker {
    connections: Mutex<HashMap<ConnectionId, ConnectionState>>,
}

impl StateTracker {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Record the effect of an outbound command on the state tree.
    ///
    /// Registration commands add nodes, `RemoveInfo` tears them down, and
    /// commands carrying a transaction id are journalled under their
    /// transaction. Commands that do not affect recovery are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] when the targeted node was shut
    /// down.
    pub fn track(&self, command: &Command) -> Result<()> {
        let mut connections = self.connections.lock();
        match command {
            Command::ConnectionInfo(info) => {
                connections.insert(
                    info.connection_id.clone(),
                    ConnectionState::new(info.clone()),
                );
                Ok(())
            }
            Command::SessionInfo(info) => connections
                .get_mut(&info.session_id.connection_id)
                .map_or(Ok(()), |connection| connection.add_session(info.clone())),
            Command::ConsumerInfo(info) => {
                let Some(connection) = connections.get_mut(&info.consumer_id.connection_id)
                else {
                    return Ok(());
                };
                if info.prefetch_size == 0 {
                    connection.add_recovering_pull_consumer(info.clone());
                }
                connection
                    .session_mut(&info.consumer_id.parent())
                    .map_or(Ok(()), |session| session.add_consumer(info.clone()))
            }
            Command::ProducerInfo(info) => {
                let session_id = crate::command::SessionId {
                    connection_id: info.producer_id.connection_id.clone(),
                    value: info.producer_id.session_id,
                };
                connections
                    .get_mut(&info.producer_id.connection_id)
                    .and_then(|connection| connection.session_mut(&session_id))
                    .map_or(Ok(()), |session| session.add_producer(info.clone()))
            }
            Command::DestinationInfo(info) => {
                let Some(connection) = connections.get_mut(&info.connection_id) else {
                    return Ok(());
                };
                match info.operation {
                    DestinationOperation::Add if info.destination.is_temporary() => {
                        connection.add_temp_destination(info.clone())
                    }
                    DestinationOperation::Remove => {
                        connection.remove_temp_destination(&info.destination);
                        Ok(())
                    }
                    DestinationOperation::Add => Ok(()),
                }
            }
            Command::TransactionInfo(info) => Self::track_transaction(&mut connections, info),
            Command::RemoveInfo(remove) => {
                Self::track_removal(&mut connections, &remove.object);
                Ok(())
            }
            Command::Message(_) | Command::MessageAck(_) => {
                Self::journal_in_transaction(&mut connections, command)
            }
            Command::MessagePull(_)
            | Command::MessageDispatch(_)
            | Command::ProducerAck(_)
            | Command::RemoveSubscriptionInfo(_) => Ok(()),
        }
    }

    fn track_transaction(
        connections: &mut HashMap<ConnectionId, ConnectionState>,
        info: &TransactionInfo,
    ) -> Result<()> {
        let Some(connection) = connections.get_mut(&info.transaction_id.connection_id) else {
            return Ok(());
        };
        match info.transaction_type {
            TransactionType::Begin => {
                connection.add_transaction_state(info.transaction_id.clone())
            }
            TransactionType::CommitOnePhase
            | TransactionType::CommitTwoPhase
            | TransactionType::Rollback
            | TransactionType::Forget => {
                connection.remove_transaction_state(&info.transaction_id);
                Ok(())
            }
            TransactionType::Prepare
            | TransactionType::Recover
            | TransactionType::End => Ok(()),
        }
    }

    fn track_removal(
        connections: &mut HashMap<ConnectionId, ConnectionState>,
        object: &RemovedObject,
    ) {
        match object {
            RemovedObject::Connection(id) => {
                connections.remove(id);
            }
            RemovedObject::Session(id) => {
                if let Some(connection) = connections.get_mut(&id.connection_id) {
                    connection.remove_session(id);
                }
            }
            RemovedObject::Consumer(id) => {
                if let Some(connection) = connections.get_mut(&id.connection_id) {
                    connection.remove_recovering_pull_consumer(id);
                    if let Some(session) = connection.session_mut(&id.parent()) {
                        session.remove_consumer(id);
                    }
                }
            }
            RemovedObject::Producer(id) => {
                let session_id = crate::command::SessionId {
                    connection_id: id.connection_id.clone(),
                    value: id.session_id,
                };
                if let Some(session) = connections
                    .get_mut(&id.connection_id)
                    .and_then(|connection| connection.session_mut(&session_id))
                {
                    session.remove_producer(id);
                }
            }
        }
    }

    fn journal_in_transaction(
        connections: &mut HashMap<ConnectionId, ConnectionState>,
        command: &Command,
    ) -> Result<()> {
        let Some(transaction_id) = command.transaction_id().cloned() else {
            return Ok(());
        };
        connections
            .get_mut(&transaction_id.connection_id)
            .and_then(|connection| connection.transaction_state_mut(&transaction_id))
            .map_or(Ok(()), |transaction| {
                transaction.add_command(command.clone())
            })
    }

    /// Install a new connection info and empty the children of that node.
    pub fn reset(&self, info: ConnectionInfo) {
        let mut connections = self.connections.lock();
        match connections.get_mut(&info.connection_id) {
            Some(connection) => connection.reset(info),
            None => {
                connections.insert(
                    info.connection_id.clone(),
                    ConnectionState::new(info),
                );
            }
        }
    }

    /// Mark a connection's tree dead; later mutations fail with `Disposed`.
    pub fn shutdown(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.lock().get_mut(id) {
            connection.shutdown();
        }
    }

    /// Run `f` against a connection's state node.
    pub fn with_connection<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&ConnectionState) -> R,
    ) -> Option<R> {
        self.connections.lock().get(id).map(f)
    }

    /// The registration commands to replay on reconnect, parent before
    /// child.
    #[must_use]
    pub fn replay_commands(&self, id: &ConnectionId) -> Vec<Command> {
        let connections = self.connections.lock();
        let Some(connection) = connections.get(id) else {
            return Vec::new();
        };

        let mut commands = vec![Command::ConnectionInfo(connection.info().clone())];
        for info in connection.temp_destinations() {
            commands.push(Command::DestinationInfo(info.clone()));
        }
        for session in connection.sessions() {
            if session.info().session_id.value != DEFAULT_SESSION_SUFFIX {
                commands.push(Command::SessionInfo(session.info().clone()));
            }
        }
        for session in connection.sessions() {
            for producer in session.producers() {
                commands.push(Command::ProducerInfo(producer.info.clone()));
            }
            for consumer in session.consumers() {
                commands.push(Command::ConsumerInfo(consumer.info.clone()));
            }
        }
        for (transaction_id, transaction) in connection.transactions() {
            commands.push(Command::TransactionInfo(TransactionInfo {
                transaction_id: transaction_id.clone(),
                transaction_type: TransactionType::Begin,
            }));
            commands.extend(transaction.commands().iter().cloned());
        }
        commands
    }

    /// Zero-prefetch consumers that need a fresh pull once restored.
    #[must_use]
    pub fn recovering_pull_consumers(
        &self,
        id: &ConnectionId,
    ) -> Vec<crate::command::ConsumerInfo> {
        self.connections
            .lock()
            .get(id)
            .map(|connection| {
                connection
                    .recovering_pull_consumers()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{
            ConsumerId,
            ConsumerInfo,
            DestinationInfo,
            ProducerId,
            ProducerInfo,
            RemoveInfo,
            SessionId,
            SessionInfo,
            TransactionId,
        },
        destination::Destination,
    };

    fn connection_id() -> ConnectionId { ConnectionId::new("C1") }

    fn connection_info() -> ConnectionInfo {
        ConnectionInfo {
            connection_id: connection_id(),
            client_id: Some("client".into()),
        }
    }

    fn session_info(value: i64) -> SessionInfo {
        SessionInfo {
            session_id: SessionId {
                connection_id: connection_id(),
                value,
            },
        }
    }

    fn consumer_info(session: i64, value: i64, prefetch: i32) -> ConsumerInfo {
        ConsumerInfo {
            consumer_id: ConsumerId {
                connection_id: connection_id(),
                session_id: session,
                value,
            },
            destination: Destination::queue("orders"),
            prefetch_size: prefetch,
            maximum_pending_message_limit: 0,
            dispatch_async: false,
            selector: None,
            subscription_name: None,
            no_local: false,
            browser: false,
            exclusive: false,
            retroactive: false,
            priority: 0,
        }
    }

    fn tracked(tracker: &StateTracker, command: Command) {
        tracker.track(&command).expect("tracking should succeed");
    }

    #[test]
    fn add_then_remove_session_round_trips() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        let before = tracker
            .with_connection(&connection_id(), ConnectionState::session_count)
            .expect("connection should be tracked");

        tracked(&tracker, Command::SessionInfo(session_info(1)));
        tracked(
            &tracker,
            Command::RemoveInfo(RemoveInfo {
                object: RemovedObject::Session(session_info(1).session_id),
                last_delivered_sequence_id: 0,
            }),
        );

        let after = tracker
            .with_connection(&connection_id(), ConnectionState::session_count)
            .expect("connection should be tracked");
        assert_eq!(before, after);
    }

    #[test]
    fn replay_orders_parents_before_children() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        tracked(
            &tracker,
            Command::DestinationInfo(DestinationInfo {
                connection_id: connection_id(),
                destination: Destination::temporary_queue("replies"),
                operation: DestinationOperation::Add,
            }),
        );
        tracked(&tracker, Command::SessionInfo(session_info(1)));
        tracked(
            &tracker,
            Command::ProducerInfo(ProducerInfo {
                producer_id: ProducerId {
                    connection_id: connection_id(),
                    session_id: 1,
                    value: 1,
                },
                destination: Destination::queue("orders"),
                producer_window_size: 0,
            }),
        );
        tracked(&tracker, Command::ConsumerInfo(consumer_info(1, 1, 100)));
        tracked(
            &tracker,
            Command::TransactionInfo(TransactionInfo {
                transaction_id: TransactionId {
                    connection_id: connection_id(),
                    value: 9,
                },
                transaction_type: TransactionType::Begin,
            }),
        );

        let replay = tracker.replay_commands(&connection_id());
        let kinds: Vec<&str> = replay
            .iter()
            .map(|command| match command {
                Command::ConnectionInfo(_) => "connection",
                Command::DestinationInfo(_) => "temp-destination",
                Command::SessionInfo(_) => "session",
                Command::ProducerInfo(_) => "producer",
                Command::ConsumerInfo(_) => "consumer",
                Command::TransactionInfo(_) => "transaction",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "connection",
                "temp-destination",
                "session",
                "producer",
                "consumer",
                "transaction"
            ]
        );
    }

    #[test]
    fn mutation_after_shutdown_is_disposed() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        tracker.shutdown(&connection_id());

        let result = tracker.track(&Command::SessionInfo(session_info(2)));
        assert!(matches!(result, Err(WirebusError::Disposed(_))));
    }

    #[test]
    fn shutdown_cascades_to_sessions() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        tracked(&tracker, Command::SessionInfo(session_info(1)));
        tracker.shutdown(&connection_id());

        let result = tracker.track(&Command::ConsumerInfo(consumer_info(1, 1, 10)));
        assert!(matches!(result, Err(WirebusError::Disposed(_))));
    }

    #[test]
    fn reset_replaces_info_and_empties_children() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        tracked(&tracker, Command::SessionInfo(session_info(1)));

        tracker.reset(ConnectionInfo {
            connection_id: connection_id(),
            client_id: Some("renegotiated".into()),
        });

        tracker
            .with_connection(&connection_id(), |connection| {
                assert_eq!(
                    connection.info().client_id.as_deref(),
                    Some("renegotiated")
                );
                // Only the default session survives a reset.
                assert_eq!(connection.session_count(), 1);
            })
            .expect("connection should survive reset");
    }

    #[test]
    fn zero_prefetch_consumers_are_marked_for_pull_recovery() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        tracked(&tracker, Command::SessionInfo(session_info(1)));
        tracked(&tracker, Command::ConsumerInfo(consumer_info(1, 1, 0)));
        tracked(&tracker, Command::ConsumerInfo(consumer_info(1, 2, 50)));

        let pulls = tracker.recovering_pull_consumers(&connection_id());
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].consumer_id.value, 1);
    }

    #[test]
    fn prepared_transactions_record_their_vote() {
        let mut state = TransactionState::new();
        state.set_prepared(3).expect("prepare should record");
        assert!(state.is_prepared());
        assert_eq!(state.prepared_result(), 3);

        state.shutdown();
        assert!(matches!(
            state.set_prepared(0),
            Err(WirebusError::Disposed(_))
        ));
    }

    #[test]
    fn transacted_commands_are_journalled() {
        let tracker = StateTracker::new();
        tracked(&tracker, Command::ConnectionInfo(connection_info()));
        let transaction_id = TransactionId {
            connection_id: connection_id(),
            value: 3,
        };
        tracked(
            &tracker,
            Command::TransactionInfo(TransactionInfo {
                transaction_id: transaction_id.clone(),
                transaction_type: TransactionType::Begin,
            }),
        );
        let mut message = crate::command::Message::new(bytes::Bytes::from_static(b"m"));
        message.transaction_id = Some(transaction_id.clone());
        tracked(&tracker, Command::Message(message));

        tracker
            .with_connection(&connection_id(), |connection| {
                let journal = connection
                    .transaction_state(&transaction_id)
                    .expect("transaction should be tracked");
                assert_eq!(journal.commands().len(), 1);
            })
            .expect("connection should be tracked");
    }
}
