//! Recorded state of one connection and everything registered under it.

use std::collections::HashMap;

use crate::{
    command::{
        ConnectionInfo,
        ConsumerId,
        ConsumerInfo,
        DestinationInfo,
        SessionId,
        SessionInfo,
        TransactionId,
    },
    destination::Destination,
    error::{Result, WirebusError},
    state::{SessionState, TransactionState},
};

/// Suffix of the implicit session every connection owns at construction.
pub const DEFAULT_SESSION_SUFFIX: i64 = -1;

/// Connection node of the state tree.
///
/// Every live child is reachable from exactly one parent: sessions hang off
/// the connection, consumers and producers hang off their session, and
/// transactions and temporary destinations hang off the connection directly.
#[derive(Debug)]
pub struct ConnectionState {
    info: ConnectionInfo,
    sessions: HashMap<SessionId, SessionState>,
    transactions: HashMap<TransactionId, TransactionState>,
    temp_destinations: Vec<DestinationInfo>,
    recovering_pull_consumers: HashMap<ConsumerId, ConsumerInfo>,
    shutdown: bool,
}

impl ConnectionState {
    /// Create the state node, seeding the default session.
    #[must_use]
    pub fn new(info: ConnectionInfo) -> Self {
        let mut state = Self {
            info,
            sessions: HashMap::new(),
            transactions: HashMap::new(),
            temp_destinations: Vec::new(),
            recovering_pull_consumers: HashMap::new(),
            shutdown: false,
        };
        let default_session = state.default_session_id();
        state.sessions.insert(
            default_session.clone(),
            SessionState::new(SessionInfo {
                session_id: default_session,
            }),
        );
        state
    }

    fn default_session_id(&self) -> SessionId {
        SessionId {
            connection_id: self.info.connection_id.clone(),
            value: DEFAULT_SESSION_SUFFIX,
        }
    }

    #[must_use]
    pub fn info(&self) -> &ConnectionInfo { &self.info }

    /// Install a new connection info and empty all children.
    ///
    /// Used on client-id re-negotiation, where everything registered under
    /// the old identity is invalid.
    pub fn reset(&mut self, info: ConnectionInfo) {
        self.info = info;
        self.sessions.clear();
        self.transactions.clear();
        self.temp_destinations.clear();
        self.recovering_pull_consumers.clear();
        self.shutdown = false;
        let default_session = self.default_session_id();
        self.sessions.insert(
            default_session.clone(),
            SessionState::new(SessionInfo {
                session_id: default_session,
            }),
        );
    }

    /// Record a session registration.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_session(&mut self, info: SessionInfo) -> Result<()> {
        self.check_shutdown()?;
        self.sessions
            .insert(info.session_id.clone(), SessionState::new(info));
        Ok(())
    }

    pub fn remove_session(&mut self, id: &SessionId) -> Option<SessionState> {
        self.sessions.remove(id)
    }

    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<&SessionState> { self.sessions.get(id) }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionState> { self.sessions.values() }

    #[must_use]
    pub fn session_count(&self) -> usize { self.sessions.len() }

    /// Record a temporary destination registration.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_temp_destination(&mut self, info: DestinationInfo) -> Result<()> {
        self.check_shutdown()?;
        self.temp_destinations.push(info);
        Ok(())
    }

    /// Drop the registration matching `destination`.
    pub fn remove_temp_destination(&mut self, destination: &Destination) {
        self.temp_destinations
            .retain(|info| &info.destination != destination);
    }

    #[must_use]
    pub fn temp_destinations(&self) -> &[DestinationInfo] { &self.temp_destinations }

    /// Record a transaction begin.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_transaction_state(&mut self, id: TransactionId) -> Result<()> {
        self.check_shutdown()?;
        self.transactions.insert(id, TransactionState::new());
        Ok(())
    }

    pub fn remove_transaction_state(&mut self, id: &TransactionId) -> Option<TransactionState> {
        self.transactions.remove(id)
    }

    #[must_use]
    pub fn transaction_state(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.transactions.get(id)
    }

    pub fn transaction_state_mut(&mut self, id: &TransactionId) -> Option<&mut TransactionState> {
        self.transactions.get_mut(id)
    }

    pub fn transactions(
        &self,
    ) -> impl Iterator<Item = (&TransactionId, &TransactionState)> {
        self.transactions.iter()
    }

    /// Remember a zero-prefetch consumer whose recovery needs a pull
    /// re-issued after reconnect.
    pub fn add_recovering_pull_consumer(&mut self, info: ConsumerInfo) {
        self.recovering_pull_consumers
            .insert(info.consumer_id.clone(), info);
    }

    pub fn remove_recovering_pull_consumer(&mut self, id: &ConsumerId) {
        self.recovering_pull_consumers.remove(id);
    }

    pub fn recovering_pull_consumers(&self) -> impl Iterator<Item = &ConsumerInfo> {
        self.recovering_pull_consumers.values()
    }

    /// Mark the node dead and cascade to every session.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
        for session in self.sessions.values_mut() {
            session.shutdown();
        }
        for transaction in self.transactions.values_mut() {
            transaction.shutdown();
        }
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown {
            Err(WirebusError::Disposed("connection state"))
        } else {
            Ok(())
        }
    }
}
