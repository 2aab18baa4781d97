//! Identifier types for broker-registered objects.
//!
//! Identifiers form a parent/child hierarchy: a connection id scopes session
//! ids, which in turn scope consumer and producer ids. Message ids are scoped
//! by the producer that created them and carry the broker-assigned sequence
//! used for recovery bookkeeping.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Globally unique identifier for a client connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an explicit connection id string.
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

    /// Generate a process-unique connection id.
    ///
    /// The id combines the process start-relative counter with the wall-clock
    /// millisecond so that ids from restarted processes do not collide at the
    /// broker.
    #[must_use]
    pub fn generate() -> Self {
        static COUNTER: AtomicI64 = AtomicI64::new(1);
        let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self(format!("ID:wirebus-{millis}-{sequence}"))
    }

    /// The underlying id string.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Identifier for a session, scoped by its connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identifier for a consumer, scoped by its session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId {
    pub connection_id: ConnectionId,
    pub session_id: i64,
    pub value: i64,
}

impl ConsumerId {
    /// The id of the session that owns this consumer.
    #[must_use]
    pub fn parent(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifier for a producer, scoped by its session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId {
    pub connection_id: ConnectionId,
    pub session_id: i64,
    pub value: i64,
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifier for a message.
///
/// `broker_sequence_id` is assigned by the broker on dispatch and is the
/// value reported back in `RemoveInfo::last_delivered_sequence_id` when a
/// consumer closes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub producer_id: ProducerId,
    pub producer_sequence_id: i64,
    pub broker_sequence_id: i64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

/// Identifier for a local transaction, produced by the connection's
/// transaction id generator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}
