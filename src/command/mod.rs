//! Commands exchanged with the broker.
//!
//! These are the semantic command types the runtime hands to the transport
//! seam; byte-level marshalling belongs to the transport implementation and
//! is out of scope here. Registration commands (`ConnectionInfo`,
//! `SessionInfo`, `ConsumerInfo`, `ProducerInfo`, `DestinationInfo`) describe
//! broker-side objects and are also what the connection state tracker replays
//! after a reconnect.

pub mod id;

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

pub use id::{ConnectionId, ConsumerId, MessageId, ProducerId, SessionId, TransactionId};

use crate::destination::Destination;

/// Registration command for a client connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
}

/// Registration command for a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

/// Registration command for a consumer.
///
/// Carries the full subscription description the broker needs to start
/// dispatching: destination, prefetch credit, selector, durable subscription
/// name, and the browse/no-local flags.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub prefetch_size: i32,
    pub maximum_pending_message_limit: i32,
    pub dispatch_async: bool,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
    pub no_local: bool,
    pub browser: bool,
    pub exclusive: bool,
    pub retroactive: bool,
    pub priority: i8,
}

/// Registration command for a producer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Destination,
    pub producer_window_size: i32,
}

/// Operation carried by a [`DestinationInfo`] command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationOperation {
    Add,
    Remove,
}

/// Registration or removal of a (typically temporary) destination.
#[derive(Clone, Debug, PartialEq)]
pub struct DestinationInfo {
    pub connection_id: ConnectionId,
    pub destination: Destination,
    pub operation: DestinationOperation,
}

/// The broker-side object a [`RemoveInfo`] tears down.
#[derive(Clone, Debug, PartialEq)]
pub enum RemovedObject {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

/// Teardown command for a previously registered object.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoveInfo {
    pub object: RemovedObject,
    /// Highest broker sequence delivered before removal, so the broker can
    /// resume pending deliveries correctly. Zero when nothing was delivered.
    pub last_delivered_sequence_id: i64,
}

/// Removal of a durable topic subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoveSubscriptionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub subscription_name: String,
}

/// A message as sent by a producer or carried inside a dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub destination: Option<Destination>,
    pub transaction_id: Option<TransactionId>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    /// JMS priority in `0..=9`; 4 is the default.
    pub priority: u8,
    /// Absolute expiration in milliseconds since the epoch; zero means the
    /// message never expires.
    pub expiration: i64,
    pub timestamp: i64,
    pub redelivery_counter: i32,
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with the given body and default delivery settings.
    #[must_use]
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: None,
            destination: None,
            transaction_id: None,
            correlation_id: None,
            persistent: true,
            priority: Self::DEFAULT_PRIORITY,
            expiration: 0,
            timestamp: 0,
            redelivery_counter: 0,
            redelivered: false,
            body,
            properties: BTreeMap::new(),
        }
    }

    /// Default JMS message priority.
    pub const DEFAULT_PRIORITY: u8 = 4;

    /// Whether the message's expiration lies in the past.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        if self.expiration <= 0 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        now > self.expiration
    }

    /// Record a rollback: bump the redelivery counter and flag the message.
    pub(crate) fn on_rollback(&mut self) {
        self.redelivery_counter += 1;
        self.redelivered = true;
    }

    /// Approximate wire size used for producer-window accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        const HEADER_OVERHEAD: usize = 64;
        HEADER_OVERHEAD + self.body.len()
    }
}

/// Inbound delivery of one message to one consumer.
///
/// A dispatch with `message == None` is the broker's "nothing available"
/// marker: it terminates an idle pull and wakes blocked receivers when the
/// channel closes.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub message: Option<Message>,
    pub redelivery_counter: i32,
}

/// Acknowledgement kinds understood by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckType {
    /// Prefetch-credit hint; not a consumption acknowledgement.
    Delivered = 0,
    /// Rejection after the redelivery limit; routes to the DLQ.
    Poison = 1,
    /// Successful processing; the broker may discard the messages.
    Consumed = 2,
    /// The client has seen these messages before; broker bumps counters.
    Redelivered = 3,
    /// Consumed acknowledgement for exactly one message.
    Individual = 4,
}

/// Acknowledgement of a contiguous range of dispatched messages.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageAck {
    pub ack_type: AckType,
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: i32,
    pub transaction_id: Option<TransactionId>,
}

/// Request for a single message from a zero-prefetch consumer.
///
/// `timeout` semantics: `0` waits for one message, a positive value waits up
/// to that many milliseconds, `-1` returns immediately if nothing is
/// available.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub timeout: i64,
}

/// Two-phase-commit transaction operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    Begin,
    Prepare,
    CommitOnePhase,
    CommitTwoPhase,
    Rollback,
    Recover,
    Forget,
    End,
}

/// Transaction lifecycle command.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionInfo {
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
}

/// Broker notification releasing producer-window usage after an async send.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerAck {
    pub producer_id: ProducerId,
    pub size: usize,
}

/// The commands the runtime exchanges with the transport seam.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    DestinationInfo(DestinationInfo),
    RemoveInfo(RemoveInfo),
    RemoveSubscriptionInfo(RemoveSubscriptionInfo),
    Message(Message),
    MessageDispatch(MessageDispatch),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    TransactionInfo(TransactionInfo),
    ProducerAck(ProducerAck),
}

impl Command {
    /// The transaction this command participates in, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Self::Message(message) => message.transaction_id.as_ref(),
            Self::MessageAck(ack) => ack.transaction_id.as_ref(),
            Self::TransactionInfo(info) => Some(&info.transaction_id),
            _ => None,
        }
    }
}

/// Reply to a synchronous request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Plain acknowledgement of the request.
    Ok,
    /// Integer result, e.g. a prepare vote.
    Integer(i32),
}
