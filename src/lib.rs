#![doc(html_root_url = "https://docs.rs/wirebus/latest")]
//! Client-side session and consumer runtime for OpenWire-style message
//! brokers.
//!
//! `wirebus` turns a broker's asynchronous dispatch stream into correct,
//! ordered, acknowledged delivery under five acknowledgement regimes, local
//! transactions, transport interruptions, and redelivery policy. The wire
//! itself is abstracted behind the [`Transport`] trait; this crate owns
//! everything between that seam and application code: connections, sessions
//! and their dispatch executors, consumers with their ack engine, producers
//! with window flow control, and the connection state tracker a failover
//! transport replays after reconnect.

pub mod channel;
pub mod command;
pub mod connection;
pub mod consumer;
pub mod destination;
pub mod error;
mod executor;
pub mod policy;
pub mod producer;
pub mod session;
pub mod state;
mod transaction;
pub mod transport;

pub use channel::DispatchChannel;
pub use command::{
    AckType,
    Command,
    ConnectionId,
    ConsumerId,
    Message,
    MessageAck,
    MessageDispatch,
    MessageId,
    MessagePull,
    ProducerId,
    Response,
    SessionId,
    TransactionId,
};
pub use connection::{Connection, ConnectionBuilder, ConnectionConfig};
pub use consumer::{MessageConsumer, MessageListener, ReceivedMessage};
pub use destination::{Destination, DestinationKind};
pub use error::{Result, WirebusError};
pub use policy::{AckMode, PrefetchPolicy, RedeliveryPolicy};
pub use producer::{MessageProducer, MessageTransformer};
pub use session::{ConsumerBuilder, ProducerBuilder, Session, SessionOptions};
pub use state::StateTracker;
pub use transport::{MockTransport, Transport, TransportListener};
