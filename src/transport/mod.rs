//! The transport seam between the runtime and the wire.
//!
//! The runtime never touches sockets or OpenWire framing; it hands semantic
//! [`Command`]s to a [`Transport`] and receives inbound commands through a
//! [`TransportListener`]. Failover, SSL, and discovery transports all sit
//! behind this trait, as does the in-process [`MockTransport`] used by the
//! test suite.

pub mod mock;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

pub use mock::MockTransport;

use crate::{
    command::{Command, Response},
    error::Result,
};

/// Outbound half of the transport seam.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command without waiting for a broker reply.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Send a command and wait for the broker's response.
    ///
    /// `None` waits indefinitely; a broker rejection surfaces as
    /// [`WirebusError::Broker`](crate::WirebusError::Broker).
    async fn request(&self, command: Command, timeout: Option<Duration>) -> Result<Response>;

    /// Register the sink for inbound commands and interruption events.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Signal that every consumer finished clearing in-flight messages after
    /// an interruption, so a failover transport may resume dispatch.
    async fn interruption_processing_complete(&self);
}

/// Inbound half of the transport seam, implemented by the connection.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// An inbound command arrived, typically a
    /// [`MessageDispatch`](crate::command::MessageDispatch).
    async fn on_command(&self, command: Command);

    /// The transport lost its peer and is reconnecting.
    async fn on_interrupted(&self);

    /// The transport re-established its peer.
    async fn on_resumed(&self);

    /// The transport failed in a way that ends the connection.
    async fn on_exception(&self, error: String);
}
