//! The connection hub: session factory, dispatch routing, and the
//! transport-interruption protocol.
//!
//! The connection owns the transport handle and the dispatcher map keyed by
//! consumer id; every inbound `MessageDispatch` is routed to the owning
//! session, which queues it on the consumer's channel through its executor.
//! Children never hold the connection directly: they receive a
//! [`ConnectionHandle`] capability that degrades to `Disposed` errors once
//! the connection is dropped.

use std::{
    sync::{
        Arc,
        Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::{
    command::{
        Command,
        ConnectionId,
        ConnectionInfo,
        ConsumerId,
        ProducerId,
        RemoveInfo,
        RemovedObject,
        Response,
        SessionId,
        SessionInfo,
        TransactionId,
    },
    error::{Result, WirebusError},
    policy::{AckMode, PrefetchPolicy, RedeliveryPolicy},
    producer::MessageProducer,
    session::{Session, SessionCore, SessionOptions},
    transport::{Transport, TransportListener},
};

type ExceptionHook = Box<dyn Fn(&str) + Send + Sync>;

/// Connection-wide behaviour switches.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Send persistent messages fire-and-forget.
    pub async_send: bool,
    /// Force every send through a synchronous request.
    pub always_sync_send: bool,
    /// Send acks one-way instead of waiting for the broker.
    pub send_acks_async: bool,
    /// Select the priority-aware dispatch channel for consumers.
    pub priority_supported: bool,
    pub close_timeout: Duration,
    pub prefetch_policy: PrefetchPolicy,
    pub redelivery_policy: RedeliveryPolicy,
    pub session_options: SessionOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            async_send: false,
            always_sync_send: false,
            send_acks_async: true,
            priority_supported: false,
            close_timeout: Duration::from_secs(15),
            prefetch_policy: PrefetchPolicy::default(),
            redelivery_policy: RedeliveryPolicy::default(),
            session_options: SessionOptions::default(),
        }
    }
}

pub(crate) struct ConnectionCore {
    info: ConnectionInfo,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    sessions: DashMap<SessionId, Arc<SessionCore>>,
    dispatchers: DashMap<ConsumerId, Weak<SessionCore>>,
    producer_routes: DashMap<ProducerId, Weak<MessageProducer>>,
    session_counter: AtomicI64,
    transaction_counter: AtomicI64,
    started: AtomicBool,
    closed: AtomicBool,
    interruption_pending: AtomicI64,
    exception_hook: RwLock<Option<ExceptionHook>>,
}

impl ConnectionCore {
    fn sessions_snapshot(&self) -> Vec<Arc<SessionCore>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        match self.transport.oneway(command).await {
            Ok(()) => Ok(()),
            Err(error) => {
                log::warn!("one-way send failed: {error}");
                self.fire_exception(&error.to_string());
                Err(error)
            }
        }
    }

    async fn sync_request(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.transport.request(command, timeout).await
    }

    fn fire_exception(&self, message: &str) {
        if let Some(hook) = &*self.exception_hook.read() {
            hook(message);
        }
    }

    async fn complete_interruption_step(&self) {
        // The last consumer to finish clearing releases the transport.
        let mut remaining = self.interruption_pending.load(Ordering::SeqCst);
        loop {
            if remaining <= 0 {
                return;
            }
            match self.interruption_pending.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => remaining = current,
            }
        }
        if remaining == 1 {
            self.transport.interruption_processing_complete().await;
        }
    }
}

#[async_trait]
impl TransportListener for ConnectionCore {
    async fn on_command(&self, command: Command) {
        match command {
            Command::MessageDispatch(dispatch) => {
                let session = self
                    .dispatchers
                    .get(&dispatch.consumer_id)
                    .and_then(|entry| entry.value().upgrade());
                match session {
                    Some(session) => session.dispatch(dispatch),
                    None => log::debug!(
                        "no dispatcher for consumer {}; dropping dispatch",
                        dispatch.consumer_id
                    ),
                }
            }
            Command::ProducerAck(ack) => {
                let producer = self
                    .producer_routes
                    .get(&ack.producer_id)
                    .and_then(|entry| entry.value().upgrade());
                if let Some(producer) = producer {
                    producer.on_producer_ack(ack.size);
                }
            }
            other => log::debug!("ignoring unexpected inbound command: {other:?}"),
        }
    }

    async fn on_interrupted(&self) {
        let sessions = self.sessions_snapshot();
        let consumer_count: usize = sessions.iter().map(|session| session.consumer_count()).sum();
        self.interruption_pending
            .store(consumer_count as i64, Ordering::SeqCst);
        log::info!("transport interrupted; clearing {consumer_count} consumers");
        for session in sessions {
            session.clear_messages_in_progress();
        }
        if consumer_count == 0 {
            self.transport.interruption_processing_complete().await;
        }
    }

    async fn on_resumed(&self) {
        log::info!("transport resumed for connection {}", self.info.connection_id);
    }

    async fn on_exception(&self, error: String) {
        log::error!("transport failed: {error}");
        for session in self.sessions_snapshot() {
            for consumer in session.consumers_snapshot() {
                consumer.set_failure(error.clone());
            }
        }
        self.fire_exception(&error);
    }
}

/// Non-owning capability handed to sessions and their children.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    core: Weak<ConnectionCore>,
}

impl ConnectionHandle {
    fn upgrade(&self) -> Result<Arc<ConnectionCore>> {
        self.core
            .upgrade()
            .ok_or(WirebusError::Disposed("connection"))
    }

    pub(crate) async fn oneway(&self, command: Command) -> Result<()> {
        self.upgrade()?.oneway(command).await
    }

    pub(crate) async fn sync_request(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.upgrade()?.sync_request(command, timeout).await
    }

    pub(crate) fn next_transaction_id(&self) -> Result<TransactionId> {
        let core = self.upgrade()?;
        Ok(TransactionId {
            connection_id: core.info.connection_id.clone(),
            value: core.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    pub(crate) fn add_dispatcher(&self, id: ConsumerId, session: &Arc<SessionCore>) {
        if let Ok(core) = self.upgrade() {
            core.dispatchers.insert(id, Arc::downgrade(session));
        }
    }

    pub(crate) fn remove_dispatcher(&self, id: &ConsumerId) {
        if let Ok(core) = self.upgrade() {
            core.dispatchers.remove(id);
        }
    }

    pub(crate) fn add_producer_route(&self, id: ProducerId, producer: &Arc<MessageProducer>) {
        if let Ok(core) = self.upgrade() {
            core.producer_routes.insert(id, Arc::downgrade(producer));
        }
    }

    pub(crate) fn remove_producer_route(&self, id: &ProducerId) {
        if let Ok(core) = self.upgrade() {
            core.producer_routes.remove(id);
        }
    }

    pub(crate) fn remove_session(&self, id: &SessionId) {
        if let Ok(core) = self.upgrade() {
            core.sessions.remove(id);
        }
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.core
            .upgrade()
            .and_then(|core| core.info.client_id.clone())
    }

    pub(crate) fn prefetch_policy(&self) -> PrefetchPolicy {
        self.core
            .upgrade()
            .map_or_else(PrefetchPolicy::default, |core| core.config.prefetch_policy)
    }

    pub(crate) fn redelivery_policy(&self) -> RedeliveryPolicy {
        self.core
            .upgrade()
            .map_or_else(RedeliveryPolicy::default, |core| {
                core.config.redelivery_policy
            })
    }

    pub(crate) fn priority_supported(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.config.priority_supported)
    }

    pub(crate) fn async_send(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.config.async_send)
    }

    pub(crate) fn always_sync_send(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.config.always_sync_send)
    }

    pub(crate) fn send_acks_async(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.config.send_acks_async)
    }

    pub(crate) async fn transport_interruption_processing_complete(&self) {
        if let Some(core) = self.core.upgrade() {
            core.complete_interruption_step().await;
        }
    }

    pub(crate) fn report_async_error(&self, message: &str) {
        log::warn!("{message}");
        if let Some(core) = self.core.upgrade() {
            core.fire_exception(message);
        }
    }
}

/// Configures and establishes a [`Connection`].
pub struct ConnectionBuilder {
    transport: Arc<dyn Transport>,
    connection_id: Option<ConnectionId>,
    client_id: Option<String>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connection_id: None,
            client_id: None,
            config: ConnectionConfig::default(),
        }
    }

    #[must_use]
    pub fn connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Identify the client to the broker; required for durable
    /// subscriptions.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn async_send(mut self, async_send: bool) -> Self {
        self.config.async_send = async_send;
        self
    }

    #[must_use]
    pub fn always_sync_send(mut self, always_sync_send: bool) -> Self {
        self.config.always_sync_send = always_sync_send;
        self
    }

    #[must_use]
    pub fn send_acks_async(mut self, send_acks_async: bool) -> Self {
        self.config.send_acks_async = send_acks_async;
        self
    }

    #[must_use]
    pub fn priority_supported(mut self, priority_supported: bool) -> Self {
        self.config.priority_supported = priority_supported;
        self
    }

    #[must_use]
    pub fn prefetch_policy(mut self, policy: PrefetchPolicy) -> Self {
        self.config.prefetch_policy = policy;
        self
    }

    #[must_use]
    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.config.redelivery_policy = policy;
        self
    }

    /// Apply `connection.`- and `session.`-prefixed options from a broker
    /// URI query string.
    ///
    /// Unknown keys are ignored; a value that fails to parse surfaces as
    /// [`WirebusError::InvalidUri`].
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidUri`] for malformed values.
    pub fn apply_uri_options(mut self, uri: &str) -> Result<Self> {
        let query = uri.split_once('?').map(|(_, query)| query).unwrap_or("");
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "connection.asyncSend" => {
                    self.config.async_send = parse_uri_value(&key, &value)?;
                }
                "connection.alwaysSyncSend" => {
                    self.config.always_sync_send = parse_uri_value(&key, &value)?;
                }
                "connection.sendAcksAsync" => {
                    self.config.send_acks_async = parse_uri_value(&key, &value)?;
                }
                "connection.messagePrioritySupported" => {
                    self.config.priority_supported = parse_uri_value(&key, &value)?;
                }
                "connection.closeTimeout" => {
                    let millis: u64 = parse_uri_value(&key, &value)?;
                    self.config.close_timeout = Duration::from_millis(millis);
                }
                "session.closeStopTimeout" => {
                    let millis: u64 = parse_uri_value(&key, &value)?;
                    self.config.session_options.close_stop_timeout =
                        (millis > 0).then(|| Duration::from_millis(millis));
                }
                "session.disposeStopTimeout" => {
                    let millis: u64 = parse_uri_value(&key, &value)?;
                    self.config.session_options.dispose_stop_timeout =
                        Duration::from_millis(millis);
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Register the connection at the broker and wire up inbound routing.
    ///
    /// # Errors
    ///
    /// Returns the broker or transport error from the registration.
    pub async fn establish(self) -> Result<Connection> {
        let info = ConnectionInfo {
            connection_id: self.connection_id.unwrap_or_else(ConnectionId::generate),
            client_id: self.client_id,
        };
        let core = Arc::new(ConnectionCore {
            info: info.clone(),
            transport: Arc::clone(&self.transport),
            config: self.config,
            sessions: DashMap::new(),
            dispatchers: DashMap::new(),
            producer_routes: DashMap::new(),
            session_counter: AtomicI64::new(0),
            transaction_counter: AtomicI64::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            interruption_pending: AtomicI64::new(0),
            exception_hook: RwLock::new(None),
        });
        self.transport
            .set_listener(Arc::clone(&core) as Arc<dyn TransportListener>);
        core.sync_request(Command::ConnectionInfo(info), None).await?;
        Ok(Connection { core })
    }
}

fn parse_uri_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        WirebusError::InvalidUri(format!("invalid value '{value}' for option '{key}'"))
    })
}

/// A client connection to the broker.
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Start building a connection over `transport`.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> ConnectionBuilder {
        ConnectionBuilder::new(transport)
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId { &self.core.info.connection_id }

    /// Observe asynchronous failures: one-way send errors, listener errors
    /// in non-redelivering modes, and transport exceptions.
    pub fn set_exception_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.core.exception_hook.write() = Some(Box::new(hook));
    }

    /// Create a session under this connection.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after close, or the transport
    /// error from the registration.
    pub async fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(WirebusError::Disposed("connection"));
        }
        let session_id = SessionId {
            connection_id: self.core.info.connection_id.clone(),
            value: self.core.session_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let info = SessionInfo {
            session_id: session_id.clone(),
        };
        let core = SessionCore::create(
            info.clone(),
            ack_mode,
            ConnectionHandle {
                core: Arc::downgrade(&self.core),
            },
            self.core.config.session_options,
        );
        self.core.sessions.insert(session_id, Arc::clone(&core));
        self.core.oneway(Command::SessionInfo(info)).await?;
        if self.core.started.load(Ordering::SeqCst) {
            core.start().await;
        }
        Ok(Session::new(core))
    }

    /// Begin delivery on every session.
    pub async fn start(&self) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for session in self.core.sessions_snapshot() {
            session.start().await;
        }
    }

    /// Suspend delivery without tearing anything down.
    pub async fn stop(&self) {
        if !self.core.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for session in self.core.sessions_snapshot() {
            session.stop().await;
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool { self.core.started.load(Ordering::SeqCst) }

    /// Close every session and deregister the connection at the broker.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; teardown command failures are logged.
    pub async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for session in self.core.sessions_snapshot() {
            match tokio::time::timeout(self.core.config.close_timeout, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => log::warn!("session close failed: {error}"),
                Err(_) => log::warn!(
                    "session close did not finish within {:?}",
                    self.core.config.close_timeout
                ),
            }
        }
        let remove = Command::RemoveInfo(RemoveInfo {
            object: RemovedObject::Connection(self.core.info.connection_id.clone()),
            last_delivered_sequence_id: 0,
        });
        if let Err(error) = self.core.oneway(remove).await {
            log::warn!("failed to send connection teardown: {error}");
        }
        Ok(())
    }
}
