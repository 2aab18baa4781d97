//! Sessions: factories for consumers and producers, dispatch routing, and
//! transactional boundaries.
//!
//! A session owns its children and hands them a non-owning [`SessionHandle`]
//! capability exposing exactly the operations they need (command submission,
//! ack sending, synchronization registration, redispatch). That keeps the
//! ownership graph acyclic: parents own children, children reach up through
//! weak handles that fail with `Disposed` once the session is gone.

use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use dashmap::DashMap;

use crate::{
    channel::DispatchChannel,
    command::{
        Command,
        ConsumerId,
        ConsumerInfo,
        MessageAck,
        MessageDispatch,
        ProducerId,
        ProducerInfo,
        RemoveInfo,
        RemoveSubscriptionInfo,
        RemovedObject,
        Response,
        SessionInfo,
        TransactionId,
    },
    connection::ConnectionHandle,
    consumer::MessageConsumer,
    destination::Destination,
    error::{Result, WirebusError},
    executor::SessionExecutor,
    policy::AckMode,
    producer::{MessageProducer, MessageTransformer},
    transaction::{Synchronization, TransactionContext},
};
use tokio::time::Duration;

/// Executor stop bounds for the session close paths.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Wait applied when closing gracefully; `None` waits indefinitely.
    pub close_stop_timeout: Option<Duration>,
    /// Wait applied when disposing after a failure.
    pub dispose_stop_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            close_stop_timeout: None,
            dispose_stop_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct SessionCore {
    info: SessionInfo,
    ack_mode: AckMode,
    pub(crate) connection: ConnectionHandle,
    consumers: Arc<DashMap<ConsumerId, Arc<MessageConsumer>>>,
    producers: DashMap<ProducerId, Arc<MessageProducer>>,
    executor: Arc<SessionExecutor>,
    context: TransactionContext,
    consumer_counter: AtomicI64,
    producer_counter: AtomicI64,
    started: AtomicBool,
    closed: AtomicBool,
    closing: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
    options: SessionOptions,
}

impl SessionCore {
    pub(crate) fn create(
        info: SessionInfo,
        ack_mode: AckMode,
        connection: ConnectionHandle,
        options: SessionOptions,
    ) -> Arc<Self> {
        let consumers = Arc::new(DashMap::new());
        let executor = Arc::new(SessionExecutor::new(Arc::downgrade(&consumers)));
        let context = TransactionContext::new(connection.clone());
        Arc::new(Self {
            info,
            ack_mode,
            connection,
            consumers,
            producers: DashMap::new(),
            executor,
            context,
            consumer_counter: AtomicI64::new(0),
            producer_counter: AtomicI64::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
            options,
        })
    }

    pub(crate) fn handle(self: &Arc<Self>) -> SessionHandle {
        SessionHandle {
            core: Arc::downgrade(self),
        }
    }

    pub(crate) fn session_id(&self) -> &crate::command::SessionId { &self.info.session_id }

    /// Route an inbound dispatch onto the executor.
    pub(crate) fn dispatch(&self, dispatch: MessageDispatch) { self.executor.execute(dispatch); }

    pub(crate) async fn start(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        for consumer in self.consumers_snapshot() {
            consumer.start().await;
        }
        self.executor.start();
    }

    pub(crate) async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for consumer in self.consumers_snapshot() {
            consumer.stop();
        }
        self.executor.stop(None).await;
    }

    pub(crate) fn consumers_snapshot(&self) -> Vec<Arc<MessageConsumer>> {
        self.consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn producers_snapshot(&self) -> Vec<Arc<MessageProducer>> {
        self.producers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn consumer_count(&self) -> usize { self.consumers.len() }

    async fn send_ack(&self, ack: MessageAck, lazy: bool) -> Result<()> {
        if lazy || self.connection.send_acks_async() {
            self.connection.oneway(Command::MessageAck(ack)).await
        } else {
            self.connection
                .sync_request(Command::MessageAck(ack), None)
                .await
                .map(|_| ())
        }
    }

    /// Resubmit buffered channel contents at the head of the executor so
    /// their original order is preserved.
    fn redispatch(&self, channel: &DispatchChannel) {
        let mut buffered = channel.remove_all();
        buffered.reverse();
        for dispatch in buffered {
            self.executor.execute_first(dispatch);
        }
    }

    /// Begin clearing in-flight messages after a transport interruption.
    ///
    /// The per-consumer drain runs on spawned workers so it cannot deadlock
    /// with dispatches holding the channel order lock.
    pub(crate) fn clear_messages_in_progress(&self) {
        self.executor.clear();
        for consumer in self.consumers_snapshot() {
            consumer.in_progress_clear_required();
            tokio::spawn(async move { consumer.clear_messages_in_progress().await });
        }
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            Err(WirebusError::Disposed("session"))
        } else {
            Ok(())
        }
    }

    async fn create_consumer(self: &Arc<Self>, builder: ConsumerBuilder) -> Result<Arc<MessageConsumer>> {
        self.check_closed()?;
        let destination = builder.destination.ok_or(WirebusError::InvalidDestination)?;

        let consumer_id = ConsumerId {
            connection_id: self.info.session_id.connection_id.clone(),
            session_id: self.info.session_id.value,
            value: self.consumer_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let prefetch_default = self.connection.prefetch_policy().prefetch_for(
            destination.is_queue(),
            builder.subscription_name.is_some(),
            builder.browser,
        );
        let mut info = ConsumerInfo {
            consumer_id,
            destination: destination.clone(),
            prefetch_size: builder.prefetch.unwrap_or(prefetch_default),
            maximum_pending_message_limit: builder.maximum_pending_message_limit,
            dispatch_async: builder.dispatch_async,
            selector: builder.selector,
            subscription_name: builder.subscription_name,
            no_local: builder.no_local,
            browser: builder.browser,
            exclusive: false,
            retroactive: false,
            priority: 0,
        };
        let mut ignore_expiration = false;
        apply_destination_options(&mut info, &mut ignore_expiration, &destination)?;
        if info.prefetch_size < 0 {
            return Err(WirebusError::InvalidOperation(
                "prefetch size cannot be negative",
            ));
        }

        let consumer = MessageConsumer::new(
            self.handle(),
            info.clone(),
            self.ack_mode,
            ignore_expiration,
            self.connection.redelivery_policy(),
            self.connection.priority_supported(),
        );
        self.consumers
            .insert(info.consumer_id.clone(), Arc::clone(&consumer));
        self.connection.add_dispatcher(info.consumer_id.clone(), self);

        // Consumer creation is synchronous so broker failures propagate;
        // partial registration is rolled back on rejection.
        if let Err(error) = self
            .connection
            .sync_request(Command::ConsumerInfo(info.clone()), None)
            .await
        {
            self.consumers.remove(&info.consumer_id);
            self.connection.remove_dispatcher(&info.consumer_id);
            return Err(error);
        }

        if self.started.load(Ordering::SeqCst) {
            consumer.start().await;
        }
        self.executor.start();
        Ok(consumer)
    }

    async fn create_producer(self: &Arc<Self>, builder: ProducerBuilder) -> Result<Arc<MessageProducer>> {
        self.check_closed()?;
        let destination = builder.destination.ok_or(WirebusError::InvalidDestination)?;
        let producer_id = ProducerId {
            connection_id: self.info.session_id.connection_id.clone(),
            session_id: self.info.session_id.value,
            value: self.producer_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let info = ProducerInfo {
            producer_id: producer_id.clone(),
            destination,
            producer_window_size: builder.window_size,
        };
        let producer = Arc::new(MessageProducer::new(
            self.handle(),
            info.clone(),
            builder.transformer,
            builder.send_timeout,
        ));
        self.producers.insert(producer_id.clone(), Arc::clone(&producer));
        self.connection.add_producer_route(producer_id.clone(), &producer);

        if let Err(error) = self.connection.oneway(Command::ProducerInfo(info)).await {
            self.producers.remove(&producer_id);
            self.connection.remove_producer_route(&producer_id);
            return Err(error);
        }
        Ok(producer)
    }

    /// Close ordering: mark closing, stop the pump, shut down children, roll
    /// back an open transaction, deregister, then tell the broker with the
    /// minimum delivered sequence across child consumers.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.close_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.store(true, Ordering::SeqCst);

        self.executor.stop(self.options.close_stop_timeout).await;

        let mut last_delivered: Option<i64> = None;
        for consumer in self.consumers_snapshot() {
            let delivered = consumer.last_delivered_sequence_id();
            last_delivered = Some(last_delivered.map_or(delivered, |low| low.min(delivered)));
            consumer.shutdown().await;
        }
        for producer in self.producers_snapshot() {
            producer.shutdown();
        }

        if self.ack_mode.is_transacted() && self.context.in_local_transaction() {
            if let Err(error) = self.context.rollback().await {
                log::warn!("rollback during session close failed: {error}");
            }
        }

        self.connection.remove_session(&self.info.session_id);
        let remove = Command::RemoveInfo(RemoveInfo {
            object: RemovedObject::Session(self.info.session_id.clone()),
            last_delivered_sequence_id: last_delivered.unwrap_or(0).max(0),
        });
        if let Err(error) = self.connection.oneway(remove).await {
            log::warn!("failed to send session teardown: {error}");
        }

        self.closed.store(true, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Non-owning capability handed to consumers and producers.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    core: Weak<SessionCore>,
}

impl SessionHandle {
    fn upgrade(&self) -> Result<Arc<SessionCore>> {
        self.core.upgrade().ok_or(WirebusError::Disposed("session"))
    }

    pub(crate) async fn oneway(&self, command: Command) -> Result<()> {
        self.upgrade()?.connection.oneway(command).await
    }

    pub(crate) async fn sync_request(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.upgrade()?.connection.sync_request(command, timeout).await
    }

    pub(crate) async fn send_ack(&self, ack: MessageAck, lazy: bool) -> Result<()> {
        self.upgrade()?.send_ack(ack, lazy).await
    }

    pub(crate) fn is_transacted(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.ack_mode.is_transacted())
    }

    pub(crate) fn in_local_transaction(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.context.in_local_transaction())
    }

    pub(crate) async fn ensure_transaction_started(&self) -> Result<TransactionId> {
        self.upgrade()?.context.begin().await
    }

    pub(crate) async fn transaction_id(&self) -> Option<TransactionId> {
        match self.core.upgrade() {
            Some(core) => core.context.transaction_id().await,
            None => None,
        }
    }

    pub(crate) async fn register_synchronization(
        &self,
        synchronization: Synchronization,
    ) -> Result<()> {
        self.upgrade()?
            .context
            .add_synchronization(synchronization)
            .await;
        Ok(())
    }

    pub(crate) fn redispatch(&self, channel: &DispatchChannel) -> Result<()> {
        self.upgrade()?.redispatch(channel);
        Ok(())
    }

    pub(crate) fn wakeup_executor(&self) {
        if let Some(core) = self.core.upgrade() {
            core.executor.wakeup();
        }
    }

    pub(crate) async fn stop_executor(&self, timeout: Option<Duration>) {
        if let Some(core) = self.core.upgrade() {
            core.executor.stop(timeout).await;
        }
    }

    pub(crate) fn start_executor(&self) -> Result<()> {
        self.upgrade()?.executor.start();
        Ok(())
    }

    pub(crate) fn remove_consumer(&self, id: &ConsumerId) {
        if let Some(core) = self.core.upgrade() {
            core.consumers.remove(id);
            core.connection.remove_dispatcher(id);
        }
    }

    pub(crate) fn remove_producer(&self, id: &ProducerId) {
        if let Some(core) = self.core.upgrade() {
            core.producers.remove(id);
            core.connection.remove_producer_route(id);
        }
    }

    pub(crate) async fn transport_interruption_processing_complete(&self) {
        if let Some(core) = self.core.upgrade() {
            core.connection
                .transport_interruption_processing_complete()
                .await;
        }
    }

    pub(crate) fn async_send(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.connection.async_send())
    }

    pub(crate) fn always_sync_send(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.connection.always_sync_send())
    }

    pub(crate) fn report_async_error(&self, message: &str) {
        if let Some(core) = self.core.upgrade() {
            core.connection.report_async_error(message);
        }
    }
}

/// Configures a consumer before creation.
pub struct ConsumerBuilder {
    session: Arc<SessionCore>,
    destination: Option<Destination>,
    selector: Option<String>,
    subscription_name: Option<String>,
    no_local: bool,
    browser: bool,
    dispatch_async: bool,
    prefetch: Option<i32>,
    maximum_pending_message_limit: i32,
}

impl ConsumerBuilder {
    fn new(session: Arc<SessionCore>, destination: Option<Destination>) -> Self {
        Self {
            session,
            destination,
            selector: None,
            subscription_name: None,
            no_local: false,
            browser: false,
            dispatch_async: false,
            prefetch: None,
            maximum_pending_message_limit: 0,
        }
    }

    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Restrict delivery with a message selector expression.
    #[must_use]
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Make the subscription durable under `name`.
    #[must_use]
    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.subscription_name = Some(name.into());
        self
    }

    /// Suppress messages published through this consumer's own connection.
    #[must_use]
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Browse the queue without consuming.
    #[must_use]
    pub fn browser(mut self, browser: bool) -> Self {
        self.browser = browser;
        self
    }

    #[must_use]
    pub fn dispatch_async(mut self, dispatch_async: bool) -> Self {
        self.dispatch_async = dispatch_async;
        self
    }

    /// Override the prefetch credit; zero selects pull-mode.
    #[must_use]
    pub fn prefetch(mut self, prefetch: i32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    #[must_use]
    pub fn maximum_pending_message_limit(mut self, limit: i32) -> Self {
        self.maximum_pending_message_limit = limit;
        self
    }

    /// Register the consumer at the broker.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidDestination`] without a destination,
    /// [`WirebusError::InvalidUri`] for malformed destination options, and
    /// broker or transport errors from the registration.
    pub async fn build(self) -> Result<Arc<MessageConsumer>> {
        let session = Arc::clone(&self.session);
        session.create_consumer(self).await
    }
}

/// Configures a producer before creation.
pub struct ProducerBuilder {
    session: Arc<SessionCore>,
    destination: Option<Destination>,
    window_size: i32,
    send_timeout: Option<Duration>,
    transformer: Option<MessageTransformer>,
}

impl ProducerBuilder {
    fn new(session: Arc<SessionCore>, destination: Option<Destination>) -> Self {
        Self {
            session,
            destination,
            window_size: 0,
            send_timeout: None,
            transformer: None,
        }
    }

    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Bound asynchronous sends by a usage window of `size` bytes.
    #[must_use]
    pub fn window_size(mut self, size: i32) -> Self {
        self.window_size = size;
        self
    }

    /// Force synchronous sends bounded by `timeout`.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Transform every message before it is stamped and sent.
    #[must_use]
    pub fn transformer(
        mut self,
        transformer: impl Fn(crate::command::Message) -> crate::command::Message
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.transformer = Some(Box::new(transformer));
        self
    }

    /// Register the producer at the broker.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidDestination`] without a destination, or
    /// the transport error from the registration.
    pub async fn build(self) -> Result<Arc<MessageProducer>> {
        let session = Arc::clone(&self.session);
        session.create_producer(self).await
    }
}

/// A session created from a [`Connection`](crate::Connection).
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self { Self { core } }

    #[must_use]
    pub fn session_id(&self) -> &crate::command::SessionId { self.core.session_id() }

    #[must_use]
    pub fn ack_mode(&self) -> AckMode { self.core.ack_mode }

    #[must_use]
    pub fn is_transacted(&self) -> bool { self.core.ack_mode.is_transacted() }

    /// Start building a consumer for `destination`.
    #[must_use]
    pub fn consumer(&self, destination: Destination) -> ConsumerBuilder {
        ConsumerBuilder::new(Arc::clone(&self.core), Some(destination))
    }

    /// Start building a consumer with no destination yet.
    #[must_use]
    pub fn consumer_builder(&self) -> ConsumerBuilder {
        ConsumerBuilder::new(Arc::clone(&self.core), None)
    }

    /// Create a consumer with default options.
    ///
    /// # Errors
    ///
    /// As [`ConsumerBuilder::build`].
    pub async fn create_consumer(&self, destination: Destination) -> Result<Arc<MessageConsumer>> {
        self.consumer(destination).build().await
    }

    /// Start building a producer for `destination`.
    #[must_use]
    pub fn producer(&self, destination: Destination) -> ProducerBuilder {
        ProducerBuilder::new(Arc::clone(&self.core), Some(destination))
    }

    /// Start building a producer with no destination yet.
    #[must_use]
    pub fn producer_builder(&self) -> ProducerBuilder {
        ProducerBuilder::new(Arc::clone(&self.core), None)
    }

    /// Create a producer with default options.
    ///
    /// # Errors
    ///
    /// As [`ProducerBuilder::build`].
    pub async fn create_producer(&self, destination: Destination) -> Result<Arc<MessageProducer>> {
        self.producer(destination).build().await
    }

    /// Explicitly start the session's transaction.
    ///
    /// Transacted work begins the transaction lazily; this exists for
    /// callers that need the begin on the wire before any send or ack.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] on a non-transacted
    /// session.
    pub async fn begin(&self) -> Result<()> {
        self.require_transacted()?;
        self.core.context.begin().await.map(|_| ())
    }

    /// Commit the active transaction.
    ///
    /// Committing when no transacted work happened is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] on a non-transacted
    /// session, and [`WirebusError::TransactionRolledBack`] when the broker
    /// rejects the commit.
    pub async fn commit(&self) -> Result<()> {
        self.require_transacted()?;
        if !self.core.context.in_local_transaction() {
            return Ok(());
        }
        self.core.context.commit().await
    }

    /// Roll back the active transaction, re-queueing unacknowledged
    /// deliveries for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] on a non-transacted
    /// session.
    pub async fn rollback(&self) -> Result<()> {
        self.require_transacted()?;
        if !self.core.context.in_local_transaction() {
            return Ok(());
        }
        self.core.context.rollback().await
    }

    /// Remove a durable topic subscription by name.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidOperation`] when the connection has no
    /// client id, or the broker error from the removal.
    pub async fn unsubscribe(&self, subscription_name: &str) -> Result<()> {
        let connection = &self.core.connection;
        let client_id = connection
            .client_id()
            .ok_or(WirebusError::InvalidOperation(
                "unsubscribe requires a connection client id",
            ))?;
        connection
            .sync_request(
                Command::RemoveSubscriptionInfo(RemoveSubscriptionInfo {
                    connection_id: self.core.session_id().connection_id.clone(),
                    client_id,
                    subscription_name: subscription_name.to_owned(),
                }),
                None,
            )
            .await
            .map(|_| ())
    }

    /// Close the session, shutting down every child and telling the broker.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; teardown command failures are logged.
    pub async fn close(&self) -> Result<()> { self.core.close().await }

    fn require_transacted(&self) -> Result<()> {
        if self.is_transacted() {
            Ok(())
        } else {
            Err(WirebusError::InvalidOperation(
                "transaction operations require a transacted session",
            ))
        }
    }
}

/// Apply `consumer.`-prefixed destination options to the broker-side info and
/// `consumer.nms.`-prefixed ones to the consumer itself. Unknown keys are
/// ignored.
fn apply_destination_options(
    info: &mut ConsumerInfo,
    ignore_expiration: &mut bool,
    destination: &Destination,
) -> Result<()> {
    for (key, value) in destination.options_with_prefix("consumer.", &["consumer.nms."]) {
        match key.as_str() {
            "prefetchSize" => info.prefetch_size = parse_option(&key, &value)?,
            "maximumPendingMessageLimit" => {
                info.maximum_pending_message_limit = parse_option(&key, &value)?;
            }
            "dispatchAsync" => info.dispatch_async = parse_option(&key, &value)?,
            "noLocal" => info.no_local = parse_option(&key, &value)?,
            "exclusive" => info.exclusive = parse_option(&key, &value)?,
            "retroactive" => info.retroactive = parse_option(&key, &value)?,
            "priority" => info.priority = parse_option(&key, &value)?,
            _ => {}
        }
    }
    for (key, value) in destination.options_with_prefix("consumer.nms.", &[]) {
        match key.as_str() {
            "ignoreExpiration" => *ignore_expiration = parse_option(&key, &value)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        WirebusError::InvalidUri(format!("invalid value '{value}' for option '{key}'"))
    })
}
