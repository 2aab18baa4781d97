//! Shared harness for the end-to-end scenarios: a connection wired to the
//! scripted mock transport, plus dispatch and listener helpers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Duration, Instant, sleep};
use wirebus::{
    Connection,
    ConnectionBuilder,
    ConnectionId,
    Message,
    MessageConsumer,
    MessageDispatch,
    MessageId,
    MessageListener,
    MockTransport,
    ProducerId,
    ReceivedMessage,
};

pub struct Harness {
    pub transport: MockTransport,
    pub connection: Connection,
}

/// Establish and start a connection over a fresh mock transport.
#[allow(dead_code)]
pub async fn connect() -> Harness { connect_with(|builder| builder).await }

pub async fn connect_with(
    configure: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder,
) -> Harness {
    let transport = MockTransport::new();
    let builder = Connection::builder(Arc::new(transport.clone()));
    let connection = configure(builder)
        .establish()
        .await
        .expect("connection should establish against the mock transport");
    connection.start().await;
    transport.clear_sent();
    Harness {
        transport,
        connection,
    }
}

pub fn message_id(sequence: i64) -> MessageId {
    MessageId {
        producer_id: ProducerId {
            connection_id: ConnectionId::new("ID:producer"),
            session_id: 1,
            value: 1,
        },
        producer_sequence_id: sequence,
        broker_sequence_id: sequence,
    }
}

/// A broker dispatch of message `sequence` for `consumer`.
pub fn dispatch_for(consumer: &MessageConsumer, sequence: i64) -> MessageDispatch {
    let mut message = Message::new(Bytes::from(format!("payload-{sequence}")));
    message.message_id = Some(message_id(sequence));
    MessageDispatch {
        consumer_id: consumer.info().consumer_id.clone(),
        destination: consumer.info().destination.clone(),
        message: Some(message),
        redelivery_counter: 0,
    }
}

/// The broker's "nothing available" marker terminating an idle pull.
#[allow(dead_code)]
pub fn empty_dispatch_for(consumer: &MessageConsumer) -> MessageDispatch {
    MessageDispatch {
        consumer_id: consumer.info().consumer_id.clone(),
        destination: consumer.info().destination.clone(),
        message: None,
        redelivery_counter: 0,
    }
}

/// Poll until `condition` holds, panicking after two seconds.
#[allow(dead_code)]
pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting until {description}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

/// Listener recording broker sequences, optionally failing selected
/// deliveries once.
#[derive(Clone, Default)]
pub struct RecordingListener {
    received: Arc<Mutex<Vec<i64>>>,
    fail_once_on: Arc<Mutex<Vec<i64>>>,
}

#[allow(dead_code)]
impl RecordingListener {
    pub fn new() -> Self { Self::default() }

    /// Fail the next delivery of message `sequence`, then succeed.
    pub fn fail_once_on(&self, sequence: i64) {
        self.fail_once_on
            .lock()
            .expect("listener lock should not be poisoned")
            .push(sequence);
    }

    pub fn received(&self) -> Vec<i64> {
        self.received
            .lock()
            .expect("listener lock should not be poisoned")
            .clone()
    }

    pub fn count(&self) -> usize {
        self.received
            .lock()
            .expect("listener lock should not be poisoned")
            .len()
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn on_message(
        &self,
        message: ReceivedMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sequence = message
            .message()
            .message_id
            .as_ref()
            .map_or(-1, |id| id.broker_sequence_id);
        {
            let mut failures = self
                .fail_once_on
                .lock()
                .expect("listener lock should not be poisoned");
            if let Some(position) = failures.iter().position(|&failing| failing == sequence) {
                failures.remove(position);
                return Err(format!("scripted failure for message {sequence}").into());
            }
        }
        self.received
            .lock()
            .expect("listener lock should not be poisoned")
            .push(sequence);
        Ok(())
    }
}
