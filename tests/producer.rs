//! Producer send strategies and window flow control.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{connect, connect_with, wait_until};
use tokio::time::{Duration, timeout};
use wirebus::{
    AckMode,
    Command,
    Destination,
    Message,
    command::{ProducerAck, TransactionType},
};

fn sent_messages(commands: &[Command]) -> Vec<Message> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::Message(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn persistent_sends_are_synchronous_by_default() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .create_producer(Destination::queue("orders"))
        .await
        .expect("producer should create");

    producer
        .send(Message::new(Bytes::from_static(b"durable")))
        .await
        .expect("send should succeed");

    let requests = harness.transport.requests();
    assert!(
        requests
            .iter()
            .any(|command| matches!(command, Command::Message(_))),
        "a persistent send outside a transaction must wait for the broker"
    );
}

#[tokio::test]
async fn non_persistent_sends_are_fire_and_forget() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .create_producer(Destination::queue("orders"))
        .await
        .expect("producer should create");

    let mut message = Message::new(Bytes::from_static(b"volatile"));
    message.persistent = false;
    producer.send(message).await.expect("send should succeed");

    assert!(
        harness
            .transport
            .requests()
            .iter()
            .all(|command| !matches!(command, Command::Message(_))),
        "non-persistent sends go out one-way"
    );
    assert_eq!(sent_messages(&harness.transport.sent()).len(), 1);
}

#[tokio::test]
async fn transacted_sends_carry_the_transaction_and_follow_its_begin() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    let producer = session
        .create_producer(Destination::queue("orders"))
        .await
        .expect("producer should create");
    harness.transport.clear_sent();

    producer
        .send(Message::new(Bytes::from_static(b"inside-tx")))
        .await
        .expect("send should succeed");

    let sent = harness.transport.sent();
    let begin_index = sent
        .iter()
        .position(|command| {
            matches!(
                command,
                Command::TransactionInfo(info)
                    if info.transaction_type == TransactionType::Begin
            )
        })
        .expect("the lazy begin should be sent");
    let message_index = sent
        .iter()
        .position(|command| matches!(command, Command::Message(_)))
        .expect("the message should be sent");
    assert!(begin_index < message_index);

    let message = &sent_messages(&sent)[0];
    assert!(message.transaction_id.is_some());
    assert!(
        harness
            .transport
            .requests()
            .iter()
            .all(|command| !matches!(command, Command::Message(_))),
        "transacted sends are one-way even when persistent"
    );
}

#[tokio::test]
async fn message_ids_are_sequenced_per_producer() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .create_producer(Destination::queue("orders"))
        .await
        .expect("producer should create");

    for _ in 0..2 {
        producer
            .send(Message::new(Bytes::from_static(b"m")))
            .await
            .expect("send should succeed");
    }
    let sequences: Vec<i64> = sent_messages(&harness.transport.sent())
        .iter()
        .filter_map(|message| message.message_id.as_ref())
        .map(|id| id.producer_sequence_id)
        .collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
async fn transformer_rewrites_outbound_messages() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .producer(Destination::queue("orders"))
        .transformer(|mut message| {
            message
                .properties
                .insert("origin".into(), "edge-gateway".into());
            message
        })
        .build()
        .await
        .expect("producer should create");

    producer
        .send(Message::new(Bytes::from_static(b"m")))
        .await
        .expect("send should succeed");

    let message = &sent_messages(&harness.transport.sent())[0];
    assert_eq!(
        message.properties.get("origin").map(String::as_str),
        Some("edge-gateway")
    );
}

#[tokio::test]
async fn broker_uri_options_configure_the_connection() {
    let harness = connect_with(|builder| {
        builder
            .apply_uri_options("tcp://broker:61616?connection.asyncSend=true&unknown.key=1")
            .expect("options should parse")
    })
    .await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .create_producer(Destination::queue("orders"))
        .await
        .expect("producer should create");

    // asyncSend from the URI turns even persistent sends into one-ways.
    producer
        .send(Message::new(Bytes::from_static(b"durable")))
        .await
        .expect("send should succeed");
    assert!(
        harness
            .transport
            .requests()
            .iter()
            .all(|command| !matches!(command, Command::Message(_)))
    );

    let malformed = wirebus::Connection::builder(std::sync::Arc::new(
        wirebus::MockTransport::new(),
    ))
    .apply_uri_options("tcp://broker:61616?connection.asyncSend=sometimes");
    assert!(matches!(
        malformed,
        Err(wirebus::WirebusError::InvalidUri(_))
    ));
}

#[tokio::test]
async fn producer_window_blocks_until_the_broker_acks() {
    let harness = connect_with(|builder| builder.async_send(true)).await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let producer = session
        .producer(Destination::queue("orders"))
        .window_size(100)
        .build()
        .await
        .expect("producer should create");

    // The first send overfills the 100-byte window (64 bytes of header
    // overhead plus the body), so the second blocks.
    let body = Bytes::from(vec![b'x'; 50]);
    producer
        .send(Message::new(body.clone()))
        .await
        .expect("first send should succeed");
    let mut blocked = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.send(Message::new(Bytes::from_static(b"next"))).await })
    };
    assert!(
        timeout(Duration::from_millis(100), &mut blocked)
            .await
            .is_err(),
        "the window should hold the second send back"
    );

    let first_size = 64 + body.len();
    harness
        .transport
        .inject(Command::ProducerAck(ProducerAck {
            producer_id: producer.info().producer_id.clone(),
            size: first_size,
        }))
        .await;

    timeout(Duration::from_secs(1), blocked)
        .await
        .expect("the send should unblock after the producer ack")
        .expect("send task should not panic")
        .expect("send should succeed");

    let transport = harness.transport.clone();
    wait_until("both messages reach the transport", move || {
        sent_messages(&transport.sent()).len() == 2
    })
    .await;
}
