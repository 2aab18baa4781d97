//! Transactional delivery: commit, rollback ordering, and the
//! begin-before-ack wire contract.

mod common;

use std::time::Duration;

use common::{connect_with, dispatch_for, message_id};
use wirebus::{
    AckMode,
    AckType,
    Command,
    Destination,
    RedeliveryPolicy,
    WirebusError,
    command::TransactionType,
};

async fn transacted_harness() -> common::Harness {
    connect_with(|builder| {
        builder.redelivery_policy(RedeliveryPolicy {
            initial_redelivery_delay: Duration::ZERO,
            ..RedeliveryPolicy::default()
        })
    })
    .await
}

fn transaction_types(commands: &[Command]) -> Vec<TransactionType> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::TransactionInfo(info) => Some(info.transaction_type),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn rollback_preserves_delivery_order() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(4)
        .build()
        .await
        .expect("consumer should create");

    for sequence in 1..=4 {
        harness.transport.dispatch(dispatch_for(&consumer, sequence)).await;
    }
    for _ in 1..=2 {
        consumer
            .receive()
            .await
            .expect("receive should not fail")
            .expect("a dispatched message should arrive");
    }

    session.rollback().await.expect("rollback should succeed");

    let acks = harness.transport.acks();
    assert!(
        acks.iter().all(|ack| ack.ack_type != AckType::Consumed),
        "a rolled-back transaction must not consume anything"
    );
    assert!(
        acks.iter().all(|ack| ack.ack_type != AckType::Redelivered),
        "no redelivered ack on the first attempt"
    );

    // Delivery restarts at the first message with its redelivery recorded.
    let redelivered = consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the rolled-back message should come back");
    let message = redelivered.message();
    assert_eq!(
        message.message_id.as_ref().map(|id| id.broker_sequence_id),
        Some(1)
    );
    assert!(message.redelivered);
    assert_eq!(message.redelivery_counter, 1);

    // A second rollback does announce the repeat to the broker.
    session.rollback().await.expect("rollback should succeed");
    assert!(
        harness
            .transport
            .acks()
            .iter()
            .any(|ack| ack.ack_type == AckType::Redelivered)
    );
}

#[tokio::test]
async fn commit_consumes_the_whole_transaction() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(10)
        .build()
        .await
        .expect("consumer should create");

    for sequence in 1..=2 {
        harness.transport.dispatch(dispatch_for(&consumer, sequence)).await;
    }
    for _ in 1..=2 {
        consumer
            .receive()
            .await
            .expect("receive should not fail")
            .expect("a dispatched message should arrive");
    }
    session.commit().await.expect("commit should succeed");

    let sent = harness.transport.sent();

    // The begin must hit the wire before any ack of the transaction.
    let begin_index = sent
        .iter()
        .position(|command| {
            matches!(
                command,
                Command::TransactionInfo(info)
                    if info.transaction_type == TransactionType::Begin
            )
        })
        .expect("a begin should have been sent");
    let first_ack_index = sent
        .iter()
        .position(|command| matches!(command, Command::MessageAck(_)))
        .expect("acks should have been sent");
    assert!(begin_index < first_ack_index);

    let consumed: Vec<_> = harness
        .transport
        .acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Consumed)
        .collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].first_message_id, Some(message_id(1)));
    assert_eq!(consumed[0].last_message_id, Some(message_id(2)));
    assert!(consumed[0].transaction_id.is_some());
    assert_eq!(consumer.outstanding_deliveries(), 0);
}

#[tokio::test]
async fn begin_then_rollback_is_just_the_paired_commands() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    harness.transport.clear_sent();

    session.begin().await.expect("begin should succeed");
    session.rollback().await.expect("rollback should succeed");

    let sent = harness.transport.sent();
    assert_eq!(
        transaction_types(&sent),
        vec![TransactionType::Begin, TransactionType::Rollback]
    );
    assert!(harness.transport.acks().is_empty());
}

#[tokio::test]
async fn committing_an_empty_transaction_sends_no_acks() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    harness.transport.clear_sent();

    session.begin().await.expect("begin should succeed");
    session.commit().await.expect("commit should succeed");

    assert_eq!(
        transaction_types(&harness.transport.sent()),
        vec![TransactionType::Begin, TransactionType::CommitOnePhase]
    );
    assert!(harness.transport.acks().is_empty());
}

#[tokio::test]
async fn commit_without_transacted_work_is_a_no_op() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    harness.transport.clear_sent();

    session.commit().await.expect("empty commit should succeed");
    assert!(harness.transport.sent().is_empty());
}

#[tokio::test]
async fn transaction_operations_require_a_transacted_session() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");

    assert!(matches!(
        session.commit().await,
        Err(WirebusError::InvalidOperation(_))
    ));
    assert!(matches!(
        session.rollback().await,
        Err(WirebusError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn rejected_commit_rolls_the_transaction_back() {
    let harness = transacted_harness().await;
    let session = harness
        .connection
        .create_session(AckMode::Transactional)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(10)
        .build()
        .await
        .expect("consumer should create");

    harness.transport.dispatch(dispatch_for(&consumer, 1)).await;
    consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("a dispatched message should arrive");

    harness.transport.set_responder(|command| match command {
        Command::TransactionInfo(info)
            if info.transaction_type == TransactionType::CommitOnePhase =>
        {
            Err(WirebusError::Broker("commit refused".into()))
        }
        _ => Ok(wirebus::Response::Ok),
    });

    assert!(matches!(
        session.commit().await,
        Err(WirebusError::TransactionRolledBack(_))
    ));

    // The rejection triggered the rollback path: the delivery comes back.
    let redelivered = consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the message should be redelivered");
    assert!(redelivered.message().redelivered);
}
