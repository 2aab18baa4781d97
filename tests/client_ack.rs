//! Client-acknowledge and individual-acknowledge scenarios.

mod common;

use common::{connect, dispatch_for, message_id};
use wirebus::{AckMode, AckType, Destination};

#[tokio::test]
async fn client_ack_coalesces_into_one_consumed_range() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::ClientAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(10)
        .build()
        .await
        .expect("consumer should create");

    for sequence in 1..=6 {
        harness.transport.dispatch(dispatch_for(&consumer, sequence)).await;
    }
    let mut last = None;
    for _ in 1..=6 {
        let message = consumer
            .receive()
            .await
            .expect("receive should not fail")
            .expect("a dispatched message should arrive");
        last = Some(message);
    }

    let last = last.expect("six messages should have been received");
    last.acknowledge().await.expect("acknowledge should succeed");

    let consumed: Vec<_> = harness
        .transport
        .acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Consumed)
        .collect();
    assert_eq!(consumed.len(), 1, "one coalesced consumed ack expected");
    assert_eq!(consumed[0].first_message_id, Some(message_id(1)));
    assert_eq!(consumed[0].last_message_id, Some(message_id(6)));
    assert_eq!(consumed[0].message_count, 6);
    assert_eq!(consumer.outstanding_deliveries(), 0);
}

#[tokio::test]
async fn individual_ack_covers_exactly_one_message() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::IndividualAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(10)
        .build()
        .await
        .expect("consumer should create");

    for sequence in 1..=3 {
        harness.transport.dispatch(dispatch_for(&consumer, sequence)).await;
    }
    let mut received = Vec::new();
    for _ in 1..=3 {
        received.push(
            consumer
                .receive()
                .await
                .expect("receive should not fail")
                .expect("a dispatched message should arrive"),
        );
    }

    received[1]
        .acknowledge()
        .await
        .expect("individual acknowledge should succeed");

    let individual: Vec<_> = harness
        .transport
        .acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Individual)
        .collect();
    assert_eq!(individual.len(), 1);
    assert_eq!(individual[0].first_message_id, Some(message_id(2)));
    assert_eq!(individual[0].last_message_id, Some(message_id(2)));
    assert_eq!(individual[0].message_count, 1);
    assert_eq!(consumer.outstanding_deliveries(), 2);
}

#[tokio::test]
async fn expired_messages_are_skipped_and_credited() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(10)
        .build()
        .await
        .expect("consumer should create");

    let mut expired = dispatch_for(&consumer, 1);
    if let Some(message) = expired.message.as_mut() {
        // An expiration far in the past.
        message.expiration = 1;
    }
    harness.transport.dispatch(expired).await;
    harness.transport.dispatch(dispatch_for(&consumer, 2)).await;

    let message = consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the live message should arrive");
    assert_eq!(
        message.message().message_id.as_ref().map(|id| id.broker_sequence_id),
        Some(2)
    );

    let consumed: Vec<_> = harness
        .transport
        .acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Consumed)
        .collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].first_message_id, Some(message_id(2)));
    // The expired message was consumed implicitly with a delivered ack.
    assert_eq!(consumer.pending_ack_kind(), Some(AckType::Delivered));
    assert_eq!(consumer.outstanding_deliveries(), 0);
}
