//! Redelivery policy: poison cutoff and delayed redelivery starts.

mod common;

use std::time::Duration;

use common::{connect_with, dispatch_for, message_id};
use wirebus::{AckMode, AckType, Destination, RedeliveryPolicy};

async fn harness_with_policy(policy: RedeliveryPolicy) -> common::Harness {
    connect_with(|builder| builder.redelivery_policy(policy)).await
}

#[tokio::test]
async fn poison_ack_exactly_one_past_the_redelivery_limit() {
    let harness = harness_with_policy(RedeliveryPolicy {
        maximum_redeliveries: 3,
        initial_redelivery_delay: Duration::ZERO,
        ..RedeliveryPolicy::default()
    })
    .await;
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

    // Three rollbacks sit exactly at the limit: the message keeps coming
    // back and is never poisoned.
    for attempt in 1..=3 {
        let message = consumer
            .receive()
            .await
            .expect("receive should not fail")
            .expect("the message should be delivered");
        assert_eq!(message.message().redelivery_counter, attempt - 1);
        session.rollback().await.expect("rollback should succeed");
    }
    assert!(
        harness
            .transport
            .acks()
            .iter()
            .all(|ack| ack.ack_type != AckType::Poison)
    );

    // The fourth rollback crosses the limit: poison, and no re-enqueue.
    consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the message should be delivered a fourth time");
    session.rollback().await.expect("rollback should succeed");

    let poison: Vec<_> = harness
        .transport
        .acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Poison)
        .collect();
    assert_eq!(poison.len(), 1, "a poison ack is sent at most once per id");
    assert_eq!(poison[0].first_message_id, Some(message_id(1)));
    assert_eq!(poison[0].last_message_id, Some(message_id(1)));
    assert_eq!(poison[0].message_count, 1);

    let gone = consumer
        .receive_timeout(Duration::from_millis(50))
        .await
        .expect("receive should not fail");
    assert!(gone.is_none(), "a poisoned message is not re-enqueued");
}

#[tokio::test(start_paused = true)]
async fn redelivery_waits_for_the_configured_delay() {
    let harness = harness_with_policy(RedeliveryPolicy {
        maximum_redeliveries: -1,
        initial_redelivery_delay: Duration::from_millis(200),
        ..RedeliveryPolicy::default()
    })
    .await;
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
        .expect("the message should be delivered");
    session.rollback().await.expect("rollback should succeed");

    // The channel is stopped until the deferred start fires.
    let early = consumer
        .receive_no_wait()
        .await
        .expect("receive should not fail");
    assert!(early.is_none(), "no delivery before the redelivery delay");

    // Under a paused clock this wait resolves by auto-advancing to the
    // scheduled start, proving the delayed task is what resumes delivery.
    let redelivered = consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the message should come back after the delay");
    assert!(redelivered.message().redelivered);
}

#[tokio::test]
async fn exponential_backoff_grows_the_recorded_delay() {
    let policy = RedeliveryPolicy {
        maximum_redeliveries: -1,
        initial_redelivery_delay: Duration::from_millis(10),
        use_exponential_backoff: true,
        backoff_multiplier: 3.0,
        ..RedeliveryPolicy::default()
    };
    assert_eq!(policy.redelivery_delay(0), Duration::from_millis(10));
    assert_eq!(policy.redelivery_delay(2), Duration::from_millis(90));
}
