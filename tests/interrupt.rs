//! Transport-interruption clearing.

mod common;

use common::{connect, dispatch_for, wait_until};
use wirebus::{AckMode, AckType, Destination};

#[tokio::test]
async fn interrupt_clears_the_channel_but_keeps_dispatched_messages() {
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

    for sequence in 1..=3 {
        harness.transport.dispatch(dispatch_for(&consumer, sequence)).await;
    }
    // One message reaches the application; a delivered ack is pending and
    // two messages sit in the channel.
    consumer
        .receive()
        .await
        .expect("receive should not fail")
        .expect("the first message should arrive");
    assert_eq!(consumer.pending_ack_kind(), Some(AckType::Delivered));

    harness.transport.interrupt().await;
    let transport = harness.transport.clone();
    wait_until("every consumer reports its clear complete", move || {
        transport.interruption_completions() == 1
    })
    .await;

    // The channel was drained, the stale credit hint dropped, and the
    // delivered-but-unacked message kept for the broker to resolve.
    assert!(
        consumer
            .receive_no_wait()
            .await
            .expect("receive should not fail")
            .is_none()
    );
    assert!(consumer.pending_ack_kind().is_none());
    assert_eq!(consumer.outstanding_deliveries(), 1);
}

#[tokio::test]
async fn interrupt_with_no_consumers_completes_immediately() {
    let harness = connect().await;
    let _session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");

    harness.transport.interrupt().await;
    assert_eq!(harness.transport.interruption_completions(), 1);
}
