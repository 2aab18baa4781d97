//! Zero-prefetch pull-mode receives.

mod common;

use std::sync::Arc;

use common::{RecordingListener, connect, dispatch_for, empty_dispatch_for, wait_until};
use tokio::time::Duration;
use wirebus::{AckMode, Destination, WirebusError};

#[tokio::test]
async fn timed_receive_sends_one_pull_with_the_broker_timeout() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(0)
        .build()
        .await
        .expect("consumer should create");

    let receiver = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.receive_timeout(Duration::from_millis(500)).await })
    };
    let transport = harness.transport.clone();
    wait_until("the pull request reaches the broker", move || {
        !transport.pulls().is_empty()
    })
    .await;

    let pulls = harness.transport.pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].timeout, 500);
    assert_eq!(pulls[0].consumer_id, consumer.info().consumer_id);

    harness.transport.dispatch(dispatch_for(&consumer, 1)).await;
    let received = receiver
        .await
        .expect("receiver task should not panic")
        .expect("receive should not fail");
    assert!(received.is_some(), "the pulled message should be returned");
}

#[tokio::test]
async fn empty_pull_reply_returns_none() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(0)
        .build()
        .await
        .expect("consumer should create");

    let receiver = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.receive_no_wait().await })
    };
    let transport = harness.transport.clone();
    wait_until("the immediate pull reaches the broker", move || {
        !transport.pulls().is_empty()
    })
    .await;
    assert_eq!(harness.transport.pulls()[0].timeout, -1);

    harness.transport.dispatch(empty_dispatch_for(&consumer)).await;
    let received = receiver
        .await
        .expect("receiver task should not panic")
        .expect("receive should not fail");
    assert!(received.is_none(), "an empty pull reply yields no message");
}

#[tokio::test]
async fn zero_prefetch_rejects_listeners() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(0)
        .build()
        .await
        .expect("consumer should create");

    let result = consumer
        .set_listener(Arc::new(RecordingListener::new()))
        .await;
    assert!(matches!(result, Err(WirebusError::InvalidOperation(_))));
}

#[tokio::test]
async fn zero_timeout_receive_polls_exactly_once() {
    let harness = connect().await;
    let session = harness
        .connection
        .create_session(AckMode::AutoAcknowledge)
        .await
        .expect("session should create");
    let consumer = session
        .consumer(Destination::queue("orders"))
        .prefetch(5)
        .build()
        .await
        .expect("consumer should create");

    let received = consumer
        .receive_no_wait()
        .await
        .expect("receive should not fail");
    assert!(received.is_none());
    assert!(
        harness.transport.pulls().is_empty(),
        "prefetched consumers never pull"
    );
}
