//! Integration tests for the pull message source against the memory transport

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use proven_subscriber::{
    AckId, MessageCallback, MessageSource, MessageSourceError, PullTransport, ReceivedMessage,
    SessionState,
};
use proven_subscriber_memory::{Error as MemoryError, MemoryTransport};
use proven_subscriber_pull::{
    Error, FlowControlSnapshot, LeaseOptions, PullMessageSource, PullSourceOptions,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn options(max_messages: usize, max_bytes: usize) -> PullSourceOptions {
    let mut options = PullSourceOptions::default();
    options.flow_control.max_outstanding_messages = max_messages;
    options.flow_control.max_outstanding_bytes = max_bytes;
    options
}

fn new_source(
    max_messages: usize,
    max_bytes: usize,
) -> (PullMessageSource<MemoryTransport>, MemoryTransport) {
    let transport = MemoryTransport::new();
    let source = PullMessageSource::new(transport.clone(), options(max_messages, max_bytes))
        .expect("valid options");

    (source, transport)
}

fn collecting_callback() -> (MessageCallback, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: MessageCallback = Arc::new(move |message| {
        let _ = tx.send(message);
    });

    (callback, rx)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Callback dropped")
}

async fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) {
    let received = timeout(Duration::from_millis(100), rx.recv()).await;

    assert!(
        matches!(received, Err(_) | Ok(None)),
        "unexpected delivery: {received:?}"
    );
}

#[tokio::test]
async fn test_single_slot_flow_control_scenario() {
    let _ = tracing_subscriber::fmt::try_init();

    let (source, transport) = new_source(1, 1000);
    transport.publish_sized("first", 400);
    transport.publish_sized("second", 400);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);

    source.read(5);
    let first = next_delivery(&mut rx).await;
    assert_eq!(first.size(), 400);
    assert_eq!(first.payload(), &Bytes::from("first"));
    assert_no_delivery(&mut rx).await;

    source.read(1);
    assert_no_delivery(&mut rx).await;

    source
        .ack_message(first.ack_id().clone(), 400)
        .await
        .expect("ack should succeed");
    assert_eq!(source.outstanding(), FlowControlSnapshot::default());

    source.read(1);
    let second = next_delivery(&mut rx).await;
    assert_eq!(second.payload(), &Bytes::from("second"));
    assert_no_delivery(&mut rx).await;

    source.shutdown().await;
}

#[tokio::test]
async fn test_ack_releases_exact_capacity() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("a", 50);
    transport.publish_sized("b", 70);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(2);

    let a = next_delivery(&mut rx).await;
    let b = next_delivery(&mut rx).await;
    assert_eq!(
        source.outstanding(),
        FlowControlSnapshot {
            bytes: 120,
            messages: 2
        }
    );

    source.ack_message(a.ack_id().clone(), 50).await.unwrap();
    assert_eq!(
        source.outstanding(),
        FlowControlSnapshot {
            bytes: 70,
            messages: 1
        }
    );

    source.nack_message(b.ack_id().clone(), 70).await.unwrap();
    assert_eq!(source.outstanding(), FlowControlSnapshot::default());
    assert_eq!(source.invariant_violations(), 0);

    source.shutdown().await;
}

#[tokio::test]
async fn test_nack_unknown_ack_id_changes_nothing() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("held", 30);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let _held = next_delivery(&mut rx).await;

    let before = source.outstanding();
    let result = source.nack_message(AckId::new("unknown"), 10).await;

    assert_matches!(result, Err(Error::UnknownAckId(ref id)) if id.as_str() == "unknown");
    assert!(result.unwrap_err().is_unknown_ack_id());
    assert_eq!(source.outstanding(), before);
    assert!(transport.nacked().is_empty());

    source.shutdown().await;
}

#[tokio::test]
async fn test_second_start_keeps_first_callback() {
    let (source, transport) = new_source(10, 1000);
    transport.publish("one");
    transport.publish("two");

    let (first, mut rx) = collecting_callback();
    let second_calls = Arc::new(AtomicUsize::new(0));
    let second: MessageCallback = Arc::new({
        let second_calls = second_calls.clone();
        move |_| {
            second_calls.fetch_add(1, Ordering::SeqCst);
        }
    });

    source.start(first);
    source.start(second);
    assert_eq!(source.state(), SessionState::Started);

    source.read(2);
    next_delivery(&mut rx).await;
    next_delivery(&mut rx).await;

    assert_eq!(second_calls.load(Ordering::SeqCst), 0);

    source.shutdown().await;
}

#[tokio::test]
async fn test_no_delivery_before_start() {
    let (source, transport) = new_source(10, 1000);
    transport.publish("waiting");

    source.read(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.pull_count(), 0);
    assert_eq!(transport.queued(), 1);

    source.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (source, _transport) = new_source(10, 1000);
    let (callback, _rx) = collecting_callback();
    source.start(callback);

    tokio::join!(source.shutdown(), source.shutdown());
    assert_eq!(source.state(), SessionState::Shutdown);

    source.shutdown().await;
    source.shutdown().await;
    assert_eq!(source.state(), SessionState::Shutdown);
}

#[tokio::test]
async fn test_operations_after_shutdown_fail_closed() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("late ack", 10);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let message = next_delivery(&mut rx).await;

    source.shutdown().await;

    let ack = source.ack_message(message.ack_id().clone(), 10).await;
    assert_matches!(ack, Err(Error::Closed));
    assert!(ack.unwrap_err().is_closed());

    let nack = source.nack_message(message.ack_id().clone(), 10).await;
    assert_matches!(nack, Err(Error::Closed));

    assert!(transport.acknowledged().is_empty());
}

#[tokio::test]
async fn test_no_delivery_after_shutdown() {
    let (source, transport) = new_source(10, 1000);
    let (callback, mut rx) = collecting_callback();
    source.start(callback);

    // Nothing is published, so the pull is still waiting when shutdown runs.
    source.read(10);
    tokio::time::sleep(Duration::from_millis(20)).await;

    source.shutdown().await;
    transport.publish("too late");
    source.read(1);

    // The callback has been released, closing the channel.
    assert_matches!(
        timeout(Duration::from_millis(100), rx.recv()).await,
        Ok(None)
    );
    assert_eq!(transport.queued(), 1);
}

#[tokio::test]
async fn test_read_zero_is_a_no_op() {
    let (source, transport) = new_source(10, 1000);
    transport.publish("unrequested");

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(0);

    assert_no_delivery(&mut rx).await;
    assert_eq!(transport.pull_count(), 0);

    source.shutdown().await;
}

#[tokio::test]
async fn test_read_demand_does_not_accumulate() {
    let (source, transport) = new_source(1, 1000);
    transport.publish("one");

    let (callback, mut rx) = collecting_callback();
    source.start(callback);

    // Flow control ends this grant after the first delivery; the remaining
    // demand of two is dropped.
    source.read(3);
    let one = next_delivery(&mut rx).await;
    assert_no_delivery(&mut rx).await;

    source.ack_message(one.ack_id().clone(), one.size()).await.unwrap();
    transport.publish("two");
    assert_no_delivery(&mut rx).await;

    source.read(1);
    let two = next_delivery(&mut rx).await;
    assert_eq!(two.payload(), &Bytes::from("two"));

    source.shutdown().await;
}

#[tokio::test]
async fn test_separate_reads_are_served_in_order() {
    let (source, transport) = new_source(10, 1000);
    let (callback, mut rx) = collecting_callback();
    source.start(callback);

    source.read(1);
    source.read(2);

    for payload in ["a", "b", "c", "d"] {
        transport.publish(payload);
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_delivery(&mut rx).await);
    }
    assert_no_delivery(&mut rx).await;

    assert_eq!(received.len(), 3);
    assert_eq!(transport.queued(), 1);

    source.shutdown().await;
}

#[tokio::test]
async fn test_pull_failure_keeps_grant_and_retries() {
    let _ = tracing_subscriber::fmt::try_init();

    let (source, transport) = new_source(10, 1000);
    transport.publish("after failure");
    transport.fail_next_pulls(2);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);

    source.read(1);
    let message = next_delivery(&mut rx).await;
    assert_eq!(message.payload(), &Bytes::from("after failure"));
    assert_eq!(transport.pull_count(), 3);
    assert_eq!(source.outstanding().messages, 1);

    // The grant is complete; nothing more is pulled for it.
    transport.publish("unrequested");
    assert_no_delivery(&mut rx).await;

    source.shutdown().await;
}

#[derive(Clone, Default)]
struct EmptyTransport {
    pulls: Arc<AtomicUsize>,
}

#[async_trait]
impl PullTransport for EmptyTransport {
    type Error = MemoryError;

    async fn pull(&self, _max_messages: usize) -> Result<Vec<ReceivedMessage>, Self::Error> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _ack_id: &AckId) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn negative_acknowledge(&self, _ack_id: &AckId) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[tokio::test]
async fn test_empty_pulls_back_off_and_shutdown_completes() {
    let transport = EmptyTransport::default();
    let source = PullMessageSource::new(transport.clone(), PullSourceOptions::default())
        .expect("valid options");

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let pulls = transport.pulls.load(Ordering::SeqCst);
    assert!((1..=3).contains(&pulls), "pulled {pulls} times");

    timeout(Duration::from_secs(2), source.shutdown())
        .await
        .expect("shutdown should complete while pulls come back empty");
    assert_eq!(source.state(), SessionState::Shutdown);
    assert_no_delivery(&mut rx).await;
}

#[tokio::test]
async fn test_transport_ack_failure_still_resolves_locally() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("flaky", 25);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let message = next_delivery(&mut rx).await;

    transport.fail_acknowledgments(true);
    let result = source.ack_message(message.ack_id().clone(), 25).await;
    assert_matches!(result, Err(Error::Transport(_)));
    assert_eq!(source.outstanding(), FlowControlSnapshot::default());

    transport.fail_acknowledgments(false);
    let retry = source.ack_message(message.ack_id().clone(), 25).await;
    assert_matches!(retry, Err(Error::UnknownAckId(_)));

    source.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_resolution_of_same_ack_id() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("once", 10);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let message = next_delivery(&mut rx).await;

    let first = source.ack_message(message.ack_id().clone(), 10);
    let second = source.ack_message(message.ack_id().clone(), 10);

    assert_matches!(second.await, Err(Error::UnknownAckId(_)));
    assert!(first.await.is_ok());
    assert_eq!(transport.acknowledged(), vec![message.ack_id().clone()]);

    source.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_acks_for_distinct_ack_ids() {
    let (source, transport) = new_source(10, 10_000);
    for i in 0..10 {
        transport.publish_sized(format!("message {i}"), 100);
    }

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(10);

    let mut messages = Vec::new();
    for _ in 0..10 {
        messages.push(next_delivery(&mut rx).await);
    }

    let acks = messages
        .iter()
        .map(|message| source.ack_message(message.ack_id().clone(), message.size()));
    let results = join_all(acks).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(source.outstanding(), FlowControlSnapshot::default());
    assert_eq!(transport.acknowledged().len(), 10);

    source.shutdown().await;
}

#[tokio::test]
async fn test_dropped_ack_future_still_acknowledges() {
    let (source, transport) = new_source(10, 1000);
    transport.publish_sized("fire and forget", 10);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let message = next_delivery(&mut rx).await;

    drop(source.ack_message(message.ack_id().clone(), 10));

    // Shutdown waits for submitted acknowledgments.
    source.shutdown().await;

    assert_eq!(transport.acknowledged(), vec![message.ack_id().clone()]);
    assert_eq!(source.outstanding(), FlowControlSnapshot::default());
}

#[tokio::test]
async fn test_capacity_invariant_under_load() {
    const MAX_MESSAGES: usize = 3;
    const MAX_BYTES: usize = 250;

    let (source, transport) = new_source(MAX_MESSAGES, MAX_BYTES);
    for i in 0..30 {
        transport.publish_sized(format!("load {i}"), 40 + (i % 4) * 20);
    }

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(MAX_MESSAGES);

    let mut resolved = 0;
    while resolved < 30 {
        let message = next_delivery(&mut rx).await;

        let outstanding = source.outstanding();
        assert!(outstanding.messages <= MAX_MESSAGES);
        assert!(outstanding.bytes <= MAX_BYTES);

        // Every fifth message is nacked and comes back later under a new ack id.
        let size = message.size();
        if resolved % 5 == 0 {
            source.nack_message(message.ack_id().clone(), size).await.unwrap();
        } else {
            source.ack_message(message.ack_id().clone(), size).await.unwrap();
        }

        resolved += 1;
        source.read(1);
    }

    assert_eq!(source.invariant_violations(), 0);
    source.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_nacks_buffered_messages() {
    let (source, transport) = new_source(10, 500);
    transport.publish_sized("fits", 400);
    transport.publish_sized("buffered", 400);

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(2);

    let delivered = next_delivery(&mut rx).await;
    assert_no_delivery(&mut rx).await;
    assert_eq!(source.buffered(), 1);

    source.shutdown().await;

    let nacked = transport.nacked();
    assert_eq!(nacked.len(), 1);
    assert_ne!(&nacked[0], delivered.ack_id());
    assert_eq!(source.buffered(), 0);
    assert_eq!(transport.queued(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leases_are_extended_until_max_lease() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let options = PullSourceOptions {
        lease: Some(LeaseOptions {
            ack_deadline_secs: 10,
            max_lease_secs: 30,
            refresh_period_secs: 5,
        }),
        ..options(10, 1000)
    };
    let source = PullMessageSource::new(transport.clone(), options).unwrap();
    transport.publish("slow");

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let message = next_delivery(&mut rx).await;

    tokio::time::sleep(Duration::from_secs(12)).await;
    let early = transport.extended();
    assert!(!early.is_empty());
    assert!(
        early
            .iter()
            .all(|(id, deadline)| id == message.ack_id() && *deadline == Duration::from_secs(10))
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    let settled = transport.extended().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.extended().len(), settled);

    source.ack_message(message.ack_id().clone(), message.size()).await.unwrap();
    source.shutdown().await;
}

#[tokio::test]
async fn test_nacked_message_is_redelivered_under_new_ack_id() {
    let (source, transport) = new_source(10, 1000);
    transport.publish("retry");

    let (callback, mut rx) = collecting_callback();
    source.start(callback);
    source.read(1);
    let first = next_delivery(&mut rx).await;

    source
        .nack_message(first.ack_id().clone(), first.size())
        .await
        .unwrap();

    source.read(1);
    let second = next_delivery(&mut rx).await;

    assert_eq!(second.payload(), first.payload());
    assert_ne!(second.ack_id(), first.ack_id());

    source.shutdown().await;
}
