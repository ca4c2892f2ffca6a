//! Integration tests for the consumption loop.
//!
//! Every test drives a real `Consumer` against the in-memory broker, so
//! ordering, commit and cancellation behaviour is observed end to end.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use kafka_consumer_core::{
    CancelCause, CancellationContext, HandlerError, SubscriptionConfig, TopicPartition,
};
use kafka_consumer_runtime::{
    Consumer, ConsumerConfig, ConsumerError, ConsumerHandle, FailurePolicy, RetryPolicy,
};
use kafka_consumer_testing::{
    CapturedEvents, InMemoryBroker, RecordingHandler, init_tracing, wait_until,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

// ============================================================================
// Test Fixtures
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn config(topics: &[&str]) -> ConsumerConfig {
    ConsumerConfig::new(SubscriptionConfig::new(
        vec!["127.0.0.1:9092".to_string()],
        "test-group",
        topics.iter().map(ToString::to_string).collect(),
    ))
    .with_poll_timeout(Duration::from_millis(50))
    .with_retry_policy(
        RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(10))
            .build(),
    )
}

async fn start(
    broker: &InMemoryBroker,
    config: ConsumerConfig,
    handler: &RecordingHandler,
) -> (CancellationContext, ConsumerHandle) {
    init_tracing();
    let ctx = CancellationContext::new();
    let consumer = Consumer::new(config, Arc::new(broker.clone()));
    let handle = consumer
        .start(ctx.clone(), Arc::new(handler.clone()))
        .await
        .unwrap();
    (ctx, handle)
}

fn cancel(ctx: &CancellationContext) {
    ctx.cancel(CancelCause::Requested("test".to_string()));
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn failed_message_is_skipped_and_left_uncommitted() {
    let broker = InMemoryBroker::new();
    for i in 0..5 {
        broker.publish("orders", 0, format!("order-{i}"));
    }
    let handler = RecordingHandler::new()
        .failing_with(2, HandlerError::Decode("expected JSON object".to_string()));
    let logs = CapturedEvents::new();
    let _guard = logs.set_default();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    assert!(wait_until(WAIT, || broker.commits().len() == 4).await);
    cancel(&ctx);
    let report = handle.wait().await.unwrap();

    assert_eq!(handler.offsets(), vec![0, 1, 2, 3, 4]);
    assert_eq!(broker.committed_offsets("orders", 0), vec![0, 1, 3, 4]);
    assert_eq!(report.stats.handled, 4);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.committed, 4);
    assert!(report.halted_partitions.is_empty());
    assert_eq!(broker.closed_subscriptions(), 1);

    let errors = logs.at_level(Level::ERROR);
    assert_eq!(errors.len(), 1, "expected one error event, got {errors:?}");
    assert_eq!(errors[0].field("topic"), Some("orders"));
    assert_eq!(errors[0].field("partition"), Some("0"));
    assert_eq!(errors[0].field("offset"), Some("2"));
    assert!(errors[0].field("error").unwrap().contains("expected JSON object"));
}

#[tokio::test]
async fn start_returns_before_any_message_is_handled() {
    let broker = InMemoryBroker::new();
    broker.publish("orders", 0, "first");
    let handler = RecordingHandler::gated();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    // The handler is blocked, yet start has already returned.
    assert!(!handle.is_finished());
    assert!(wait_until(WAIT, || handler.call_count() == 1).await);
    assert!(broker.commits().is_empty());

    handler.release(1);
    assert!(wait_until(WAIT, || broker.commits().len() == 1).await);

    cancel(&ctx);
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn cancellation_lets_the_message_in_flight_finish() {
    let broker = InMemoryBroker::new();
    for i in 0..5 {
        broker.publish("orders", 0, format!("order-{i}"));
    }
    let handler = RecordingHandler::gated();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    handler.release(3);
    assert!(wait_until(WAIT, || handler.call_count() == 4).await);

    cancel(&ctx);
    handler.release(10);
    let report = handle.wait().await.unwrap();

    assert_eq!(handler.offsets(), vec![0, 1, 2, 3]);
    assert_eq!(broker.committed_offsets("orders", 0), vec![0, 1, 2, 3]);
    assert_eq!(report.stats.handled, 4);
}

#[tokio::test]
async fn idle_consumer_stops_on_cancellation() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::new();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;
    cancel(&ctx);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.stats.handled, 0);
    assert_eq!(handler.call_count(), 0);
    assert_eq!(broker.closed_subscriptions(), 1);
}

#[tokio::test]
async fn partitions_progress_independently() {
    let broker = InMemoryBroker::new();
    for i in 0..3 {
        broker.publish("orders", 0, format!("p0-{i}"));
        broker.publish("orders", 1, format!("p1-{i}"));
    }
    let handler = RecordingHandler::new().failing_at_partition(0, 0);

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    assert!(wait_until(WAIT, || broker.commits().len() == 5).await);
    cancel(&ctx);
    handle.wait().await.unwrap();

    assert_eq!(handler.offsets_for(0), vec![0, 1, 2]);
    assert_eq!(handler.offsets_for(1), vec![0, 1, 2]);
    assert_eq!(broker.committed_offsets("orders", 0), vec![1, 2]);
    assert_eq!(broker.committed_offsets("orders", 1), vec![0, 1, 2]);
}

#[tokio::test]
async fn halt_policy_stops_only_the_failing_partition() {
    let broker = InMemoryBroker::new();
    for i in 0..3 {
        broker.publish("orders", 0, format!("p0-{i}"));
        broker.publish("orders", 1, format!("p1-{i}"));
    }
    let handler = RecordingHandler::new().failing_at_partition(0, 1);
    let config = config(&["orders"]).with_failure_policy(FailurePolicy::HaltPartition);

    let (ctx, handle) = start(&broker, config, &handler).await;

    assert!(
        wait_until(WAIT, || {
            broker.committed_offsets("orders", 1).len() == 3 && handler.offsets_for(0).len() == 2
        })
        .await
    );
    broker.publish("orders", 0, "after-halt");
    assert!(wait_until(WAIT, || broker.pending() == 0).await);

    cancel(&ctx);
    let report = handle.wait().await.unwrap();

    assert_eq!(handler.offsets_for(0), vec![0, 1]);
    assert_eq!(broker.committed_offsets("orders", 0), vec![0]);
    assert_eq!(report.halted_partitions, vec![TopicPartition::new("orders", 0)]);
}

#[tokio::test]
async fn commit_failure_does_not_stop_the_partition() {
    let broker = InMemoryBroker::new();
    broker.fail_next_commits(1);
    broker.publish("orders", 0, "first");
    broker.publish("orders", 0, "second");
    let handler = RecordingHandler::new();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    assert!(wait_until(WAIT, || broker.commits().len() == 1).await);
    cancel(&ctx);
    let report = handle.wait().await.unwrap();

    assert_eq!(broker.committed_offsets("orders", 0), vec![1]);
    assert_eq!(report.stats.handled, 2);
    assert_eq!(report.stats.commit_failures, 1);
}

#[tokio::test]
async fn poll_errors_are_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_next_polls(3);
    broker.publish("orders", 0, "first");
    let handler = RecordingHandler::new();

    let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;

    assert!(wait_until(WAIT, || broker.commits().len() == 1).await);
    cancel(&ctx);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.stats.poll_errors, 3);
    assert_eq!(report.stats.handled, 1);
}

// ============================================================================
// Start Failures
// ============================================================================

#[tokio::test]
async fn empty_topic_list_is_a_configuration_error() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(config(&[]), Arc::new(broker.clone()));

    let result = consumer
        .start(CancellationContext::new(), Arc::new(RecordingHandler::new()))
        .await;

    assert!(matches!(result, Err(ConsumerError::Configuration(_))));
    assert_eq!(broker.subscriptions(), 0);
}

#[tokio::test]
async fn unresolvable_broker_is_a_configuration_error() {
    let broker = InMemoryBroker::new();
    let mut config = config(&["orders"]);
    config.subscription.brokers = vec!["no-such-host.invalid:9092".to_string()];
    let consumer = Consumer::new(config, Arc::new(broker.clone()));

    let result = consumer
        .start(CancellationContext::new(), Arc::new(RecordingHandler::new()))
        .await;

    assert!(matches!(result, Err(ConsumerError::Configuration(_))));
    assert_eq!(broker.subscriptions(), 0);
}

#[tokio::test]
async fn rejected_subscription_is_a_broker_error() {
    let broker = InMemoryBroker::new();
    broker.reject_subscriptions("topic authorization failed");
    let consumer = Consumer::new(config(&["orders"]), Arc::new(broker.clone()));

    let result = consumer
        .start(CancellationContext::new(), Arc::new(RecordingHandler::new()))
        .await;

    assert!(matches!(result, Err(ConsumerError::Broker(_))));
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn each_partition_is_handled_in_offset_order(
        partitions in prop::collection::vec(0i32..4, 1..40)
    ) {
        let broker = InMemoryBroker::new();
        let handler = RecordingHandler::new();
        for (i, partition) in partitions.iter().enumerate() {
            broker.publish("orders", *partition, format!("message-{i}"));
        }

        let report = tokio_test::block_on(async {
            let (ctx, handle) = start(&broker, config(&["orders"]), &handler).await;
            wait_until(WAIT, || broker.commits().len() == partitions.len()).await;
            cancel(&ctx);
            handle.wait().await.unwrap()
        });

        prop_assert_eq!(report.stats.handled, partitions.len() as u64);
        for partition in 0..4 {
            let published = partitions.iter().filter(|p| **p == partition).count();
            let expected: Vec<i64> = (0..published as i64).collect();
            prop_assert_eq!(handler.offsets_for(partition), expected.clone());
            prop_assert_eq!(broker.committed_offsets("orders", partition), expected);
        }
    }
}
