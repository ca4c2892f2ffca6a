//! Integration tests for shutdown coordination.
//!
//! Signals are injected through `ShutdownCoordinator::listen` so no real
//! process signal is ever raised.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::stream;
use kafka_consumer_core::{CancelCause, CancellationContext, ShutdownSignal, SubscriptionConfig};
use kafka_consumer_runtime::{
    Consumer, ConsumerConfig, ConsumerHandle, ShutdownCoordinator, ShutdownError, ShutdownState,
};
use kafka_consumer_testing::{InMemoryBroker, RecordingHandler, init_tracing, wait_until};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn start(
    broker: &InMemoryBroker,
    handler: &RecordingHandler,
    grace: Duration,
) -> (CancellationContext, ShutdownCoordinator, ConsumerHandle) {
    init_tracing();
    let ctx = CancellationContext::new();
    let config = ConsumerConfig::new(SubscriptionConfig::new(
        vec!["127.0.0.1:9092".to_string()],
        "test-group",
        vec!["orders".to_string()],
    ))
    .with_poll_timeout(Duration::from_millis(50));

    let handle = Consumer::new(config, Arc::new(broker.clone()))
        .start(ctx.clone(), Arc::new(handler.clone()))
        .await
        .unwrap();
    let coordinator = ShutdownCoordinator::new(ctx.clone(), grace);

    (ctx, coordinator, handle)
}

#[tokio::test]
async fn repeated_signals_cancel_once() {
    let broker = InMemoryBroker::new();
    for i in 0..3 {
        broker.publish("orders", 0, format!("order-{i}"));
    }
    let handler = RecordingHandler::new();
    let (ctx, coordinator, handle) = start(&broker, &handler, WAIT).await;
    assert!(wait_until(WAIT, || broker.commits().len() == 3).await);

    let observer = coordinator.clone();
    let listener = coordinator.listen(stream::iter(vec![
        ShutdownSignal::Interrupt,
        ShutdownSignal::Interrupt,
        ShutdownSignal::Terminate,
    ]));

    let reports = coordinator.wait(vec![handle]).await.unwrap();
    listener.await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stats.handled, 3);
    assert_eq!(observer.signals_received(), 3);
    assert_eq!(observer.state(), ShutdownState::Confirmed);
    assert_eq!(
        ctx.cause(),
        Some(CancelCause::Signal(ShutdownSignal::Interrupt))
    );
    assert_eq!(broker.closed_subscriptions(), 1);
}

#[tokio::test]
async fn wait_blocks_until_a_signal_arrives() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::new();
    let (_ctx, coordinator, handle) = start(&broker, &handler, WAIT).await;

    let observer = coordinator.clone();
    let waiter = tokio::spawn(coordinator.wait(vec![handle]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(observer.state(), ShutdownState::Armed);

    assert!(observer.trigger(ShutdownSignal::Terminate));
    let reports = waiter.await.unwrap().unwrap();

    assert_eq!(reports[0].stats.handled, 0);
    assert_eq!(observer.state(), ShutdownState::Confirmed);
}

#[tokio::test]
async fn stalled_handler_times_out_the_grace_period() {
    let broker = InMemoryBroker::new();
    broker.publish("orders", 0, "never-finishes");
    let handler = RecordingHandler::gated();
    let (_ctx, coordinator, handle) = start(&broker, &handler, Duration::from_millis(100)).await;
    assert!(wait_until(WAIT, || handler.call_count() == 1).await);

    let observer = coordinator.clone();
    let abort = handle.abort_handle();
    coordinator.trigger(ShutdownSignal::Interrupt);
    let result = coordinator.wait(vec![handle]).await;

    assert!(matches!(
        result,
        Err(ShutdownError::Timeout { pending: 1, .. })
    ));
    assert_eq!(observer.state(), ShutdownState::Confirmed);
    assert!(wait_until(WAIT, || abort.is_finished()).await);
    assert!(broker.commits().is_empty());
}
