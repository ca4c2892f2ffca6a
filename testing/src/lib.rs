//! # Kafka Consumer Testing
//!
//! Test doubles and helpers for the Kafka consumer.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: scripted broker with recorded commits and injectable failures
//! - [`RecordingHandler`]: handler that records calls, fails on chosen offsets and can be gated
//! - [`CapturedEvents`]: in-memory log capture for asserting on emitted events
//! - [`wait_until`]: bounded polling for eventually-true conditions
//! - [`init_tracing`]: test-friendly log output
//!
//! ## Example
//!
//! ```ignore
//! #[tokio::test]
//! async fn commits_after_handling() {
//!     let broker = InMemoryBroker::new();
//!     broker.publish("orders", 0, "payload");
//!
//!     let handler = RecordingHandler::new();
//!     let ctx = CancellationContext::new();
//!     let handle = consumer(&broker).start(ctx.clone(), Arc::new(handler.clone())).await?;
//!
//!     assert!(wait_until(Duration::from_secs(5), || broker.commits().len() == 1).await);
//! }
//! ```

pub mod broker;
pub mod handler;
pub mod logs;

pub use broker::{Commit, InMemoryBroker, InMemorySubscription};
pub use handler::RecordingHandler;
pub use logs::{CapturedEvent, CapturedEvents};

use std::time::Duration;
use tokio::time::Instant;

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Install a fmt subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_until_reports_timeout() {
        assert!(wait_until(Duration::from_millis(20), || true).await);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
