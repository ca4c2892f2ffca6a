//! Runtime for the Kafka consumer.
//!
//! This crate turns the contracts of `kafka-consumer-core` into a running
//! process:
//!
//! - **`consumer`**: Non-blocking start of the background consumption loop
//! - **`partition`**: One sequential lane per partition (ordering + commits)
//! - **`shutdown`**: `Armed → Triggered → Confirmed` coordination of process exit
//! - **`signals`**: OS signal source feeding the shutdown coordinator
//! - **`retry`**: Backoff for transient broker errors
//! - **`metrics`**: Counter names and the optional Prometheus exporter
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = CancellationContext::new();
//!
//! let consumer = Consumer::new(config, broker);
//! let handle = consumer.start(ctx.clone(), handler).await?;
//!
//! let coordinator = ShutdownCoordinator::new(ctx, Duration::from_secs(10));
//! coordinator.install()?;
//!
//! coordinator.wait(vec![handle]).await?;
//! ```

pub mod consumer;
pub mod metrics;
mod partition;
pub mod retry;
pub mod shutdown;
pub mod signals;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerReport, ConsumerStats,
    FailurePolicy,
};
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownState};
