//! # Kafka Consumer Core
//!
//! Core traits and types shared by the consumer runtime, the broker clients and
//! the service binary.
//!
//! ## Core Concepts
//!
//! - **Message**: One record delivered by the broker, addressed by topic, partition and offset
//! - **Broker / Subscription**: The narrow contract the runtime needs from a broker client
//! - **`MessageHandler`**: Stateless, idempotent dispatch unit invoked once per message
//! - **`CancellationContext`**: Shared one-way signal used to request cooperative shutdown
//!
//! ## Delivery Guarantees
//!
//! - Offsets are committed only after a handler succeeds (at-least-once)
//! - Messages of one partition are handled in offset order
//! - Handlers must tolerate redelivery
//!
//! ## Example
//!
//! ```ignore
//! use kafka_consumer_core::{CancellationContext, handler::MessageHandler};
//!
//! let ctx = CancellationContext::new();
//! let handle = consumer.start(ctx.clone(), Arc::new(MyHandler)).await?;
//!
//! // Later, from a signal listener:
//! ctx.cancel(CancelCause::Signal(ShutdownSignal::Interrupt));
//! ```

pub mod broker;
pub mod cancellation;
pub mod handler;
pub mod message;

pub use broker::{Broker, BrokerError, Subscription, SubscriptionConfig};
pub use cancellation::{CancelCause, CancellationContext, ShutdownSignal};
pub use handler::{HandlerError, MessageHandler};
pub use message::{Message, TopicPartition};
