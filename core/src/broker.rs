//! Broker abstraction consumed by the runtime.
//!
//! The runtime never speaks a broker protocol itself. It subscribes through a
//! [`Broker`], then drives the returned [`Subscription`]: poll with a bounded
//! timeout, commit an offset once a message has been handled, close on exit.
//!
//! # Implementations
//!
//! - `RedpandaBroker` (crate `kafka-consumer-redpanda`) - Kafka-compatible, backed by rdkafka
//! - `InMemoryBroker` (crate `kafka-consumer-testing`) - scripted messages for tests
//!
//! # Commit Semantics
//!
//! [`Subscription::commit_offset`] receives the offset of the message that was
//! handled. Implementations translate that into whatever their protocol stores
//! (Kafka stores the *next* offset to read, i.e. `offset + 1`).
//!
//! # Dyn Compatibility
//!
//! Both traits use explicit `Pin<Box<dyn Future>>` returns so they can be held
//! as `Arc<dyn Broker>` / `Arc<dyn Subscription>` and shared between the
//! dispatcher and the partition lanes.

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
///
/// Poll errors are treated as transient by the runtime and retried with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to create a client or reach the cluster
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    Subscription {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to receive a message
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to commit an offset
    #[error("Commit failed for {topic}[{partition}] at offset {offset}: {reason}")]
    Commit {
        /// Topic of the committed message
        topic: String,
        /// Partition of the committed message
        partition: i32,
        /// Offset of the committed message
        offset: i64,
        /// The reason for failure
        reason: String,
    },
}

/// What to subscribe to and as whom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Bootstrap broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Consumer group identity
    pub group_id: String,
    /// Topics to consume
    pub topics: Vec<String>,
}

impl SubscriptionConfig {
    /// Create a subscription config.
    ///
    /// # Example
    ///
    /// ```
    /// use kafka_consumer_core::SubscriptionConfig;
    ///
    /// let config = SubscriptionConfig::new(
    ///     vec!["localhost:9092".to_string()],
    ///     "foo-consumer",
    ///     vec!["foo".to_string()],
    /// );
    /// assert_eq!(config.group_id, "foo-consumer");
    /// ```
    #[must_use]
    pub fn new(brokers: Vec<String>, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            brokers,
            group_id: group_id.into(),
            topics,
        }
    }
}

/// Factory for subscriptions.
pub trait Broker: Send + Sync {
    /// Join the consumer group and subscribe to the configured topics.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the client cannot be created, or
    /// [`BrokerError::Subscription`] if the subscription is rejected.
    fn subscribe<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Subscription>, BrokerError>> + Send + 'a>>;
}

/// An active subscription owned by one consumer loop.
pub trait Subscription: Send + Sync {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the broker reported an error.
    fn poll(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BrokerError>> + Send + '_>>;

    /// Record that the message at `offset` has been handled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Commit`] if the commit could not be queued.
    fn commit_offset<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

    /// Leave the group and release broker resources.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
