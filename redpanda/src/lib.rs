//! Redpanda broker client for the Kafka consumer.
//!
//! This crate implements the [`Broker`] and [`Subscription`] traits from
//! `kafka-consumer-core` on top of rdkafka's [`StreamConsumer`]. Anything
//! that speaks the Kafka protocol works: Redpanda, Apache Kafka, AWS MSK.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `enable.auto.commit` is always `false`
//! - The runtime commits a message only after its handler succeeded
//! - Kafka stores the *next* offset to read, so committing message `n` stores `n + 1`
//! - Commits are queued asynchronously; a lost commit means a redelivery, never a gap
//! - The broker's verdict on each queued commit arrives later through
//!   [`CommitLoggingContext`], which logs every rejected position
//!
//! # Example
//!
//! ```no_run
//! use kafka_consumer_core::{Broker, SubscriptionConfig};
//! use kafka_consumer_redpanda::RedpandaBroker;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .auto_offset_reset("earliest")
//!     .session_timeout_ms(6000)
//!     .build();
//!
//! let config = SubscriptionConfig::new(
//!     vec!["localhost:9092".to_string()],
//!     "foo-consumer",
//!     vec!["foo".to_string()],
//! );
//! let subscription = broker.subscribe(&config).await?;
//!
//! if let Some(message) = subscription.poll(Duration::from_secs(1)).await? {
//!     subscription
//!         .commit_offset(&message.topic, message.partition, message.offset)
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use kafka_consumer_core::{Broker, BrokerError, Message, Subscription, SubscriptionConfig};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Kafka-compatible broker backed by rdkafka.
///
/// Holds client settings only; each [`Broker::subscribe`] call creates its
/// own consumer and joins the configured group.
///
/// # Example
///
/// ```
/// use kafka_consumer_redpanda::RedpandaBroker;
///
/// let broker = RedpandaBroker::builder()
///     .auto_offset_reset("latest")
///     .set("fetch.min.bytes", "1")
///     .build();
///
/// assert_eq!(broker.auto_offset_reset(), "latest");
/// ```
#[derive(Debug, Clone)]
pub struct RedpandaBroker {
    auto_offset_reset: String,
    session_timeout_ms: u32,
    overrides: Vec<(String, String)>,
}

impl Default for RedpandaBroker {
    fn default() -> Self {
        RedpandaBrokerBuilder::default().build()
    }
}

impl RedpandaBroker {
    /// Create a new builder for configuring the broker client.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Where new consumer groups start reading.
    #[must_use]
    pub fn auto_offset_reset(&self) -> &str {
        &self.auto_offset_reset
    }

    /// Client configuration for one subscription.
    ///
    /// Overrides are applied last, except for `enable.auto.commit`, which is
    /// pinned to `false`.
    #[must_use]
    pub fn client_config(&self, subscription: &SubscriptionConfig) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", subscription.brokers.join(","))
            .set("group.id", &subscription.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false");

        for (key, value) in &self.overrides {
            config.set(key, value);
        }

        config.set("enable.auto.commit", "false");
        config
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Debug, Default)]
pub struct RedpandaBrokerBuilder {
    auto_offset_reset: Option<String>,
    session_timeout_ms: Option<u32>,
    overrides: Vec<(String, String)>,
}

impl RedpandaBrokerBuilder {
    /// Set the auto offset reset policy for new consumer groups.
    ///
    /// Controls where new consumer groups start reading when no committed offset exists:
    /// - `"earliest"`: Start from the beginning of the topic
    /// - `"latest"`: Start from the end (only new messages)
    /// - `"error"`: Fail if no offset exists
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6000 ms
    #[must_use]
    pub const fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.session_timeout_ms = Some(timeout);
        self
    }

    /// Set an arbitrary librdkafka property (e.g. `security.protocol`).
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Build the [`RedpandaBroker`].
    #[must_use]
    pub fn build(self) -> RedpandaBroker {
        RedpandaBroker {
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout_ms: self.session_timeout_ms.unwrap_or(6000),
            overrides: self.overrides,
        }
    }
}

impl Broker for RedpandaBroker {
    fn subscribe<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Subscription>, BrokerError>> + Send + 'a>>
    {
        Box::pin(async move {
            let consumer: StreamConsumer<CommitLoggingContext> = self
                .client_config(config)
                .create_with_context(CommitLoggingContext)
                .map_err(|e| BrokerError::Connection(format!("Failed to create consumer: {e}")))?;

            let topic_refs: Vec<&str> = config.topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BrokerError::Subscription {
                    topics: config.topics.clone(),
                    reason: e.to_string(),
                })?;

            tracing::info!(
                brokers = ?config.brokers,
                topics = ?config.topics,
                group_id = %config.group_id,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Kafka consumer subscribed"
            );

            let subscription: Arc<dyn Subscription> = Arc::new(RedpandaSubscription { consumer });
            Ok(subscription)
        })
    }
}

/// Consumer context that reports the outcome of asynchronous commits.
///
/// [`Subscription::commit_offset`] only queues a commit. librdkafka reports the
/// broker's answer later through [`ConsumerContext::commit_callback`]; a
/// rejected commit is logged once per partition with the message offset it
/// was meant to cover.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitLoggingContext;

impl ClientContext for CommitLoggingContext {}

impl ConsumerContext for CommitLoggingContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                for element in offsets.elements() {
                    tracing::trace!(
                        topic = %element.topic(),
                        partition = element.partition(),
                        position = ?element.offset(),
                        "Commit acknowledged"
                    );
                }
            }
            Err(e) => {
                for element in offsets.elements() {
                    // The stored position is the next offset to read.
                    let offset = element.offset().to_raw().map(|position| position - 1);
                    tracing::warn!(
                        topic = %element.topic(),
                        partition = element.partition(),
                        offset = ?offset,
                        error = %e,
                        "Broker rejected offset commit, message may be redelivered"
                    );
                }
            }
        }
    }
}

/// An rdkafka consumer joined to one group.
pub struct RedpandaSubscription {
    consumer: StreamConsumer<CommitLoggingContext>,
}

impl Subscription for RedpandaSubscription {
    fn poll(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.consumer.recv()).await {
                Err(_) => Ok(None),
                Ok(Err(e)) => Err(BrokerError::Transport(format!(
                    "Failed to receive message: {e}"
                ))),
                Ok(Ok(borrowed)) => {
                    let message = to_message(&borrowed);
                    tracing::trace!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Received message"
                    );
                    Ok(Some(message))
                }
            }
        })
    }

    fn commit_offset<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let commit_error = |reason: String| BrokerError::Commit {
                topic: topic.to_string(),
                partition,
                offset,
                reason,
            };

            let mut positions = TopicPartitionList::new();
            positions
                .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| commit_error(e.to_string()))?;

            self.consumer
                .commit(&positions, CommitMode::Async)
                .map_err(|e| commit_error(e.to_string()))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.consumer.unsubscribe();
            tracing::info!("Kafka consumer unsubscribed");
        })
    }
}

/// Copy a borrowed rdkafka message into an owned [`Message`].
fn to_message(borrowed: &BorrowedMessage<'_>) -> Message {
    let headers = borrowed
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Message {
        topic: borrowed.topic().to_string(),
        partition: borrowed.partition(),
        offset: borrowed.offset(),
        key: borrowed.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: borrowed.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}
