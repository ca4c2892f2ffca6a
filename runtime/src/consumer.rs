//! Background consumption loop with a non-blocking start.
//!
//! [`Consumer::start`] validates the subscription, subscribes through the
//! broker and spawns the loop as an independent tokio task. It returns as soon
//! as the task is spawned; the caller goes on to install signal handling while
//! messages are already flowing.
//!
//! # Loop Structure
//!
//! ```text
//!              ┌──────────────┐
//!   poll ────▶ │  dispatcher  │ ── cancelled? ──▶ stop polling, close lanes
//!              └──────┬───────┘
//!                     │ route by topic/partition
//!          ┌──────────┼──────────┐
//!          ▼          ▼          ▼
//!      ┌───────┐  ┌───────┐  ┌───────┐
//!      │ lane 0│  │ lane 1│  │ lane n│   handle → commit, one message at a time
//!      └───────┘  └───────┘  └───────┘
//! ```
//!
//! - One lane task per active partition, so partitions progress concurrently
//!   while each partition is handled strictly in offset order.
//! - Offsets are committed only after the handler succeeds (at-least-once).
//! - Handler failures are logged with topic, partition and offset and never
//!   leave the lane; see [`FailurePolicy`].
//! - Broker poll errors are retried with [`RetryPolicy`] backoff.
//! - On cancellation the message in flight finishes, no new handler call
//!   starts, every lane is joined and the subscription is closed.

use crate::metrics::POLL_ERRORS;
use crate::partition::{LaneOutcome, PartitionLane};
use crate::retry::RetryPolicy;
use kafka_consumer_core::{
    Broker, BrokerError, CancellationContext, Message, MessageHandler, Subscription,
    SubscriptionConfig, TopicPartition,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Errors surfaced by [`Consumer::start`] and [`ConsumerHandle::wait`].
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The subscription configuration is invalid; fatal before start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The broker rejected the subscription
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The consumer loop task panicked or was aborted
    #[error("Consumer loop failed: {0}")]
    Join(String),
}

/// What a lane does after a handler error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, leave the offset uncommitted and continue with the next message.
    ///
    /// The next successful commit on the partition moves the group position
    /// past the failed message.
    #[default]
    Skip,
    /// Log and stop the partition's lane; later messages of that partition are
    /// left uncommitted and the partition is reported as halted.
    HaltPartition,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "halt" | "halt-partition" | "halt_partition" => Ok(Self::HaltPartition),
            other => Err(format!("unknown failure policy '{other}' (expected 'skip' or 'halt')")),
        }
    }
}

/// Configuration for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Brokers, group and topics
    pub subscription: SubscriptionConfig,

    /// Upper bound for a single poll (default: 1s)
    pub poll_timeout: Duration,

    /// Messages buffered per partition lane (default: 64)
    pub partition_buffer: usize,

    /// Behaviour after a handler error (default: skip)
    pub failure_policy: FailurePolicy,

    /// Backoff for broker poll errors
    pub retry: RetryPolicy,

    /// Upper bound for resolving each broker address during validation (default: 5s)
    pub resolve_timeout: Duration,
}

impl ConsumerConfig {
    /// Create a configuration with default tuning.
    ///
    /// # Example
    ///
    /// ```
    /// use kafka_consumer_core::SubscriptionConfig;
    /// use kafka_consumer_runtime::{ConsumerConfig, FailurePolicy};
    /// use std::time::Duration;
    ///
    /// let config = ConsumerConfig::new(SubscriptionConfig::new(
    ///     vec!["localhost:9092".to_string()],
    ///     "foo-consumer",
    ///     vec!["foo".to_string()],
    /// ))
    /// .with_poll_timeout(Duration::from_millis(500))
    /// .with_failure_policy(FailurePolicy::HaltPartition);
    ///
    /// assert_eq!(config.partition_buffer, 64);
    /// ```
    #[must_use]
    pub fn new(subscription: SubscriptionConfig) -> Self {
        Self {
            subscription,
            poll_timeout: Duration::from_secs(1),
            partition_buffer: 64,
            failure_policy: FailurePolicy::Skip,
            retry: RetryPolicy::default(),
            resolve_timeout: Duration::from_secs(5),
        }
    }

    /// Set the poll timeout (builder pattern)
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the per-partition buffer (builder pattern)
    #[must_use]
    pub const fn with_partition_buffer(mut self, buffer: usize) -> Self {
        self.partition_buffer = buffer;
        self
    }

    /// Set the failure policy (builder pattern)
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the poll error backoff (builder pattern)
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the broker resolution timeout (builder pattern)
    #[must_use]
    pub const fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Check the configuration before subscribing.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] if the topic list is empty, a
    /// name is blank, the tuning values would busy-poll, or a broker address
    /// is malformed or does not resolve.
    pub async fn validate(&self) -> Result<(), ConsumerError> {
        let subscription = &self.subscription;

        if subscription.topics.is_empty() {
            return Err(ConsumerError::Configuration("topic list is empty".to_string()));
        }
        if subscription.topics.iter().any(|topic| topic.trim().is_empty()) {
            return Err(ConsumerError::Configuration(
                "topic names must not be blank".to_string(),
            ));
        }
        if subscription.group_id.trim().is_empty() {
            return Err(ConsumerError::Configuration("group id is empty".to_string()));
        }
        if subscription.brokers.is_empty() {
            return Err(ConsumerError::Configuration("broker list is empty".to_string()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConsumerError::Configuration(
                "poll timeout must be greater than zero".to_string(),
            ));
        }
        if self.partition_buffer == 0 {
            return Err(ConsumerError::Configuration(
                "partition buffer must be greater than zero".to_string(),
            ));
        }

        for broker in &subscription.brokers {
            resolve_broker(broker, self.resolve_timeout).await?;
        }

        Ok(())
    }
}

/// Check that a `host:port` broker address resolves to at least one socket address.
async fn resolve_broker(address: &str, timeout: Duration) -> Result<(), ConsumerError> {
    let invalid = |reason: String| {
        ConsumerError::Configuration(format!("broker address '{address}' {reason}"))
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("is not in host:port form".to_string()))?;
    if host.trim().is_empty() {
        return Err(invalid("has an empty host".to_string()));
    }
    port.parse::<u16>()
        .map_err(|e| invalid(format!("has an invalid port: {e}")))?;

    match tokio::time::timeout(timeout, tokio::net::lookup_host(address)).await {
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(invalid("resolved to no addresses".to_string()))
            }
        }
        Ok(Err(e)) => Err(invalid(format!("does not resolve: {e}"))),
        Err(_) => Err(invalid(format!("did not resolve within {timeout:?}"))),
    }
}

/// Counters for a running consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages whose handler returned `Ok`
    pub handled: u64,
    /// Messages whose handler returned an error
    pub failed: u64,
    /// Offsets committed
    pub committed: u64,
    /// Offset commits rejected by the broker
    pub commit_failures: u64,
    /// Broker poll errors
    pub poll_errors: u64,
}

/// Final outcome of a consumer loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Counters at the time the loop exited
    pub stats: ConsumerStats,
    /// Partitions stopped by [`FailurePolicy::HaltPartition`], sorted
    pub halted_partitions: Vec<TopicPartition>,
}

/// Shared counters updated by the dispatcher and the lanes.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) handled: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) commit_failures: AtomicU64,
    pub(crate) poll_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }
}

/// Owns the broker subscription configuration and starts consumption.
pub struct Consumer {
    config: ConsumerConfig,
    broker: Arc<dyn Broker>,
}

impl Consumer {
    /// Create a consumer for the given broker.
    #[must_use]
    pub fn new(config: ConsumerConfig, broker: Arc<dyn Broker>) -> Self {
        Self { config, broker }
    }

    /// The consumer's configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Validate, subscribe and spawn the background loop.
    ///
    /// Returns as soon as the loop is spawned; no message is handled by this
    /// call. The loop runs until `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] if validation fails and
    /// [`ConsumerError::Broker`] if the subscription is rejected.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let ctx = CancellationContext::new();
    /// let handle = consumer.start(ctx.clone(), Arc::new(FooHandler::new(repo))).await?;
    ///
    /// // Later
    /// ctx.cancel(CancelCause::Requested("test".into()));
    /// let report = handle.wait().await?;
    /// ```
    pub async fn start(
        &self,
        ctx: CancellationContext,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, ConsumerError> {
        self.config.validate().await?;

        let subscription = self.broker.subscribe(&self.config.subscription).await?;

        info!(
            topics = ?self.config.subscription.topics,
            group_id = %self.config.subscription.group_id,
            failure_policy = ?self.config.failure_policy,
            "Subscribed to topics"
        );

        let stats = Arc::new(StatsCounters::default());
        let consumption = ConsumptionLoop {
            config: self.config.clone(),
            subscription,
            handler,
            context: ctx,
            stats: Arc::clone(&stats),
        };

        let task = tokio::spawn(consumption.run());

        Ok(ConsumerHandle { task, stats })
    }
}

/// Handle to a running consumer loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    task: JoinHandle<ConsumerReport>,
    stats: Arc<StatsCounters>,
}

impl ConsumerHandle {
    /// Current counters; the loop keeps updating them while it runs.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Handle that can abort the loop without consuming `self`.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Join`] if the loop panicked or was aborted.
    pub async fn wait(self) -> Result<ConsumerReport, ConsumerError> {
        self.task
            .await
            .map_err(|e| ConsumerError::Join(e.to_string()))
    }
}

/// State owned by the spawned dispatcher task.
struct ConsumptionLoop {
    config: ConsumerConfig,
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    context: CancellationContext,
    stats: Arc<StatsCounters>,
}

/// Lanes known to the dispatcher.
#[derive(Default)]
struct Lanes {
    senders: HashMap<TopicPartition, mpsc::Sender<Message>>,
    halted: HashSet<TopicPartition>,
    tasks: JoinSet<LaneOutcome>,
}

impl ConsumptionLoop {
    async fn run(self) -> ConsumerReport {
        info!(
            topics = ?self.config.subscription.topics,
            poll_timeout = ?self.config.poll_timeout,
            "Consumer loop started"
        );

        let mut lanes = Lanes::default();
        let mut consecutive_errors = 0usize;

        loop {
            let polled = tokio::select! {
                biased;
                () = self.context.cancelled() => break,
                polled = self.subscription.poll(self.config.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    consecutive_errors = 0;
                    if !self.route(message, &mut lanes).await {
                        break;
                    }
                }
                Ok(None) => consecutive_errors = 0,
                Err(e) => {
                    let delay = self.config.retry.delay_for_attempt(consecutive_errors);
                    consecutive_errors += 1;
                    self.stats.poll_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(POLL_ERRORS).increment(1);
                    warn!(
                        error = %e,
                        attempt = consecutive_errors,
                        retry_in = ?delay,
                        "Broker poll failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        () = self.context.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(
            cause = %self.context.cause().map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            active_partitions = lanes.senders.len(),
            "Cancellation observed, stopping consumer loop"
        );

        // Closing the senders lets idle lanes exit; busy lanes finish their message first.
        let Lanes {
            senders,
            mut tasks,
            ..
        } = lanes;
        drop(senders);

        let mut halted_partitions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) if outcome.halted => halted_partitions.push(outcome.partition),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Partition lane task failed"),
            }
        }
        halted_partitions.sort();

        self.subscription.close().await;

        let report = ConsumerReport {
            stats: self.stats.snapshot(),
            halted_partitions,
        };

        info!(
            handled = report.stats.handled,
            failed = report.stats.failed,
            committed = report.stats.committed,
            halted_partitions = report.halted_partitions.len(),
            "Consumer loop stopped"
        );

        report
    }

    /// Hand a message to its partition lane, spawning the lane on first use.
    ///
    /// Returns `false` when cancellation was observed while waiting for lane capacity.
    async fn route(&self, message: Message, lanes: &mut Lanes) -> bool {
        let key = message.topic_partition();

        if lanes.halted.contains(&key) {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Partition halted, leaving message uncommitted"
            );
            return true;
        }

        let sender = lanes.senders.entry(key.clone()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(self.config.partition_buffer);
            let lane = PartitionLane {
                partition: key.clone(),
                receiver,
                subscription: Arc::clone(&self.subscription),
                handler: Arc::clone(&self.handler),
                context: self.context.clone(),
                stats: Arc::clone(&self.stats),
                failure_policy: self.config.failure_policy,
            };
            lanes.tasks.spawn(lane.run());
            sender
        });

        let sent = tokio::select! {
            biased;
            () = self.context.cancelled() => return false,
            sent = sender.send(message) => sent,
        };

        if let Err(mpsc::error::SendError(message)) = sent {
            if self.context.is_cancelled() {
                return false;
            }
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Partition lane halted, leaving message uncommitted"
            );
            lanes.senders.remove(&key);
            lanes.halted.insert(key);
        }

        true
    }
}
