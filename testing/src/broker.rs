//! In-memory broker for deterministic consumer tests.
//!
//! Messages are published into a single queue and delivered in publish order
//! to any subscription whose topics include the message's topic. Commits are
//! recorded instead of sent anywhere. Failures can be scripted per call.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use kafka_consumer_core::{Broker, BrokerError, Message, Subscription, SubscriptionConfig, TopicPartition};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A commit recorded by [`InMemoryBroker`]: topic, partition and handled offset.
pub type Commit = (String, i32, i64);

#[derive(Debug, Default)]
struct Shared {
    queue: VecDeque<Message>,
    next_offsets: HashMap<TopicPartition, i64>,
    commits: Vec<Commit>,
    failing_polls: usize,
    failing_commits: usize,
    rejection: Option<String>,
    subscriptions: usize,
    closed: usize,
}

#[derive(Debug, Default)]
struct State {
    shared: Mutex<Shared>,
    published: Notify,
}

/// In-memory broker for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use kafka_consumer_core::{Broker, SubscriptionConfig};
/// use kafka_consumer_testing::InMemoryBroker;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// broker.publish("orders", 0, b"first".to_vec());
///
/// let config = SubscriptionConfig::new(vec![], "group", vec!["orders".to_string()]);
/// let subscription = broker.subscribe(&config).await.unwrap();
///
/// let message = subscription.poll(Duration::from_millis(10)).await.unwrap().unwrap();
/// assert_eq!(message.offset, 0);
///
/// subscription.commit_offset("orders", 0, 0).await.unwrap();
/// assert_eq!(broker.committed_offsets("orders", 0), vec![0]);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<State>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a partition, assigning the next offset.
    ///
    /// Returns the assigned offset.
    pub fn publish(&self, topic: &str, partition: i32, value: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut shared = self.state.shared.lock().unwrap();
            let next = shared
                .next_offsets
                .entry(TopicPartition::new(topic, partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            shared
                .queue
                .push_back(Message::new(topic, partition, offset, value.into()));
            offset
        };
        self.state.published.notify_waiters();
        offset
    }

    /// Append a fully built message as-is, keeping its offset.
    pub fn publish_message(&self, message: Message) {
        {
            let mut shared = self.state.shared.lock().unwrap();
            let next = shared
                .next_offsets
                .entry(message.topic_partition())
                .or_insert(0);
            *next = (*next).max(message.offset + 1);
            shared.queue.push_back(message);
        }
        self.state.published.notify_waiters();
    }

    /// Make the next `count` polls fail with a transport error.
    pub fn fail_next_polls(&self, count: usize) {
        self.state.shared.lock().unwrap().failing_polls = count;
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.state.shared.lock().unwrap().failing_commits = count;
    }

    /// Reject every subscription attempt with `reason`.
    pub fn reject_subscriptions(&self, reason: impl Into<String>) {
        self.state.shared.lock().unwrap().rejection = Some(reason.into());
    }

    /// All commits in the order they were made.
    #[must_use]
    pub fn commits(&self) -> Vec<Commit> {
        self.state.shared.lock().unwrap().commits.clone()
    }

    /// Committed offsets of one partition, in commit order.
    #[must_use]
    pub fn committed_offsets(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.state
            .shared
            .lock()
            .unwrap()
            .commits
            .iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, offset)| *offset)
            .collect()
    }

    /// Messages published but not yet polled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.shared.lock().unwrap().queue.len()
    }

    /// Number of successful subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.state.shared.lock().unwrap().subscriptions
    }

    /// Number of subscriptions that have been closed.
    #[must_use]
    pub fn closed_subscriptions(&self) -> usize {
        self.state.shared.lock().unwrap().closed
    }
}

impl Broker for InMemoryBroker {
    fn subscribe<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Subscription>, BrokerError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut shared = self.state.shared.lock().unwrap();
            if let Some(reason) = &shared.rejection {
                return Err(BrokerError::Subscription {
                    topics: config.topics.clone(),
                    reason: reason.clone(),
                });
            }
            shared.subscriptions += 1;
            drop(shared);

            let subscription: Arc<dyn Subscription> = Arc::new(InMemorySubscription {
                state: Arc::clone(&self.state),
                topics: config.topics.clone(),
            });
            Ok(subscription)
        })
    }
}

/// Subscription handed out by [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemorySubscription {
    state: Arc<State>,
    topics: Vec<String>,
}

impl InMemorySubscription {
    fn take_next(&self) -> Result<Option<Message>, BrokerError> {
        let mut shared = self.state.shared.lock().unwrap();
        if shared.failing_polls > 0 {
            shared.failing_polls -= 1;
            return Err(BrokerError::Transport("injected poll failure".to_string()));
        }
        let position = shared
            .queue
            .iter()
            .position(|message| self.topics.contains(&message.topic));
        Ok(position.and_then(|index| shared.queue.remove(index)))
    }
}

impl Subscription for InMemorySubscription {
    fn poll(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                // Registered before checking the queue so a concurrent publish is not missed.
                let published = self.state.published.notified();

                if let Some(message) = self.take_next()? {
                    return Ok(Some(message));
                }

                if tokio::time::timeout_at(deadline, published).await.is_err() {
                    return Ok(None);
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
            let mut shared = self.state.shared.lock().unwrap();
            if shared.failing_commits > 0 {
                shared.failing_commits -= 1;
                return Err(BrokerError::Commit {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    reason: "injected commit failure".to_string(),
                });
            }
            shared.commits.push((topic.to_string(), partition, offset));
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.state.shared.lock().unwrap().closed += 1;
        })
    }
}
