//! Sequential per-partition processing.
//!
//! A lane owns the receiving end of its partition's channel and processes one
//! message at a time: handle, then commit on success. Cancellation is checked
//! before each handler call, never during one.

use crate::consumer::{FailurePolicy, StatsCounters};
use crate::metrics::{COMMIT_FAILURES, MESSAGES_FAILED, MESSAGES_HANDLED, OFFSETS_COMMITTED};
use kafka_consumer_core::{
    CancellationContext, HandlerError, Message, MessageHandler, Subscription, TopicPartition,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// How a lane ended.
#[derive(Debug)]
pub(crate) struct LaneOutcome {
    pub(crate) partition: TopicPartition,
    pub(crate) halted: bool,
}

pub(crate) struct PartitionLane {
    pub(crate) partition: TopicPartition,
    pub(crate) receiver: mpsc::Receiver<Message>,
    pub(crate) subscription: Arc<dyn Subscription>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) context: CancellationContext,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) failure_policy: FailurePolicy,
}

impl PartitionLane {
    pub(crate) async fn run(mut self) -> LaneOutcome {
        debug!(
            topic = %self.partition.topic,
            partition = self.partition.partition,
            "Partition lane started"
        );

        let mut halted = false;
        while let Some(message) = self.receiver.recv().await {
            if self.context.is_cancelled() {
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Cancellation observed, leaving remaining messages for redelivery"
                );
                break;
            }

            if !self.process(&message).await {
                halted = true;
                break;
            }
        }

        debug!(
            topic = %self.partition.topic,
            partition = self.partition.partition,
            halted,
            "Partition lane stopped"
        );

        LaneOutcome {
            partition: self.partition,
            halted,
        }
    }

    /// Handle one message. Returns `false` when the lane must stop.
    async fn process(&self, message: &Message) -> bool {
        match self.handler.handle(message).await {
            Ok(()) => {
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(MESSAGES_HANDLED, "topic" => message.topic.clone()).increment(1);
                self.commit(message).await;
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    MESSAGES_FAILED,
                    "topic" => message.topic.clone(),
                    "kind" => failure_kind(&e)
                )
                .increment(1);

                match self.failure_policy {
                    FailurePolicy::Skip => {
                        error!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            error = %e,
                            "Failed to handle message, skipping"
                        );
                        true
                    }
                    FailurePolicy::HaltPartition => {
                        error!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            error = %e,
                            "Failed to handle message, halting partition"
                        );
                        false
                    }
                }
            }
        }
    }

    async fn commit(&self, message: &Message) {
        match self
            .subscription
            .commit_offset(&message.topic, message.partition, message.offset)
            .await
        {
            Ok(()) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(OFFSETS_COMMITTED, "topic" => message.topic.clone())
                    .increment(1);
                trace!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Offset committed"
                );
            }
            Err(e) => {
                self.stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(COMMIT_FAILURES, "topic" => message.topic.clone()).increment(1);
                // The next successful commit on this partition covers this offset too.
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to commit offset, message may be redelivered"
                );
            }
        }
    }
}

const fn failure_kind(error: &HandlerError) -> &'static str {
    match error {
        HandlerError::Decode(_) => "decode",
        HandlerError::Persistence(_) => "persistence",
    }
}
