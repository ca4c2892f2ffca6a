//! Recording message handler.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use async_trait::async_trait;
use kafka_consumer_core::{HandlerError, Message, MessageHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct Recorded {
    calls: Mutex<Vec<Message>>,
    failing: Mutex<HashMap<(Option<i32>, i64), Option<HandlerError>>>,
    gate: Option<Semaphore>,
}

/// Handler that records every call and fails on chosen offsets.
///
/// A gated handler records the call, then blocks until the test releases it,
/// which makes "handler in progress" states observable.
///
/// # Example
///
/// ```
/// use kafka_consumer_core::{Message, MessageHandler};
/// use kafka_consumer_testing::RecordingHandler;
///
/// # tokio_test::block_on(async {
/// let handler = RecordingHandler::new().failing_at(1);
///
/// assert!(handler.handle(&Message::new("orders", 0, 0, vec![])).await.is_ok());
/// assert!(handler.handle(&Message::new("orders", 0, 1, vec![])).await.is_err());
/// assert_eq!(handler.offsets(), vec![0, 1]);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingHandler {
    recorded: Arc<Recorded>,
}

impl RecordingHandler {
    /// A handler that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler whose calls block until [`release`](Self::release) grants them.
    #[must_use]
    pub fn gated() -> Self {
        Self {
            recorded: Arc::new(Recorded {
                gate: Some(Semaphore::new(0)),
                ..Recorded::default()
            }),
        }
    }

    /// Fail with a persistence error at `offset` on every partition.
    #[must_use]
    pub fn failing_at(self, offset: i64) -> Self {
        self.recorded.failing.lock().unwrap().insert((None, offset), None);
        self
    }

    /// Fail with `error` at `offset` on every partition.
    #[must_use]
    pub fn failing_with(self, offset: i64, error: HandlerError) -> Self {
        self.recorded
            .failing
            .lock()
            .unwrap()
            .insert((None, offset), Some(error));
        self
    }

    /// Fail with a persistence error at `offset` on `partition` only.
    #[must_use]
    pub fn failing_at_partition(self, partition: i32, offset: i64) -> Self {
        self.recorded
            .failing
            .lock()
            .unwrap()
            .insert((Some(partition), offset), None);
        self
    }

    /// Let `count` more gated calls proceed.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.recorded.gate {
            gate.add_permits(count);
        }
    }

    /// Every call so far, in call order, including failed ones.
    #[must_use]
    pub fn calls(&self) -> Vec<Message> {
        self.recorded.calls.lock().unwrap().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.recorded.calls.lock().unwrap().len()
    }

    /// Offsets of every call, in call order.
    #[must_use]
    pub fn offsets(&self) -> Vec<i64> {
        self.calls().iter().map(|m| m.offset).collect()
    }

    /// Offsets of calls for one partition, in call order.
    #[must_use]
    pub fn offsets_for(&self, partition: i32) -> Vec<i64> {
        self.calls()
            .iter()
            .filter(|m| m.partition == partition)
            .map(|m| m.offset)
            .collect()
    }

    fn injected_failure(&self, message: &Message) -> Option<HandlerError> {
        let failing = self.recorded.failing.lock().unwrap();
        let configured = failing
            .get(&(Some(message.partition), message.offset))
            .or_else(|| failing.get(&(None, message.offset)))?;

        Some(configured.clone().unwrap_or_else(|| {
            HandlerError::Persistence(format!(
                "injected failure at {}[{}]@{}",
                message.topic, message.partition, message.offset
            ))
        }))
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.recorded.calls.lock().unwrap().push(message.clone());

        if let Some(gate) = &self.recorded.gate {
            gate.acquire().await.unwrap().forget();
        }

        match self.injected_failure(message) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_with_returns_the_configured_error() {
        let handler = RecordingHandler::new()
            .failing_with(2, HandlerError::Decode("not json".to_string()))
            .failing_at(3);

        let decode = handler.handle(&Message::new("orders", 0, 2, vec![])).await;
        let persistence = handler.handle(&Message::new("orders", 0, 3, vec![])).await;

        assert_eq!(decode, Err(HandlerError::Decode("not json".to_string())));
        assert!(matches!(persistence, Err(HandlerError::Persistence(_))));
        assert_eq!(handler.offsets(), vec![2, 3]);
    }
}
