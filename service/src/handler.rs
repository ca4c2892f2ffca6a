//! Message handler that persists foo records.

use crate::foo::{Foo, FooPayload, FooRepository};
use async_trait::async_trait;
use chrono::Utc;
use kafka_consumer_core::{HandlerError, Message, MessageHandler};
use std::sync::Arc;
use tracing::debug;

/// Decodes foo messages and saves them through a [`FooRepository`].
///
/// Errors are returned to the runtime, which logs them with the message
/// coordinates; the handler does not log failures itself.
#[derive(Clone)]
pub struct FooHandler {
    repository: Arc<dyn FooRepository>,
}

impl FooHandler {
    /// Create a handler over a repository.
    #[must_use]
    pub fn new(repository: Arc<dyn FooRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl MessageHandler for FooHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let payload = FooPayload::decode(&message.value).map_err(HandlerError::Decode)?;
        let foo = Foo::from_message(payload, message, Utc::now());

        self.repository
            .save(&foo)
            .await
            .map_err(|e| HandlerError::Persistence(e.to_string()))?;

        debug!(
            foo_id = %foo.id,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message handled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::foo::InMemoryFooRepository;

    fn handler() -> (Arc<InMemoryFooRepository>, FooHandler) {
        let repository = Arc::new(InMemoryFooRepository::new());
        let handler = FooHandler::new(Arc::clone(&repository) as Arc<dyn FooRepository>);
        (repository, handler)
    }

    #[tokio::test]
    async fn saves_decoded_record() {
        let (repository, handler) = handler();
        let message = Message::new("foo", 1, 5, br#"{"name":"foo","description":"bar"}"#.to_vec());

        handler.handle(&message).await.unwrap();

        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_writes_the_same_row() {
        let (repository, handler) = handler();
        let message = Message::new("foo", 1, 5, br#"{"name":"foo"}"#.to_vec());

        handler.handle(&message).await.unwrap();
        handler.handle(&message).await.unwrap();

        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn empty_value_is_a_decode_error() {
        let (repository, handler) = handler();

        let err = handler.handle(&Message::new("foo", 0, 0, Vec::new())).await.unwrap_err();

        assert!(matches!(err, HandlerError::Decode(_)));
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let (_, handler) = handler();

        let err = handler
            .handle(&Message::new("foo", 0, 0, b"{not json".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn repository_failure_is_a_persistence_error() {
        let (repository, handler) = handler();
        repository.fail_with("connection reset");

        let err = handler
            .handle(&Message::new("foo", 0, 0, br#"{"name":"foo"}"#.to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Persistence(ref m) if m.contains("connection reset")));
    }
}
