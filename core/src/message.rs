//! Messages delivered by the broker.
//!
//! A [`Message`] is immutable once delivered. The consumer owns it until it is
//! handed to a handler by reference; handlers never retain it past their call.

use std::collections::BTreeMap;
use std::fmt;

/// A single record polled from a broker partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Position within the partition (monotonic per partition)
    pub offset: i64,
    /// Message key (empty when the producer sent none)
    pub key: Vec<u8>,
    /// Message payload (empty when the producer sent none)
    pub value: Vec<u8>,
    /// Message headers
    pub headers: BTreeMap<String, Vec<u8>>,
}

impl Message {
    /// Create a message with an empty key and no headers.
    ///
    /// # Example
    ///
    /// ```
    /// use kafka_consumer_core::Message;
    ///
    /// let message = Message::new("orders", 0, 42, br#"{"id":1}"#.to_vec());
    /// assert_eq!(message.offset, 42);
    /// assert!(message.key.is_empty());
    /// ```
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: Vec::new(),
            value,
            headers: BTreeMap::new(),
        }
    }

    /// Set the message key (builder pattern)
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Add a header (builder pattern)
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The topic/partition pair this message belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A topic/partition pair.
///
/// Ordering guarantees hold within one `TopicPartition` and nowhere else.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder_sets_key_and_headers() {
        let message = Message::new("orders", 3, 7, b"payload".to_vec())
            .with_key("order-1")
            .with_header("trace-id", "abc");

        assert_eq!(message.key, b"order-1".to_vec());
        assert_eq!(message.headers.get("trace-id"), Some(&b"abc".to_vec()));
        assert_eq!(message.topic_partition(), TopicPartition::new("orders", 3));
    }

    #[test]
    fn topic_partition_display() {
        assert_eq!(TopicPartition::new("orders", 2).to_string(), "orders[2]");
    }
}
