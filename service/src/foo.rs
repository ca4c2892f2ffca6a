//! The `Foo` record and its persistence.
//!
//! A `Foo` is decoded from the JSON value of a message on the foo topic and
//! upserted by id. Redelivery of the same message writes the same row again,
//! which keeps the handler idempotent under at-least-once delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kafka_consumer_core::Message;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// JSON payload carried by a foo message.
///
/// ```json
/// {"id": "5f0c...", "name": "foo", "description": "optional"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooPayload {
    /// Record id; derived from the message coordinates when absent
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

impl FooPayload {
    /// Decode a message value.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the value is empty, is not
    /// valid JSON for this payload, or has a blank name.
    pub fn decode(value: &[u8]) -> Result<Self, String> {
        if value.is_empty() {
            return Err("message value is empty".to_string());
        }
        let payload: Self =
            serde_json::from_slice(value).map_err(|e| format!("invalid foo payload: {e}"))?;
        if payload.name.trim().is_empty() {
            return Err("foo name must not be empty".to_string());
        }
        Ok(payload)
    }
}

/// A persisted foo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Foo {
    /// Record id
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Topic of the message that produced this record
    pub source_topic: String,
    /// Partition of the message that produced this record
    pub source_partition: i32,
    /// Offset of the message that produced this record
    pub source_offset: i64,
    /// When the record was handled
    pub received_at: DateTime<Utc>,
}

impl Foo {
    /// Build a record from a decoded payload and the message it came from.
    ///
    /// Without an explicit id, the id is a v5 UUID of the message
    /// coordinates, so a redelivered message maps to the same row.
    #[must_use]
    pub fn from_message(payload: FooPayload, message: &Message, received_at: DateTime<Utc>) -> Self {
        let id = payload.id.unwrap_or_else(|| {
            let coordinates = format!("{}/{}/{}", message.topic, message.partition, message.offset);
            Uuid::new_v5(&Uuid::NAMESPACE_OID, coordinates.as_bytes())
        });

        Self {
            id,
            name: payload.name,
            description: payload.description,
            source_topic: message.topic.clone(),
            source_partition: message.partition,
            source_offset: message.offset,
            received_at,
        }
    }
}

/// Repository errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The storage backend rejected the operation
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Persistence collaborator of the foo handler.
#[async_trait]
pub trait FooRepository: Send + Sync {
    /// Insert or replace a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the record could not be written.
    async fn save(&self, foo: &Foo) -> Result<(), RepositoryError>;
}

/// `PostgreSQL` repository over the `foos` table.
#[derive(Debug, Clone)]
pub struct PostgresFooRepository {
    pool: PgPool,
}

impl PostgresFooRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the query fails.
    pub async fn find(&self, id: Uuid) -> Result<Option<Foo>, RepositoryError> {
        let row = sqlx::query(
            r"
            SELECT id, name, description, source_topic, source_partition, source_offset, updated_at
            FROM foos
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(format!("Failed to load foo {id}: {e}")))?;

        row.map(|row| {
            Ok(Foo {
                id: row.try_get("id").map_err(storage)?,
                name: row.try_get("name").map_err(storage)?,
                description: row.try_get("description").map_err(storage)?,
                source_topic: row.try_get("source_topic").map_err(storage)?,
                source_partition: row.try_get("source_partition").map_err(storage)?,
                source_offset: row.try_get("source_offset").map_err(storage)?,
                received_at: row.try_get("updated_at").map_err(storage)?,
            })
        })
        .transpose()
    }
}

#[allow(clippy::needless_pass_by_value)]
fn storage(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(error.to_string())
}

#[async_trait]
impl FooRepository for PostgresFooRepository {
    async fn save(&self, foo: &Foo) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO foos (id, name, description, source_topic, source_partition, source_offset, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                source_topic = EXCLUDED.source_topic,
                source_partition = EXCLUDED.source_partition,
                source_offset = EXCLUDED.source_offset,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(foo.id)
        .bind(&foo.name)
        .bind(&foo.description)
        .bind(&foo.source_topic)
        .bind(foo.source_partition)
        .bind(foo.source_offset)
        .bind(foo.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(format!("Failed to save foo {}: {e}", foo.id)))?;

        tracing::debug!(foo_id = %foo.id, "Foo saved");
        Ok(())
    }
}

/// In-memory repository for tests and local runs without a database.
#[derive(Debug, Default)]
pub struct InMemoryFooRepository {
    records: Mutex<HashMap<Uuid, Foo>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryFooRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Load a record by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Foo> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FooRepository for InMemoryFooRepository {
    async fn save(&self, foo: &Foo) -> Result<(), RepositoryError> {
        if let Some(reason) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(RepositoryError::Storage(reason));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(foo.id, foo.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn decode_accepts_minimal_payload() {
        let payload = FooPayload::decode(br#"{"name":"foo"}"#).unwrap();

        assert_eq!(payload.name, "foo");
        assert_eq!(payload.id, None);
        assert_eq!(payload.description, None);
    }

    #[test]
    fn decode_rejects_bad_values() {
        assert!(FooPayload::decode(b"").unwrap_err().contains("empty"));
        assert!(FooPayload::decode(b"not json").is_err());
        assert!(FooPayload::decode(br#"{"description":"no name"}"#).is_err());
        assert!(FooPayload::decode(br#"{"name":"  "}"#).is_err());
    }

    #[test]
    fn derived_id_is_stable_per_message() {
        let message = Message::new("foo", 2, 17, br#"{"name":"foo"}"#.to_vec());
        let payload = FooPayload::decode(&message.value).unwrap();
        let now = Utc::now();

        let first = Foo::from_message(payload.clone(), &message, now);
        let second = Foo::from_message(payload, &message, now);
        let other = Foo::from_message(
            FooPayload::decode(&message.value).unwrap(),
            &Message::new("foo", 2, 18, Vec::new()),
            now,
        );

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.source_partition, 2);
        assert_eq!(first.source_offset, 17);
    }

    #[test]
    fn explicit_id_wins() {
        let id = Uuid::new_v4();
        let value = format!(r#"{{"id":"{id}","name":"foo"}}"#);
        let message = Message::new("foo", 0, 0, value.into_bytes());

        let foo = Foo::from_message(FooPayload::decode(&message.value).unwrap(), &message, Utc::now());
        assert_eq!(foo.id, id);
    }

    #[tokio::test]
    async fn in_memory_repository_upserts() {
        let repository = InMemoryFooRepository::new();
        let message = Message::new("foo", 0, 0, Vec::new());
        let mut foo = Foo::from_message(
            FooPayload { id: None, name: "first".to_string(), description: None },
            &message,
            Utc::now(),
        );

        repository.save(&foo).await.unwrap();
        foo.name = "second".to_string();
        repository.save(&foo).await.unwrap();

        assert_eq!(repository.len(), 1);
        assert_eq!(repository.get(foo.id).unwrap().name, "second");
    }
}
