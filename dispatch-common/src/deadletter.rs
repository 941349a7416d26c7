//! Durable holding area for events that exhausted retries or failed
//! validation.
//!
//! Entries keep the serialized original event so a replay can rebuild it
//! with its message id intact. Recording is idempotent per message id: a
//! redelivered exhausted job updates the existing entry instead of creating
//! a second one.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub message_id: String,
    /// The serialized original event (or the raw payload when it never
    /// decoded into one).
    pub event: sqlx::types::Json<Value>,
    pub failure_reason: String,
    pub attempt_count: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewDeadLetter {
    pub message_id: String,
    pub event: Value,
    pub failure_reason: String,
    pub attempt_count: i32,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError>;

    /// A finite batch re-queried from the durable store, oldest first.
    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// Remove an entry after a successful replay.
    async fn delete(&self, id: i64) -> Result<(), DeadLetterError>;

    /// Bump attempt metadata after a failed replay, for operator visibility.
    async fn record_attempt(&self, id: i64) -> Result<(), DeadLetterError>;
}

pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn record(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError> {
        let base_query = r#"
INSERT INTO dead_letters
    (message_id, event, failure_reason, attempt_count, first_failed_at, last_attempt_at)
VALUES
    ($1, $2, $3, $4, NOW(), NOW())
ON CONFLICT (message_id) DO UPDATE
SET failure_reason = EXCLUDED.failure_reason,
    attempt_count = EXCLUDED.attempt_count,
    last_attempt_at = NOW()
        "#;

        sqlx::query(base_query)
            .bind(&entry.message_id)
            .bind(sqlx::types::Json(&entry.event))
            .bind(&entry.failure_reason)
            .bind(entry.attempt_count)
            .execute(&self.pool)
            .await
            .map_err(|error| DeadLetterError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let base_query = r#"
SELECT id, message_id, event, failure_reason, attempt_count, first_failed_at, last_attempt_at
FROM dead_letters
ORDER BY first_failed_at
LIMIT $1
        "#;

        sqlx::query_as(base_query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DeadLetterError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn delete(&self, id: i64) -> Result<(), DeadLetterError> {
        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| DeadLetterError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn record_attempt(&self, id: i64) -> Result<(), DeadLetterError> {
        let base_query = r#"
UPDATE dead_letters
SET attempt_count = attempt_count + 1, last_attempt_at = NOW()
WHERE id = $1
        "#;

        sqlx::query(base_query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| DeadLetterError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// An in-memory dead-letter store, for local runs and tests.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<HashMap<i64, DeadLetterEntry>>,
    next_id: Mutex<i64>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError> {
        let mut entries = self
            .entries
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock");

        if let Some(existing) = entries
            .values_mut()
            .find(|existing| existing.message_id == entry.message_id)
        {
            existing.failure_reason = entry.failure_reason;
            existing.attempt_count = entry.attempt_count;
            existing.last_attempt_at = Utc::now();
            return Ok(());
        }

        let mut next_id = self
            .next_id
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock");
        *next_id += 1;
        entries.insert(
            *next_id,
            DeadLetterEntry {
                id: *next_id,
                message_id: entry.message_id,
                event: sqlx::types::Json(entry.event),
                failure_reason: entry.failure_reason,
                attempt_count: entry.attempt_count,
                first_failed_at: Utc::now(),
                last_attempt_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self
            .entries
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock");
        let mut listed: Vec<DeadLetterEntry> = entries.values().cloned().collect();
        listed.sort_by_key(|entry| entry.id);
        listed.truncate(limit as usize);
        Ok(listed)
    }

    async fn delete(&self, id: i64) -> Result<(), DeadLetterError> {
        self.entries
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock")
            .remove(&id);
        Ok(())
    }

    async fn record_attempt(&self, id: i64) -> Result<(), DeadLetterError> {
        let mut entries = self
            .entries
            .lock()
            .expect("poisoned MemoryDeadLetterStore lock");
        if let Some(entry) = entries.get_mut(&id) {
            entry.attempt_count += 1;
            entry.last_attempt_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_entry(message_id: &str) -> NewDeadLetter {
        NewDeadLetter {
            message_id: message_id.to_owned(),
            event: json!({"id": message_id}),
            failure_reason: "simulated".to_owned(),
            attempt_count: 3,
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent_per_message_id() {
        let store = MemoryDeadLetterStore::new();

        store.record(new_entry("m1")).await.unwrap();
        store.record(new_entry("m1")).await.unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_id, "m1");
    }

    #[tokio::test]
    async fn test_list_is_restartable_and_delete_removes() {
        let store = MemoryDeadLetterStore::new();
        store.record(new_entry("m1")).await.unwrap();
        store.record(new_entry("m2")).await.unwrap();

        let first = store.list(10).await.unwrap();
        assert_eq!(first.len(), 2);

        store.delete(first[0].id).await.unwrap();

        let second = store.list(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, "m2");
    }

    #[tokio::test]
    async fn test_record_attempt_bumps_metadata() {
        let store = MemoryDeadLetterStore::new();
        store.record(new_entry("m1")).await.unwrap();

        let entry = &store.list(1).await.unwrap()[0];
        store.record_attempt(entry.id).await.unwrap();

        let after = &store.list(1).await.unwrap()[0];
        assert_eq!(after.attempt_count, entry.attempt_count + 1);
    }
}
