//! Durable idempotency ledger keyed by message id.
//!
//! The conditional insert in `mark_processed` is the only cross-worker
//! synchronization point in the system: whichever worker lands the row owns
//! the message, everyone else backs off.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DedupError {
    /// Another worker already recorded this message id. Benign: the message
    /// is owned elsewhere and must not be invoked again.
    #[error("message was already recorded by another worker")]
    Conflict,
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_processed(&self, message_id: &str) -> Result<bool, DedupError>;

    /// Insert-if-absent. `Err(Conflict)` means the key already existed.
    async fn mark_processed(
        &self,
        message_id: &str,
        correlation_id: &str,
    ) -> Result<(), DedupError>;
}

/// Ledger rows in PostgreSQL; `message_id` is the primary key and
/// `ON CONFLICT DO NOTHING` turns a lost race into zero affected rows.
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn has_processed(&self, message_id: &str) -> Result<bool, DedupError> {
        let base_query = r#"
SELECT EXISTS (SELECT 1 FROM dedup_records WHERE message_id = $1)
        "#;

        let exists: bool = sqlx::query_scalar(base_query)
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DedupError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(exists)
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        correlation_id: &str,
    ) -> Result<(), DedupError> {
        let base_query = r#"
INSERT INTO dedup_records (message_id, correlation_id, processed_at)
VALUES ($1, $2, NOW())
ON CONFLICT (message_id) DO NOTHING
        "#;

        let result = sqlx::query(base_query)
            .bind(message_id)
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .map_err(|error| DedupError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(DedupError::Conflict);
        }

        Ok(())
    }
}

/// An in-memory ledger with the same conflict semantics, for local runs and
/// tests.
#[derive(Default)]
pub struct MemoryDedupStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn has_processed(&self, message_id: &str) -> Result<bool, DedupError> {
        let records = self.records.lock().expect("poisoned MemoryDedupStore lock");
        Ok(records.contains_key(message_id))
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        correlation_id: &str,
    ) -> Result<(), DedupError> {
        let mut records = self.records.lock().expect("poisoned MemoryDedupStore lock");
        if records.contains_key(message_id) {
            return Err(DedupError::Conflict);
        }
        records.insert(message_id.to_owned(), correlation_id.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_processed_is_insert_if_absent() {
        let store = MemoryDedupStore::new();

        assert!(!store.has_processed("m1").await.unwrap());
        store
            .mark_processed("m1", "m1")
            .await
            .expect("first insert should win");
        assert!(store.has_processed("m1").await.unwrap());

        let error = store.mark_processed("m1", "m1").await.unwrap_err();
        assert!(matches!(error, DedupError::Conflict));
    }

    #[tokio::test]
    async fn test_distinct_message_ids_do_not_conflict() {
        let store = MemoryDedupStore::new();

        store.mark_processed("m1", "m1").await.unwrap();
        store.mark_processed("m2", "m2").await.unwrap();

        assert!(store.has_processed("m1").await.unwrap());
        assert!(store.has_processed("m2").await.unwrap());
    }
}
