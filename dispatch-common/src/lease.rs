//! Distributed leases for scheduled single-shot runs.
//!
//! A lease is a time-bounded mutual-exclusion token over a resource id. At
//! most one unexpired lease exists per resource; the TTL is the safety net
//! against a crashed holder. Leases coordinate redundant timer instances,
//! not queue consumption.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{self, Instant};

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another owner holds an unexpired lease. Expected under redundancy,
    /// never an error condition for the caller.
    #[error("lease on {0} is held by another owner")]
    Held(String),
    /// The lease expired or changed hands before the renewal landed.
    #[error("lease on {0} was lost before renewal")]
    Lost(String),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Proof of ownership handed out by `acquire`; required for renew/release.
#[derive(Debug, Clone)]
pub struct LeaseToken {
    pub resource_id: String,
    pub owner: Uuid,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease on `resource_id` for `ttl`, or fail with `Held`.
    async fn acquire(&self, resource_id: &str, ttl: time::Duration)
        -> Result<LeaseToken, LeaseError>;

    /// Push the expiry of a held lease forward, or fail with `Lost`.
    async fn renew(&self, token: &LeaseToken, ttl: time::Duration) -> Result<(), LeaseError>;

    /// Give the lease up. Idempotent: releasing an expired or foreign lease
    /// is a no-op, not an error.
    async fn release(&self, token: LeaseToken) -> Result<(), LeaseError>;
}

/// Lease rows in PostgreSQL. One row per resource; takeover of an expired
/// lease is a single conditional upsert, so two contenders can never both
/// win.
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn acquire(
        &self,
        resource_id: &str,
        ttl: time::Duration,
    ) -> Result<LeaseToken, LeaseError> {
        let owner = Uuid::now_v7();
        let base_query = r#"
INSERT INTO leases (resource_id, owner_token, expires_at)
VALUES ($1, $2, NOW() + $3)
ON CONFLICT (resource_id) DO UPDATE
SET owner_token = EXCLUDED.owner_token, expires_at = EXCLUDED.expires_at
WHERE leases.expires_at <= NOW()
        "#;

        let result = sqlx::query(base_query)
            .bind(resource_id)
            .bind(owner)
            .bind(ttl)
            .execute(&self.pool)
            .await
            .map_err(|error| LeaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::Held(resource_id.to_owned()));
        }

        Ok(LeaseToken {
            resource_id: resource_id.to_owned(),
            owner,
        })
    }

    async fn renew(&self, token: &LeaseToken, ttl: time::Duration) -> Result<(), LeaseError> {
        let base_query = r#"
UPDATE leases
SET expires_at = NOW() + $3
WHERE resource_id = $1 AND owner_token = $2 AND expires_at > NOW()
        "#;

        let result = sqlx::query(base_query)
            .bind(&token.resource_id)
            .bind(token.owner)
            .bind(ttl)
            .execute(&self.pool)
            .await
            .map_err(|error| LeaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::Lost(token.resource_id.clone()));
        }

        Ok(())
    }

    async fn release(&self, token: LeaseToken) -> Result<(), LeaseError> {
        let base_query = r#"
DELETE FROM leases WHERE resource_id = $1 AND owner_token = $2
        "#;

        sqlx::query(base_query)
            .bind(&token.resource_id)
            .bind(token.owner)
            .execute(&self.pool)
            .await
            .map_err(|error| LeaseError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// An in-memory lease store with the same semantics, for local runs and
/// tests.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(
        &self,
        resource_id: &str,
        ttl: time::Duration,
    ) -> Result<LeaseToken, LeaseError> {
        let mut leases = self.leases.lock().expect("poisoned MemoryLeaseStore lock");
        let now = Instant::now();

        if let Some((_, expires_at)) = leases.get(resource_id) {
            if *expires_at > now {
                return Err(LeaseError::Held(resource_id.to_owned()));
            }
        }

        let owner = Uuid::now_v7();
        leases.insert(resource_id.to_owned(), (owner, now + ttl));
        Ok(LeaseToken {
            resource_id: resource_id.to_owned(),
            owner,
        })
    }

    async fn renew(&self, token: &LeaseToken, ttl: time::Duration) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().expect("poisoned MemoryLeaseStore lock");
        let now = Instant::now();

        match leases.get_mut(&token.resource_id) {
            Some((owner, expires_at)) if *owner == token.owner && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LeaseError::Lost(token.resource_id.clone())),
        }
    }

    async fn release(&self, token: LeaseToken) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().expect("poisoned MemoryLeaseStore lock");
        if let Some((owner, _)) = leases.get(&token.resource_id) {
            if *owner == token.owner {
                leases.remove(&token.resource_id);
            }
        }
        Ok(())
    }
}
