//! # Dispatch queue
//!
//! The message transport: a queue implemented on top of a PostgreSQL table.
//! Delivery is at-least-once: a dequeued job moves to `running`, and a
//! `running` job whose worker overruns the visibility timeout becomes
//! re-deliverable. Duplicate processing that follows from redelivery is
//! resolved by the dedup ledger, not by the queue.
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

/// Enumeration of database-related errors in the queue.
/// Errors originate from sqlx and are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// An error that occurs when a job cannot be retried.
/// Returns the underlying job so that the caller can dead-letter and fail it.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    QueueError(#[from] QueueError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

/// Enumeration of possible statuses for a job.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue to be picked up by a worker.
    Available,
    /// Picked up by a worker; re-deliverable once the visibility timeout passes.
    Running,
    /// Successfully processed; kept until the housekeeping purge.
    Completed,
    /// Terminally failed; its events live on in the dead-letter store.
    Failed,
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(QueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// A job dequeued from the dispatch queue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    /// The current (1-based, after dequeue) attempt number.
    pub attempt: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    /// Identifiers of the workers that have attempted this job.
    pub attempted_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued; pushed forward on retry.
    pub scheduled_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    /// The raw inbound envelope, stored as JSONB.
    pub payload: sqlx::types::Json<J>,
    pub queue: String,
    pub status: JobStatus,
}

impl<J> Job<J> {
    /// True once this attempt has reached the maximum number of attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A new job to be enqueued into the dispatch queue.
#[derive(Debug)]
pub struct NewJob<J> {
    pub max_attempts: i32,
    pub payload: sqlx::types::Json<J>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, payload: J) -> Self {
        Self {
            max_attempts,
            payload: sqlx::types::Json(payload),
        }
    }
}

/// A dequeued job together with the pool needed to transition it.
/// Consuming methods enforce that a job is completed, retried or failed
/// exactly once.
#[derive(Debug)]
pub struct DequeuedJob<J> {
    pub job: Job<J>,
    pool: PgPool,
}

impl<J: Send> DequeuedJob<J> {
    /// Mark this job completed and drop it from the active queue.
    pub async fn complete(self) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE dispatch_queue
SET
    finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Make this job available again after `retry_interval`.
    /// Fails with `RetryInvalidError` (handing the job back) when no
    /// attempts remain.
    pub async fn retry(
        self,
        error_reason: &str,
        retry_interval: time::Duration,
    ) -> Result<(), RetryError<DequeuedJob<J>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: self,
                error: "maximum attempts reached".to_owned(),
            }));
        }

        let base_query = r#"
UPDATE dispatch_queue
SET
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(retry_interval)
            .bind(error_reason)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Mark this job terminally failed. The job leaves the active queue;
    /// its events are expected to be in the dead-letter store by now.
    pub async fn fail(self, error_reason: &str) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE dispatch_queue
SET
    finished_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(error_reason)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this queue as multiple may share a table.
    name: String,
    pool: PgPool,
    /// How long a `running` job stays invisible before it is re-deliverable.
    visibility_timeout: time::Duration,
}

pub type PgQueueResult<T> = std::result::Result<T, QueueError>;

impl PgQueue {
    /// Initialize a queue, lazily connecting to the database in `url`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
        visibility_timeout: time::Duration,
    ) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| QueueError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            name: queue_name.to_owned(),
            pool,
            visibility_timeout,
        })
    }

    /// Initialize a queue from an existing connection pool.
    pub fn new_from_pool(
        queue_name: &str,
        pool: PgPool,
        visibility_timeout: time::Duration,
    ) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
            visibility_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a new job. Takes ownership of `NewJob` so a given job is only
    /// enqueued once.
    pub async fn enqueue<J: Serialize + Sync + Send>(&self, job: NewJob<J>) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO dispatch_queue
    (attempt, created_at, scheduled_at, max_attempts, payload, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::job_status)
        "#;

        sqlx::query(base_query)
            .bind(job.max_attempts)
            .bind(&job.payload)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Dequeue the next deliverable job, if any.
    ///
    /// Deliverable means `available` with a due `scheduled_at`, or `running`
    /// with an `attempted_at` older than the visibility timeout (its worker
    /// is presumed dead). Competing workers skip locked rows, so a job is
    /// handed to at most one of them.
    pub async fn dequeue<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
        attempted_by: &str,
    ) -> PgQueueResult<Option<DequeuedJob<J>>> {
        let base_query = r#"
WITH deliverable AS (
    SELECT id
    FROM dispatch_queue
    WHERE
        queue = $1
        AND (
            (status = 'available' AND scheduled_at <= NOW())
            OR (status = 'running' AND attempted_at < NOW() - $2)
        )
    ORDER BY attempt, scheduled_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE dispatch_queue
SET
    attempted_at = NOW(),
    status = 'running'::job_status,
    attempt = dispatch_queue.attempt + 1,
    attempted_by = array_append(dispatch_queue.attempted_by, $3::text)
FROM deliverable
WHERE dispatch_queue.id = deliverable.id
RETURNING dispatch_queue.*
        "#;

        let job: Option<Job<J>> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(self.visibility_timeout)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job.map(|job| DequeuedJob {
            job,
            pool: self.pool.clone(),
        }))
    }

    /// Housekeeping: drop completed jobs older than `older_than`.
    pub async fn purge_completed(&self, older_than: time::Duration) -> PgQueueResult<u64> {
        let base_query = r#"
DELETE FROM dispatch_queue
WHERE
    queue = $1
    AND status = 'completed'::job_status
    AND finished_at < NOW() - $2
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }
}

/// Producer-side seam: anything inbound envelopes can be submitted to.
/// The API service and the tests use this instead of a concrete queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, envelope: Value, max_attempts: i32) -> Result<(), QueueError>;
}

#[async_trait]
impl EventSink for PgQueue {
    async fn submit(&self, envelope: Value, max_attempts: i32) -> Result<(), QueueError> {
        self.enqueue(NewJob::new(max_attempts, envelope)).await
    }
}

/// An in-memory sink recording submitted envelopes.
#[derive(Default)]
pub struct MemoryEventSink {
    submitted: Mutex<Vec<Value>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn submit(&self, envelope: Value, _max_attempts: i32) -> Result<(), QueueError> {
        self.submitted.lock().await.push(envelope);
        Ok(())
    }
}
