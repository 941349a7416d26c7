//! Pipeline invocation records.
//!
//! One row per correlation id. The record is what makes `invoke` idempotent:
//! a retried dispatch finds the existing non-failed invocation and returns it
//! instead of firing another run.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid InvocationStatus")]
    ParseStatusError(String),
}

/// Status of a downstream pipeline run, as reported by the execution API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Succeeded | InvocationStatus::Failed)
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InvocationStatus::Pending => write!(f, "Pending"),
            InvocationStatus::Running => write!(f, "Running"),
            InvocationStatus::Succeeded => write!(f, "Succeeded"),
            InvocationStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for InvocationStatus {
    type Err = InvocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(InvocationStatus::Pending),
            "Running" | "InProgress" => Ok(InvocationStatus::Running),
            "Succeeded" => Ok(InvocationStatus::Succeeded),
            "Failed" => Ok(InvocationStatus::Failed),
            invalid => Err(InvocationError::ParseStatusError(invalid.to_owned())),
        }
    }
}

/// A dispatch attempt tied to exactly one downstream pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInvocation {
    pub correlation_id: String,
    pub pipeline_name: String,
    pub parameters: Value,
    pub status: InvocationStatus,
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait InvocationStore: Send + Sync {
    async fn find(&self, correlation_id: &str)
        -> Result<Option<PipelineInvocation>, InvocationError>;

    /// Insert or replace the record for its correlation id.
    async fn upsert(&self, invocation: &PipelineInvocation) -> Result<(), InvocationError>;

    /// Record the terminal status observed for a run.
    async fn record_terminal(
        &self,
        correlation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), InvocationError>;
}

#[derive(sqlx::FromRow)]
struct InvocationRow {
    correlation_id: String,
    pipeline_name: String,
    parameters: sqlx::types::Json<Value>,
    status: String,
    run_id: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InvocationRow> for PipelineInvocation {
    type Error = InvocationError;

    fn try_from(row: InvocationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: row.correlation_id,
            pipeline_name: row.pipeline_name,
            parameters: row.parameters.0,
            status: row.status.parse()?,
            run_id: row.run_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

pub struct PgInvocationStore {
    pool: PgPool,
}

impl PgInvocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvocationStore for PgInvocationStore {
    async fn find(
        &self,
        correlation_id: &str,
    ) -> Result<Option<PipelineInvocation>, InvocationError> {
        let base_query = r#"
SELECT correlation_id, pipeline_name, parameters, status, run_id, started_at, completed_at
FROM invocations
WHERE correlation_id = $1
        "#;

        let row: Option<InvocationRow> = sqlx::query_as(base_query)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| InvocationError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(PipelineInvocation::try_from).transpose()
    }

    async fn upsert(&self, invocation: &PipelineInvocation) -> Result<(), InvocationError> {
        let base_query = r#"
INSERT INTO invocations
    (correlation_id, pipeline_name, parameters, status, run_id, started_at, completed_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (correlation_id) DO UPDATE
SET pipeline_name = EXCLUDED.pipeline_name,
    parameters = EXCLUDED.parameters,
    status = EXCLUDED.status,
    run_id = EXCLUDED.run_id,
    started_at = EXCLUDED.started_at,
    completed_at = EXCLUDED.completed_at
        "#;

        sqlx::query(base_query)
            .bind(&invocation.correlation_id)
            .bind(&invocation.pipeline_name)
            .bind(sqlx::types::Json(&invocation.parameters))
            .bind(invocation.status.to_string())
            .bind(&invocation.run_id)
            .bind(invocation.started_at)
            .bind(invocation.completed_at)
            .execute(&self.pool)
            .await
            .map_err(|error| InvocationError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn record_terminal(
        &self,
        correlation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), InvocationError> {
        let base_query = r#"
UPDATE invocations
SET status = $2, completed_at = NOW()
WHERE correlation_id = $1
        "#;

        sqlx::query(base_query)
            .bind(correlation_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await
            .map_err(|error| InvocationError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// An in-memory invocation store, for local runs and tests.
#[derive(Default)]
pub struct MemoryInvocationStore {
    invocations: Mutex<HashMap<String, PipelineInvocation>>,
}

impl MemoryInvocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.invocations
            .lock()
            .expect("poisoned MemoryInvocationStore lock")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn find(
        &self,
        correlation_id: &str,
    ) -> Result<Option<PipelineInvocation>, InvocationError> {
        let invocations = self
            .invocations
            .lock()
            .expect("poisoned MemoryInvocationStore lock");
        Ok(invocations.get(correlation_id).cloned())
    }

    async fn upsert(&self, invocation: &PipelineInvocation) -> Result<(), InvocationError> {
        let mut invocations = self
            .invocations
            .lock()
            .expect("poisoned MemoryInvocationStore lock");
        invocations.insert(invocation.correlation_id.clone(), invocation.clone());
        Ok(())
    }

    async fn record_terminal(
        &self,
        correlation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), InvocationError> {
        let mut invocations = self
            .invocations
            .lock()
            .expect("poisoned MemoryInvocationStore lock");
        if let Some(invocation) = invocations.get_mut(correlation_id) {
            invocation.status = status;
            invocation.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
