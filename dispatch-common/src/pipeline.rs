//! Client for the external pipeline execution API.
//!
//! The API is an opaque collaborator: `POST /pipelines/{name}/run` starts a
//! run, `GET /runs/{run_id}` reports its status. Invocations go through
//! `PipelineInvoker`, which makes them idempotent per correlation id.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::invocation::{
    InvocationError, InvocationStatus, InvocationStore, PipelineInvocation,
};

pub type RunId = String;

/// Enumeration of errors returned by the pipeline execution API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The run id is unknown to the pipeline service.
    #[error("run {0} is not known to the pipeline service")]
    NotFound(String),
    /// Transport failure or a 5xx/429 answer. Retrying later may resolve it.
    #[error("pipeline service request failed: {0}")]
    Upstream(String),
    /// The service rejected the request outright; retrying will not help.
    #[error("pipeline service rejected the request: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Upstream(_))
    }
}

#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn create_run(&self, pipeline_name: &str, parameters: &Value)
        -> Result<RunId, ApiError>;

    async fn run_status(&self, run_id: &str) -> Result<InvocationStatus, ApiError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCreated {
    run_id: RunId,
}

#[derive(Deserialize)]
struct RunStatusResponse {
    status: String,
}

/// The production client, speaking HTTP to the pipeline service.
pub struct HttpPipelineApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPipelineApi {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Self {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Pipeline Dispatch")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for the pipeline api");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn classify(status: reqwest::StatusCode, body: String) -> ApiError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ApiError::Upstream(format!("{status}: {body}"))
        } else {
            ApiError::Rejected(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn create_run(
        &self,
        pipeline_name: &str,
        parameters: &Value,
    ) -> Result<RunId, ApiError> {
        let url = format!("{}/pipelines/{}/run", self.base_url, pipeline_name);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "parameters": parameters }))
            .send()
            .await
            .map_err(|error| ApiError::Upstream(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        let created: RunCreated = response
            .json()
            .await
            .map_err(|error| ApiError::Upstream(error.to_string()))?;

        Ok(created.run_id)
    }

    async fn run_status(&self, run_id: &str) -> Result<InvocationStatus, ApiError> {
        let url = format!("{}/runs/{}", self.base_url, run_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| ApiError::Upstream(error.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(run_id.to_owned()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        let parsed: RunStatusResponse = response
            .json()
            .await
            .map_err(|error| ApiError::Upstream(error.to_string()))?;

        parsed
            .status
            .parse()
            .map_err(|error: InvocationError| ApiError::Upstream(error.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] InvocationError),
}

/// Idempotent front over the execution API: at most one run per correlation
/// id, unless the previous invocation failed.
pub struct PipelineInvoker {
    api: Arc<dyn PipelineApi>,
    store: Arc<dyn InvocationStore>,
}

impl PipelineInvoker {
    pub fn new(api: Arc<dyn PipelineApi>, store: Arc<dyn InvocationStore>) -> Self {
        Self { api, store }
    }

    pub fn api(&self) -> &Arc<dyn PipelineApi> {
        &self.api
    }

    pub fn store(&self) -> &Arc<dyn InvocationStore> {
        &self.store
    }

    pub async fn invoke(
        &self,
        pipeline_name: &str,
        parameters: &Value,
        correlation_id: &str,
    ) -> Result<PipelineInvocation, InvokeError> {
        if let Some(existing) = self.store.find(correlation_id).await? {
            if existing.status != InvocationStatus::Failed {
                debug!(
                    correlation_id,
                    run_id = existing.run_id.as_deref(),
                    "reusing existing invocation"
                );
                return Ok(existing);
            }
        }

        let run_id = self.api.create_run(pipeline_name, parameters).await?;

        let invocation = PipelineInvocation {
            correlation_id: correlation_id.to_owned(),
            pipeline_name: pipeline_name.to_owned(),
            parameters: parameters.clone(),
            status: InvocationStatus::Running,
            run_id: Some(run_id),
            started_at: Utc::now(),
            completed_at: None,
        };
        self.store.upsert(&invocation).await?;

        Ok(invocation)
    }
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("run {run_id} did not reach a terminal status within {timeout:?}")]
    Timeout {
        run_id: String,
        timeout: time::Duration,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Wait for a run to reach a terminal status, checking every `interval`.
///
/// Transient upstream failures are tolerated until the deadline; an unknown
/// run id is surfaced immediately. On timeout the run is neither cancelled
/// nor presumed failed. The future is plainly cancellable by the caller.
pub async fn poll_run(
    api: &dyn PipelineApi,
    run_id: &str,
    interval: time::Duration,
    timeout: time::Duration,
) -> Result<InvocationStatus, PollError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                run_id: run_id.to_owned(),
                timeout,
            });
        }

        tokio::time::sleep_until(std::cmp::min(now + interval, deadline)).await;

        match api.run_status(run_id).await {
            Ok(status) if status.is_terminal() => return Ok(status),
            Ok(_) => {}
            Err(ApiError::NotFound(id)) => return Err(PollError::Api(ApiError::NotFound(id))),
            Err(error) => {
                debug!(run_id, "tolerating poll failure until the deadline: {error}");
            }
        }
    }
}

/// A scripted in-memory pipeline API, for local runs and tests.
#[derive(Default)]
pub struct MockPipelineApi {
    /// Number of `create_run` calls that fail upstream before calls succeed.
    /// `u32::MAX` fails forever.
    upstream_failures: AtomicU32,
    runs_created: Mutex<Vec<(String, Value)>>,
    status_script: Mutex<VecDeque<InvocationStatus>>,
    status_calls: AtomicU32,
}

impl MockPipelineApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_upstream(times: u32) -> Self {
        let api = Self::default();
        api.upstream_failures.store(times, Ordering::SeqCst);
        api
    }

    /// Statuses returned by successive `run_status` calls; once the script
    /// runs dry every further call reports `Running`.
    pub fn with_status_script(self, statuses: Vec<InvocationStatus>) -> Self {
        *self.status_script.lock().expect("poisoned MockPipelineApi lock") =
            statuses.into();
        self
    }

    pub fn runs_created(&self) -> Vec<(String, Value)> {
        self.runs_created
            .lock()
            .expect("poisoned MockPipelineApi lock")
            .clone()
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineApi for MockPipelineApi {
    async fn create_run(
        &self,
        pipeline_name: &str,
        parameters: &Value,
    ) -> Result<RunId, ApiError> {
        let remaining = self.upstream_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.upstream_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(ApiError::Upstream("simulated upstream failure".to_owned()));
        }

        let mut runs = self
            .runs_created
            .lock()
            .expect("poisoned MockPipelineApi lock");
        runs.push((pipeline_name.to_owned(), parameters.clone()));
        Ok(format!("run-{}", runs.len()))
    }

    async fn run_status(&self, _run_id: &str) -> Result<InvocationStatus, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self
            .status_script
            .lock()
            .expect("poisoned MockPipelineApi lock");
        Ok(script.pop_front().unwrap_or(InvocationStatus::Running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::MemoryInvocationStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_invoke_reuses_existing_invocation() {
        let api = Arc::new(MockPipelineApi::new());
        let store = Arc::new(MemoryInvocationStore::new());
        let invoker = PipelineInvoker::new(api.clone(), store);

        let first = invoker
            .invoke("pl_a", &json!({"runDate": "2024-03-01"}), "c1")
            .await
            .expect("first invoke should create a run");
        let second = invoker
            .invoke("pl_a", &json!({"runDate": "2024-03-01"}), "c1")
            .await
            .expect("second invoke should reuse the run");

        assert_eq!(first.run_id, second.run_id);
        assert_eq!(api.runs_created().len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_reruns_after_failure() {
        let api = Arc::new(MockPipelineApi::new());
        let store = Arc::new(MemoryInvocationStore::new());
        let invoker = PipelineInvoker::new(api.clone(), store.clone());

        invoker.invoke("pl_a", &json!({}), "c1").await.unwrap();
        store
            .record_terminal("c1", InvocationStatus::Failed)
            .await
            .unwrap();

        let rerun = invoker.invoke("pl_a", &json!({}), "c1").await.unwrap();

        assert_eq!(api.runs_created().len(), 2);
        assert_eq!(rerun.status, InvocationStatus::Running);
    }

    #[tokio::test]
    async fn test_invoke_surfaces_upstream_errors() {
        let api = Arc::new(MockPipelineApi::failing_upstream(u32::MAX));
        let store = Arc::new(MemoryInvocationStore::new());
        let invoker = PipelineInvoker::new(api, store.clone());

        let error = invoker.invoke("pl_a", &json!({}), "c1").await.unwrap_err();

        assert!(matches!(error, InvokeError::Api(ApiError::Upstream(_))));
        // No phantom invocation row is left behind.
        assert!(store.find("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_returns_terminal_status() {
        let api = MockPipelineApi::new().with_status_script(vec![
            InvocationStatus::Running,
            InvocationStatus::Running,
            InvocationStatus::Succeeded,
        ]);

        let status = poll_run(
            &api,
            "run-1",
            time::Duration::from_millis(10),
            time::Duration::from_secs(5),
        )
        .await
        .expect("poll should observe the terminal status");

        assert_eq!(status, InvocationStatus::Succeeded);
        assert_eq!(api.status_calls(), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out_on_a_running_run() {
        let api = MockPipelineApi::new();

        let error = poll_run(
            &api,
            "run-1",
            time::Duration::from_millis(10),
            time::Duration::from_millis(60),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, PollError::Timeout { .. }));
        // The poller kept checking until the deadline, not forever.
        assert!(api.status_calls() >= 2);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Upstream("503".to_owned()).is_retryable());
        assert!(!ApiError::Rejected("400".to_owned()).is_retryable());
        assert!(!ApiError::NotFound("run-1".to_owned()).is_retryable());
    }
}
