use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_derive::Deserialize;

use dispatch_common::invocation::InvocationStatus;
use dispatch_common::pipeline::{poll_run, ApiError, PipelineApi, PollError};

use crate::handlers::AppState;

#[derive(Serialize, Deserialize)]
pub struct RunStatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<InvocationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    /// When set, wait up to this many seconds for a terminal status.
    wait_s: Option<u64>,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn error_response(code: StatusCode, message: String) -> (StatusCode, Json<RunStatusResponse>) {
    (
        code,
        Json(RunStatusResponse {
            status: None,
            error: Some(message),
        }),
    )
}

fn map_api_error(error: ApiError) -> (StatusCode, Json<RunStatusResponse>) {
    match error {
        ApiError::NotFound(_) => error_response(StatusCode::NOT_FOUND, error.to_string()),
        _ => error_response(StatusCode::BAD_GATEWAY, error.to_string()),
    }
}

/// Read the status of a pipeline run, optionally waiting for completion.
/// The wait is the bounded status poller: a run that stays non-terminal past
/// the deadline answers 408 and is neither cancelled nor presumed failed.
pub async fn status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<RunStatusResponse>, (StatusCode, Json<RunStatusResponse>)> {
    let status = match query.wait_s {
        None => state
            .api
            .run_status(&run_id)
            .await
            .map_err(map_api_error)?,
        Some(wait_s) => poll_run(
            state.api.as_ref(),
            &run_id,
            Duration::from_millis(query.interval_ms),
            Duration::from_secs(wait_s),
        )
        .await
        .map_err(|error| match error {
            PollError::Timeout { .. } => {
                error_response(StatusCode::REQUEST_TIMEOUT, error.to_string())
            }
            PollError::Api(api_error) => map_api_error(api_error),
        })?,
    };

    Ok(Json(RunStatusResponse {
        status: Some(status),
        error: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{self, Request},
        Router,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use dispatch_common::pipeline::MockPipelineApi;
    use dispatch_common::queue::MemoryEventSink;

    use crate::handlers::{add_routes, AppState};

    fn app(api: MockPipelineApi) -> Router {
        let state = AppState {
            sink: Arc::new(MemoryEventSink::new()),
            api: Arc::new(api),
            shared_secret: "secret".to_owned(),
            max_attempts: 3,
        };
        add_routes(Router::new(), state)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, RunStatusResponse) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::GET)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_reports_the_current_state() {
        let api = MockPipelineApi::new()
            .with_status_script(vec![InvocationStatus::Running]);

        let (code, body) = get(app(api), "/runs/run-1").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, Some(InvocationStatus::Running));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let api = MockPipelineApi::new().with_status_script(vec![
            InvocationStatus::Running,
            InvocationStatus::Succeeded,
        ]);

        let (code, body) = get(app(api), "/runs/run-1?wait_s=5&interval_ms=10").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, Some(InvocationStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_wait_times_out_on_a_running_run() {
        // The script never turns terminal, so the poller hits its deadline.
        let api = MockPipelineApi::new();

        let (code, body) = get(app(api), "/runs/run-1?wait_s=0&interval_ms=10").await;

        assert_eq!(code, StatusCode::REQUEST_TIMEOUT);
        assert!(body.error.is_some());
    }
}
