use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use dispatch_common::event::decode_envelope;
use dispatch_common::queue::EventSink;

use crate::handlers::AppState;

const SHARED_SECRET_HEADER: &str = "x-shared-secret";

#[derive(Serialize, Deserialize)]
pub struct InvokeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "correlationId")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The body of an on-demand trigger request.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequestBody {
    pipeline_name: String,
    correlation_id: String,
    #[serde(default)]
    parameters: Option<Value>,
}

fn unauthorized() -> (StatusCode, Json<InvokeResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(InvokeResponse {
            correlation_id: None,
            error: Some("shared secret mismatch".to_owned()),
        }),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<InvokeResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(InvokeResponse {
            correlation_id: None,
            error: Some(message.to_owned()),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<InvokeResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(InvokeResponse {
            correlation_id: None,
            error: Some(err.to_string()),
        }),
    )
}

/// Trigger a named pipeline on demand.
/// Authenticated by the x-shared-secret header; answers 202 as soon as the
/// event is durably enqueued, with the correlation id to poll on.
pub async fn invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InvokeRequestBody>,
) -> Result<(StatusCode, Json<InvokeResponse>), (StatusCode, Json<InvokeResponse>)> {
    let presented = headers
        .get(SHARED_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented != Some(state.shared_secret.as_str()) {
        return Err(unauthorized());
    }

    debug!("received trigger request: {:?}", payload);

    if payload.pipeline_name.is_empty() {
        return Err(bad_request("pipelineName must not be empty"));
    }
    if payload.correlation_id.is_empty() {
        return Err(bad_request("correlationId must not be empty"));
    }

    let envelope = json!({
        "messageId": payload.correlation_id,
        "pipelineName": payload.pipeline_name,
        "parameters": payload.parameters.unwrap_or_else(|| json!({})),
    });

    state
        .sink
        .submit(envelope, state.max_attempts)
        .await
        .map_err(internal_error)?;

    metrics::counter!("dispatch_trigger_accepted_total").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(InvokeResponse {
            correlation_id: Some(payload.correlation_id),
            error: None,
        }),
    ))
}

#[derive(Serialize, Deserialize)]
pub struct EventsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    accepted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Accept a raw inbound envelope (direct or Event-Grid array) and enqueue it.
/// The envelope is decode-checked up front so malformed submissions bounce
/// with a 400 instead of dead-lettering later.
pub async fn events(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<EventsResponse>), (StatusCode, Json<EventsResponse>)> {
    let events = decode_envelope(&payload).map_err(|validation| {
        (
            StatusCode::BAD_REQUEST,
            Json(EventsResponse {
                accepted: None,
                error: Some(validation.to_string()),
            }),
        )
    })?;

    state
        .sink
        .submit(payload, state.max_attempts)
        .await
        .map_err(|err| {
            error!("internal error: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(EventsResponse {
                    accepted: None,
                    error: Some(err.to_string()),
                }),
            )
        })?;

    metrics::counter!("dispatch_events_accepted_total").increment(events.len() as u64);

    Ok((
        StatusCode::ACCEPTED,
        Json(EventsResponse {
            accepted: Some(events.len()),
            error: None,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use dispatch_common::pipeline::MockPipelineApi;
    use dispatch_common::queue::MemoryEventSink;

    use crate::handlers::{add_routes, AppState};

    const SECRET: &str = "a-very-secret-value";

    fn app() -> (Router, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let state = AppState {
            sink: sink.clone(),
            api: Arc::new(MockPipelineApi::new()),
            shared_secret: SECRET.to_owned(),
            max_attempts: 3,
        };
        (add_routes(Router::new(), state), sink)
    }

    fn invoke_request(secret: Option<&str>, body: &Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(http::Method::POST)
            .uri("/invoke")
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = secret {
            builder = builder.header(SHARED_SECRET_HEADER, secret);
        }
        builder
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_accepts_and_enqueues() {
        let (app, sink) = app();
        let body = json!({"pipelineName": "pl_a", "correlationId": "c1", "parameters": {"a": 1}});

        let response = app
            .oneshot(invoke_request(Some(SECRET), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: InvokeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.correlation_id.as_deref(), Some("c1"));

        let submitted = sink.submitted().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0]["messageId"], "c1");
        assert_eq!(submitted[0]["pipelineName"], "pl_a");
    }

    #[tokio::test]
    async fn test_invoke_rejects_missing_secret() {
        let (app, sink) = app();
        let body = json!({"pipelineName": "pl_a", "correlationId": "c1"});

        let response = app.oneshot(invoke_request(None, &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(sink.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_rejects_wrong_secret() {
        let (app, sink) = app();
        let body = json!({"pipelineName": "pl_a", "correlationId": "c1"});

        let response = app
            .oneshot(invoke_request(Some("not-the-secret"), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(sink.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_rejects_empty_pipeline_name() {
        let (app, _) = app();
        let body = json!({"pipelineName": "", "correlationId": "c1"});

        let response = app
            .oneshot(invoke_request(Some(SECRET), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_accepts_grid_arrays() {
        let (app, sink) = app();
        let body = json!([
            {"id": "evt-1", "eventType": "blob.created", "data": {"url": "blob:raw/a.json"}},
            {"id": "evt-2", "eventType": "blob.created", "data": {"url": "blob:raw/b.json"}}
        ]);

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/events")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_string(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(sink.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_rejects_malformed_envelopes() {
        let (app, sink) = app();

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/events")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"pipelineName": "pl_a"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(sink.submitted().await.is_empty());
    }
}
