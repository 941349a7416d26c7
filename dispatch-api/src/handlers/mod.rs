use std::sync::Arc;

use axum::{routing, Router};
use tower_http::trace::TraceLayer;

use dispatch_common::pipeline::PipelineApi;
use dispatch_common::queue::EventSink;

pub mod runs;
pub mod trigger;

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn EventSink>,
    pub api: Arc<dyn PipelineApi>,
    pub shared_secret: String,
    pub max_attempts: i32,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/invoke",
            routing::post(trigger::invoke).with_state(state.clone()),
        )
        .route(
            "/events",
            routing::post(trigger::events).with_state(state.clone()),
        )
        .route(
            "/runs/:run_id",
            routing::get(runs::status).with_state(state),
        )
        .layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "dispatch api"
}
