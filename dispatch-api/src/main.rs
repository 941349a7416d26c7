use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use dispatch_common::metrics::setup_metrics_routes;
use dispatch_common::pipeline::HttpPipelineApi;
use dispatch_common::queue::PgQueue;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let queue = PgQueue::new(
        &config.queue_name,
        &config.database_url,
        config.max_pg_connections,
        "dispatch-api",
        // Enqueue-only: the visibility timeout only matters to consumers.
        Duration::from_secs(300),
    )
    .expect("failed to initialize queue");

    let api = Arc::new(HttpPipelineApi::new(
        &config.pipeline_api_url,
        Duration::from_millis(config.pipeline_request_timeout_ms),
    ));

    let state = handlers::AppState {
        sink: Arc::new(queue),
        api,
        shared_secret: config.shared_secret.clone(),
        max_attempts: config.max_attempts,
    };

    let app = handlers::add_routes(Router::new(), state);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start dispatch-api http server, {}", e),
    }
}
