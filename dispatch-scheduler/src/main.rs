//! Timer-fired dispatcher for scheduled pipeline runs.
use std::sync::Arc;
use std::time::Duration;

use axum::{routing, Router};
use chrono::Utc;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use scheduler::Scheduler;
use sqlx::postgres::PgPoolOptions;

use dispatch_common::invocation::PgInvocationStore;
use dispatch_common::lease::PgLeaseStore;
use dispatch_common::metrics::{setup_metrics_recorder, track_requests};
use dispatch_common::notify::StatusNotifier;
use dispatch_common::pipeline::{HttpPipelineApi, PipelineInvoker};

mod config;
mod scheduler;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn schedule_loop(scheduler: Scheduler, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        scheduler.run_once(Utc::now().date_naive()).await;
    }
}

async fn index() -> &'static str {
    "dispatch scheduler"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .expect("failed to create connection pool");

    let api = Arc::new(HttpPipelineApi::new(
        &config.pipeline_api_url,
        Duration::from_millis(config.pipeline_request_timeout_ms),
    ));
    let invoker = PipelineInvoker::new(api, Arc::new(PgInvocationStore::new(pool.clone())));

    let notifier = config.status_webhook_url.as_ref().map(|url| {
        StatusNotifier::new(
            url.clone(),
            Duration::from_millis(config.status_webhook_timeout_ms),
        )
    });

    let scheduler = Scheduler::new(
        &config.schedule_pipeline,
        Arc::new(PgLeaseStore::new(pool)),
        invoker,
        notifier,
        Duration::from_secs(config.jitter_max_secs),
        Duration::from_secs(config.lease_ttl_secs),
        Duration::from_millis(config.run_poll_interval_ms),
        Duration::from_secs(config.run_poll_timeout_secs),
    );

    let schedule_loop = Box::pin(schedule_loop(scheduler, config.schedule_interval_secs));

    let recorder_handle = setup_metrics_recorder();
    let app = Router::new()
        .route("/", routing::get(index))
        .route(
            "/metrics",
            routing::get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, schedule_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start dispatch-scheduler http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("dispatch-scheduler timer loop exited")
        }
    };
}
