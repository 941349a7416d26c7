//! Consume dispatch queue jobs and route their events to pipelines.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;
use health::HealthRegistry;

use dispatch_common::dedup::PgDedupStore;
use dispatch_common::deadletter::PgDeadLetterStore;
use dispatch_common::dispatch::Dispatcher;
use dispatch_common::invocation::PgInvocationStore;
use dispatch_common::metrics::{metrics_router, serve};
use dispatch_common::pipeline::{HttpPipelineApi, PipelineInvoker};
use dispatch_common::queue::PgQueue;
use dispatch_common::retry::RetryPolicy;
use dispatch_common::routing::RouterHandle;

use dispatch_worker::config::Config;
use dispatch_worker::error::WorkerError;
use dispatch_worker::worker::DispatchWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    // A dispatcher refuses to start without a valid routing document.
    let router = RouterHandle::load_from_path(config.routing_config_path.as_str())
        .expect("failed to load routing configuration");

    if config.routing_reload_interval_secs > 0 {
        let router = router.clone();
        let path = config.routing_config_path.clone();
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.routing_reload_interval_secs));
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if let Err(error) = router.reload_from_path(path.as_str()) {
                    // Keep serving the previous snapshot.
                    tracing::error!("routing reload failed, keeping current config: {}", error);
                }
            }
        });
    }

    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "dispatch-worker",
        Duration::from_secs(config.visibility_timeout_secs),
    )
    .expect("failed to initialize queue");

    let pool = queue.pool().clone();
    let dedup = Arc::new(PgDedupStore::new(pool.clone()));
    let invocations = Arc::new(PgInvocationStore::new(pool.clone()));
    let dead_letters = Arc::new(PgDeadLetterStore::new(pool));

    let api = Arc::new(HttpPipelineApi::new(
        config.pipeline_api_url.as_str(),
        config.pipeline_request_timeout.0,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        router,
        dedup,
        PipelineInvoker::new(api, invocations),
    ));

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

    let worker = DispatchWorker::new(
        &config.worker_name,
        &queue,
        dispatcher,
        dead_letters,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = metrics_router()
            .route("/", get(index))
            .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await?;

    Ok(())
}

async fn index() -> &'static str {
    "dispatch worker"
}
