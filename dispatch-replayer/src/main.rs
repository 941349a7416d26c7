//! Replay dead-lettered events back through the dispatcher.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use replay::{DeadLetterReplayer, QueuePurge, Replayer};
use tokio::sync::Semaphore;

use dispatch_common::deadletter::PgDeadLetterStore;
use dispatch_common::dedup::PgDedupStore;
use dispatch_common::dispatch::Dispatcher;
use dispatch_common::invocation::PgInvocationStore;
use dispatch_common::metrics;
use dispatch_common::pipeline::{HttpPipelineApi, PipelineInvoker};
use dispatch_common::queue::PgQueue;
use dispatch_common::routing::RouterHandle;

mod config;
mod handlers;
mod replay;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn replay_loop(replayer: Box<dyn Replayer>, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        replayer.replay_batch().await;
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let router = RouterHandle::load_from_path(&config.routing_config_path)
        .expect("failed to load routing configuration");

    let queue = PgQueue::new(
        &config.queue_name,
        &config.database_url,
        config.max_pg_connections,
        "dispatch-replayer",
        Duration::from_secs(300),
    )
    .expect("failed to initialize queue");
    let pool = queue.pool().clone();

    let api = Arc::new(HttpPipelineApi::new(
        &config.pipeline_api_url,
        Duration::from_millis(config.pipeline_request_timeout_ms),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        router,
        Arc::new(PgDedupStore::new(pool.clone())),
        PipelineInvoker::new(api, Arc::new(PgInvocationStore::new(pool.clone()))),
    ));

    let purge = match config.purge_completed_after_days {
        0 => None,
        days => Some(QueuePurge {
            queue,
            older_than: Duration::from_secs(days * 24 * 60 * 60),
        }),
    };

    let replayer = Box::new(DeadLetterReplayer::new(
        Arc::new(PgDeadLetterStore::new(pool)),
        dispatcher,
        config.batch_size,
        config.max_replay_attempts,
        purge,
    ));

    let replay_loop = Box::pin(replay_loop(replayer, config.replay_interval_secs));

    let recorder_handle = metrics::setup_metrics_recorder();
    let app = handlers::app(Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, replay_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start dispatch-replayer http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("dispatch-replayer replay loop exited")
        }
    };
}
