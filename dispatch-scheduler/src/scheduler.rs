use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use serde_json::json;
use tracing::{debug, error, info, warn};

use dispatch_common::lease::{LeaseError, LeaseStore, LeaseToken};
use dispatch_common::notify::StatusNotifier;
use dispatch_common::pipeline::{poll_run, PipelineInvoker, PollError};

/// Fires a pipeline once per scheduled run, no matter how many scheduler
/// instances are deployed.
///
/// Exclusion is two-layered: the lease makes concurrent firings a no-op for
/// all but one instance, and the lease resource id doubles as the run's
/// correlation id so a later re-fire (lease long expired) still collapses
/// onto the original invocation.
pub struct Scheduler {
    pipeline_name: String,
    leases: Arc<dyn LeaseStore>,
    invoker: PipelineInvoker,
    notifier: Option<StatusNotifier>,
    jitter_max: Duration,
    lease_ttl: Duration,
    run_poll_interval: Duration,
    run_poll_timeout: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_name: &str,
        leases: Arc<dyn LeaseStore>,
        invoker: PipelineInvoker,
        notifier: Option<StatusNotifier>,
        jitter_max: Duration,
        lease_ttl: Duration,
        run_poll_interval: Duration,
        run_poll_timeout: Duration,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.to_owned(),
            leases,
            invoker,
            notifier,
            jitter_max,
            lease_ttl,
            run_poll_interval,
            run_poll_timeout,
        }
    }

    /// Handle one timer firing for the given run date.
    pub async fn run_once(&self, run_date: NaiveDate) {
        let jitter = self.jitter();
        if !jitter.is_zero() {
            debug!(?jitter, "delaying scheduled run");
            tokio::time::sleep(jitter).await;
        }

        let resource_id = format!("scheduled:{}:{}", self.pipeline_name, run_date);

        let token = match self.leases.acquire(&resource_id, self.lease_ttl).await {
            Ok(token) => token,
            Err(LeaseError::Held(_)) => {
                // Another instance owns this run. Expected under redundancy.
                debug!(%resource_id, "scheduled run is owned by another instance");
                metrics::counter!("scheduled_runs_skipped_total").increment(1);
                return;
            }
            Err(error) => {
                error!(%resource_id, "failed to acquire schedule lease: {}", error);
                return;
            }
        };

        let parameters = json!({ "runDate": run_date.to_string() });
        match self
            .invoker
            .invoke(&self.pipeline_name, &parameters, &resource_id)
            .await
        {
            Ok(invocation) => {
                info!(
                    pipeline = %self.pipeline_name,
                    run_id = invocation.run_id.as_deref(),
                    %run_date,
                    "fired scheduled run"
                );
                metrics::counter!("scheduled_runs_fired_total").increment(1);

                if let Some(run_id) = invocation.run_id.clone() {
                    self.watch_run(&token, &invocation.correlation_id, &run_id)
                        .await;
                }
            }
            // The next firing retries under the same correlation id.
            Err(error) => error!(
                pipeline = %self.pipeline_name,
                "scheduled invocation failed: {}", error
            ),
        }

        if let Err(error) = self.leases.release(token).await {
            warn!(%resource_id, "failed to release schedule lease: {}", error);
        }
    }

    /// Follow the run until it completes or the watch window closes, then
    /// record and notify the terminal status.
    async fn watch_run(&self, token: &LeaseToken, correlation_id: &str, run_id: &str) {
        // Stretch the lease over the watch window so a crashed watcher is
        // still the only sanctioned owner until the window closes.
        if let Err(error) = self
            .leases
            .renew(token, self.run_poll_timeout + self.lease_ttl)
            .await
        {
            debug!(correlation_id, "could not extend lease over the watch: {}", error);
        }

        match poll_run(
            self.invoker.api().as_ref(),
            run_id,
            self.run_poll_interval,
            self.run_poll_timeout,
        )
        .await
        {
            Ok(status) => {
                if let Err(error) = self
                    .invoker
                    .store()
                    .record_terminal(correlation_id, status)
                    .await
                {
                    warn!(correlation_id, "failed to record terminal status: {}", error);
                }
                if let Some(notifier) = &self.notifier {
                    notifier.notify(correlation_id, run_id, status).await;
                }
            }
            Err(PollError::Timeout { .. }) => {
                // Surfaced for operators; the run itself is left alone.
                warn!(
                    correlation_id,
                    run_id, "run did not complete within the watch window"
                );
            }
            Err(error) => warn!(correlation_id, "failed to watch run: {}", error),
        }
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..=self.jitter_max)
    }
}
