use std::sync::Arc;
use std::time;

use health::HealthHandle;
use serde_json::Value;
use tokio::sync;
use tracing::error;

use dispatch_common::deadletter::{DeadLetterStore, NewDeadLetter};
use dispatch_common::dispatch::{DispatchError, Dispatcher};
use dispatch_common::event::{decode_envelope, InboundEvent};
use dispatch_common::queue::{DequeuedJob, PgQueue, RetryError, RetryInvalidError};
use dispatch_common::retry::RetryPolicy;

use crate::error::WorkerError;

/// A worker polling the dispatch queue and spawning a task per job.
pub struct DispatchWorker<'p> {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: &'p PgQueue,
    /// The shared dispatch state machine.
    dispatcher: Arc<Dispatcher>,
    /// Where exhausted and invalid events end up.
    dead_letters: Arc<dyn DeadLetterStore>,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// The backoff schedule for transient failures.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
}

impl<'p> DispatchWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        dispatcher: Arc<Dispatcher>,
        dead_letters: Arc<dyn DeadLetterStore>,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            dispatcher,
            dead_letters,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job(&self) -> Result<DequeuedJob<Value>, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("dispatch_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        loop {
            report_semaphore_utilization();
            let job = self.wait_for_job().await?;
            spawn_dispatch_task(
                self.dispatcher.clone(),
                self.dead_letters.clone(),
                semaphore.clone(),
                self.retry_policy,
                job,
            )
            .await;
        }
    }
}

/// Spawn a Tokio task to process a job once we successfully acquire a permit.
async fn spawn_dispatch_task(
    dispatcher: Arc<Dispatcher>,
    dead_letters: Arc<dyn DeadLetterStore>,
    semaphore: Arc<sync::Semaphore>,
    retry_policy: RetryPolicy,
    job: DequeuedJob<Value>,
) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let labels = [("queue", job.job.queue.clone())];
    metrics::counter!("dispatch_jobs_total", &labels).increment(1);

    tokio::spawn(async move {
        let result = process_job(dispatcher, dead_letters, &retry_policy, job).await;
        drop(permit);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                error!("failed to process dispatch job: {}", error);
                Err(error)
            }
        }
    })
}

/// Process a queue job by dispatching the events it carries and transitioning
/// it to its final queue state.
///
/// Outcomes map onto the transport as follows:
/// - every event dispatched (or recognized as a duplicate): the job completes;
/// - an undecodable payload or an event the pipeline service rejects outright:
///   dead-lettered immediately, and the job still completes (never retried);
/// - a transient failure: the job is retried with backoff while attempts
///   remain, otherwise the unfinished events are dead-lettered and the job is
///   failed so it never blocks the queue.
async fn process_job(
    dispatcher: Arc<Dispatcher>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry_policy: &RetryPolicy,
    job: DequeuedJob<Value>,
) -> Result<(), WorkerError> {
    let labels = [("queue", job.job.queue.clone())];
    let attempt = job.job.attempt;
    let payload = job.job.payload.0.clone();

    let now = tokio::time::Instant::now();

    let events = match decode_envelope(&payload) {
        Ok(events) => events,
        Err(validation) => {
            // Malformed payloads are terminal: no amount of retrying fixes
            // them, so they skip straight past the retry loop.
            dead_letters
                .record(NewDeadLetter {
                    message_id: format!("malformed-{}", job.job.id),
                    event: payload,
                    failure_reason: validation.to_string(),
                    attempt_count: attempt,
                })
                .await?;
            job.complete().await?;

            metrics::counter!("dispatch_events_dead_lettered", &labels).increment(1);
            return Ok(());
        }
    };

    for (index, event) in events.iter().enumerate() {
        match dispatcher.dispatch(event).await {
            Ok(_) => {}
            Err(DispatchError::Validation(reason)) => {
                dead_letters.record(dead_letter_for(event, &reason, attempt)).await?;
                metrics::counter!("dispatch_events_dead_lettered", &labels).increment(1);
            }
            Err(DispatchError::Transient(reason)) => {
                // Hand the whole message back to the transport. Events
                // already dispatched are protected by the dedup ledger when
                // the message comes around again.
                let retry_interval = retry_policy.retry_interval(attempt as u32);

                return match job.retry(&reason, retry_interval).await {
                    Ok(()) => {
                        metrics::counter!("dispatch_jobs_retried", &labels).increment(1);
                        Ok(())
                    }
                    Err(RetryError::RetryInvalidError(RetryInvalidError {
                        job: exhausted, ..
                    })) => {
                        // Attempts are exhausted: everything not yet
                        // dispatched goes to the dead-letter store and the
                        // job leaves the active queue.
                        for unfinished in &events[index..] {
                            dead_letters
                                .record(dead_letter_for(unfinished, &reason, attempt))
                                .await?;
                            metrics::counter!("dispatch_events_dead_lettered", &labels)
                                .increment(1);
                        }
                        exhausted.fail(&reason).await?;
                        metrics::counter!("dispatch_jobs_failed", &labels).increment(1);
                        Ok(())
                    }
                    Err(RetryError::QueueError(error)) => Err(WorkerError::from(error)),
                };
            }
        }
    }

    job.complete().await?;

    metrics::counter!("dispatch_jobs_completed", &labels).increment(1);
    metrics::histogram!("dispatch_jobs_processing_duration_seconds", &labels)
        .record(now.elapsed().as_secs_f64());

    Ok(())
}

fn dead_letter_for(event: &InboundEvent, reason: &str, attempt: i32) -> NewDeadLetter {
    NewDeadLetter {
        message_id: event.id.clone(),
        event: serde_json::to_value(event).unwrap_or(Value::Null),
        failure_reason: reason.to_owned(),
        attempt_count: attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dispatch_common::dedup::MemoryDedupStore;
    use dispatch_common::invocation::MemoryInvocationStore;
    use dispatch_common::pipeline::{MockPipelineApi, PipelineInvoker};
    use dispatch_common::routing::{RouterHandle, RoutingConfig};
    use serde_json::json;

    fn dispatcher(api: Arc<MockPipelineApi>) -> Arc<Dispatcher> {
        let router = RouterHandle::new(
            RoutingConfig::from_json(r#"{"defaultPipeline": "pl_default", "routes": {}}"#)
                .expect("failed to parse routing document"),
        );
        Arc::new(Dispatcher::new(
            router,
            Arc::new(MemoryDedupStore::new()),
            PipelineInvoker::new(api, Arc::new(MemoryInvocationStore::new())),
        ))
    }

    #[test]
    fn test_dead_letter_entry_preserves_the_event() {
        let event = decode_envelope(&json!({"messageId": "m1", "parameters": {"a": 1}}))
            .expect("failed to decode")[0]
            .clone();

        let entry = dead_letter_for(&event, "upstream down", 3);

        assert_eq!(entry.message_id, "m1");
        assert_eq!(entry.attempt_count, 3);
        let restored = InboundEvent::from_stored(&entry.event).expect("failed to restore");
        assert_eq!(restored, event);
    }

    #[tokio::test]
    async fn test_redelivery_skips_already_dispatched_events() {
        // A multi-event message that failed part-way comes back around; the
        // events dispatched on the first delivery must not fire again.
        let api = Arc::new(MockPipelineApi::new());
        let dispatcher = dispatcher(api.clone());
        let events = decode_envelope(&json!([
            {"id": "evt-1", "eventType": "blob.created"},
            {"id": "evt-2", "eventType": "blob.created"}
        ]))
        .expect("failed to decode");

        // First delivery gets through evt-1 before the job is retried.
        dispatcher.dispatch(&events[0]).await.unwrap();
        // Redelivery processes the whole payload again.
        for event in &events {
            dispatcher.dispatch(event).await.unwrap();
        }

        let created = api.runs_created();
        assert_eq!(created.len(), 2);
    }
}
