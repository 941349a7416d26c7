//! The per-event dispatch state machine.
//!
//! `Received → Duplicate (terminal skip) | Routed → Invoking → Completed`,
//! with transient failures handed back to the transport for bounded retry
//! and validation failures dead-lettered by the caller. The dispatcher
//! itself owns no transport side effects: ack/retry/dead-letter decisions
//! happen in the worker and replayer around it.
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::dedup::{DedupError, DedupStore};
use crate::event::InboundEvent;
use crate::invocation::PipelineInvocation;
use crate::pipeline::{ApiError, InvokeError, PipelineInvoker};
use crate::routing::RouterHandle;

/// Enumeration of dispatch failures, split by how the transport must react.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The event can never be processed. Dead-letter it, do not retry.
    #[error("event cannot be processed: {0}")]
    Validation(String),
    /// The failure may resolve on its own. Retry with backoff, then
    /// dead-letter.
    #[error("transient dispatch failure: {0}")]
    Transient(String),
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The event is tied to exactly one pipeline invocation.
    Completed(PipelineInvocation),
    /// The message id was already processed; nothing was invoked.
    Duplicate,
}

/// Orchestrates dedup check → routing → idempotent invocation → ledger write
/// for a single event.
pub struct Dispatcher {
    router: RouterHandle,
    dedup: Arc<dyn DedupStore>,
    invoker: PipelineInvoker,
}

impl Dispatcher {
    pub fn new(router: RouterHandle, dedup: Arc<dyn DedupStore>, invoker: PipelineInvoker) -> Self {
        Self {
            router,
            dedup,
            invoker,
        }
    }

    pub async fn dispatch(&self, event: &InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        match self.dedup.has_processed(&event.id).await {
            Ok(true) => {
                // Expected under at-least-once delivery, not an error.
                info!(message_id = %event.id, "skipping already-processed message");
                metrics::counter!("dispatch_duplicates_skipped_total").increment(1);
                return Ok(DispatchOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(error) => return Err(DispatchError::Transient(error.to_string())),
        }

        let config = self.router.snapshot();
        let pipeline_name = config.route(event).to_owned();

        let invocation = self
            .invoker
            .invoke(&pipeline_name, &event.parameters_value(), &event.id)
            .await
            .map_err(|error| match error {
                InvokeError::Api(ApiError::Rejected(reason)) => DispatchError::Validation(reason),
                other => DispatchError::Transient(other.to_string()),
            })?;

        match self.dedup.mark_processed(&event.id, &event.id).await {
            Ok(()) => {}
            Err(DedupError::Conflict) => {
                // Another worker recorded the message between our check and
                // the invoke. The idempotency key already collapsed both
                // attempts onto one run, so the race is benign.
                debug!(message_id = %event.id, "lost the dedup race after invoking");
            }
            Err(error) => return Err(DispatchError::Transient(error.to_string())),
        }

        info!(
            message_id = %event.id,
            pipeline = %pipeline_name,
            run_id = invocation.run_id.as_deref(),
            "dispatched event"
        );

        Ok(DispatchOutcome::Completed(invocation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::MemoryDedupStore;
    use crate::event::decode_envelope;
    use crate::invocation::MemoryInvocationStore;
    use crate::pipeline::MockPipelineApi;
    use crate::routing::{RouterHandle, RoutingConfig};
    use serde_json::json;

    fn router() -> RouterHandle {
        RouterHandle::new(
            RoutingConfig::from_json(
                r#"{
                    "defaultPipeline": "pl_default",
                    "routes": {"blob:raw/": "pl_a", "type:emergency": "pl_b"}
                }"#,
            )
            .expect("failed to parse routing document"),
        )
    }

    fn dispatcher(api: Arc<MockPipelineApi>) -> Dispatcher {
        let store = Arc::new(MemoryInvocationStore::new());
        Dispatcher::new(
            router(),
            Arc::new(MemoryDedupStore::new()),
            PipelineInvoker::new(api, store),
        )
    }

    fn event_from(payload: serde_json::Value) -> InboundEvent {
        decode_envelope(&payload).expect("failed to decode")[0].clone()
    }

    #[tokio::test]
    async fn test_processing_twice_invokes_once() {
        let api = Arc::new(MockPipelineApi::new());
        let dispatcher = dispatcher(api.clone());
        let event = event_from(json!({"messageId": "m1", "pipelineName": "pl_x"}));

        let first = dispatcher.dispatch(&event).await.unwrap();
        let second = dispatcher.dispatch(&event).await.unwrap();

        assert!(matches!(first, DispatchOutcome::Completed(_)));
        assert!(matches!(second, DispatchOutcome::Duplicate));
        assert_eq!(api.runs_created().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_by_source_prefix() {
        let api = Arc::new(MockPipelineApi::new());
        let dispatcher = dispatcher(api.clone());
        let event = event_from(json!([{
            "id": "evt-1",
            "eventType": "blob.created",
            "data": {"url": "blob:raw/foo.json"}
        }]));

        dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(api.runs_created()[0].0, "pl_a");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_transient() {
        let api = Arc::new(MockPipelineApi::failing_upstream(u32::MAX));
        let dispatcher = dispatcher(api.clone());
        let event = event_from(json!({"messageId": "m1"}));

        let error = dispatcher.dispatch(&event).await.unwrap_err();

        assert!(matches!(error, DispatchError::Transient(_)));
        // A failed invoke leaves the message unprocessed for the retry.
        let retry = dispatcher.dispatch(&event).await.unwrap_err();
        assert!(matches!(retry, DispatchError::Transient(_)));
    }

    #[tokio::test]
    async fn test_transient_failure_then_recovery_invokes_once() {
        let api = Arc::new(MockPipelineApi::failing_upstream(1));
        let dispatcher = dispatcher(api.clone());
        let event = event_from(json!({"messageId": "m1"}));

        assert!(dispatcher.dispatch(&event).await.is_err());
        let outcome = dispatcher.dispatch(&event).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(api.runs_created().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_of_same_message_creates_one_run() {
        let api = Arc::new(MockPipelineApi::new());
        let dispatcher = Arc::new(dispatcher(api.clone()));
        let event = event_from(json!({"messageId": "m1"}));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = dispatcher.clone();
            let event = event.clone();
            handles.push(tokio::spawn(
                async move { dispatcher.dispatch(&event).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The invocation store's correlation-id check collapses the racers.
        assert_eq!(api.runs_created().len(), 1);
    }
}
