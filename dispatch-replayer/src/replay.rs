use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use dispatch_common::deadletter::{DeadLetterEntry, DeadLetterStore};
use dispatch_common::dispatch::Dispatcher;
use dispatch_common::event::InboundEvent;
use dispatch_common::queue::PgQueue;

/// One pass of dead-letter recovery work, driven on an interval by main.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay_batch(&self);
}

/// Housekeeping sweep of aged completed queue rows.
pub struct QueuePurge {
    pub queue: PgQueue,
    pub older_than: Duration,
}

/// Re-feeds dead-lettered events through the dispatcher.
///
/// Replay goes through the same state machine as live traffic, so it never
/// bypasses dedup: an event that already made it through another path is
/// recognized, counted as resolved and its entry deleted. Entries that keep
/// failing stay put with bumped attempt metadata until they hit the replay
/// cap, after which only an operator can revive them.
pub struct DeadLetterReplayer {
    store: Arc<dyn DeadLetterStore>,
    dispatcher: Arc<Dispatcher>,
    batch_size: i64,
    max_replay_attempts: i32,
    purge: Option<QueuePurge>,
}

impl DeadLetterReplayer {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        dispatcher: Arc<Dispatcher>,
        batch_size: i64,
        max_replay_attempts: i32,
        purge: Option<QueuePurge>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            batch_size,
            max_replay_attempts,
            purge,
        }
    }

    async fn replay_entry(&self, entry: &DeadLetterEntry) {
        if entry.attempt_count >= self.max_replay_attempts {
            debug!(
                message_id = %entry.message_id,
                attempts = entry.attempt_count,
                "entry reached the replay cap, leaving it for operators"
            );
            metrics::counter!("dead_letters_capped_total").increment(1);
            return;
        }

        let event = match InboundEvent::from_stored(&entry.event.0) {
            Ok(event) => event,
            Err(validation) => {
                // Was dead-lettered as undecodable and still is.
                warn!(message_id = %entry.message_id, "entry cannot be replayed: {}", validation);
                if let Err(error) = self.store.record_attempt(entry.id).await {
                    error!("failed to record replay attempt: {}", error);
                }
                return;
            }
        };

        match self.dispatcher.dispatch(&event).await {
            Ok(_) => {
                // Dispatched now, or already processed through another path.
                // Either way the entry is resolved.
                info!(message_id = %event.id, "replayed dead-lettered event");
                metrics::counter!("dead_letters_replayed_total").increment(1);
                if let Err(error) = self.store.delete(entry.id).await {
                    error!("failed to delete replayed entry: {}", error);
                }
            }
            Err(failure) => {
                warn!(message_id = %event.id, "replay failed: {}", failure);
                metrics::counter!("dead_letters_replay_failed_total").increment(1);
                if let Err(error) = self.store.record_attempt(entry.id).await {
                    error!("failed to record replay attempt: {}", error);
                }
            }
        }
    }
}

#[async_trait]
impl Replayer for DeadLetterReplayer {
    async fn replay_batch(&self) {
        let entries = match self.store.list(self.batch_size).await {
            Ok(entries) => entries,
            Err(error) => {
                error!("failed to list dead letters: {}", error);
                return;
            }
        };

        for entry in &entries {
            self.replay_entry(entry).await;
        }

        if let Some(purge) = &self.purge {
            match purge.queue.purge_completed(purge.older_than).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged aged completed jobs"),
                Err(error) => error!("failed to purge completed jobs: {}", error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dispatch_common::deadletter::{MemoryDeadLetterStore, NewDeadLetter};
    use dispatch_common::dedup::{DedupStore, MemoryDedupStore};
    use dispatch_common::event::decode_envelope;
    use dispatch_common::invocation::MemoryInvocationStore;
    use dispatch_common::pipeline::{MockPipelineApi, PipelineInvoker};
    use dispatch_common::routing::{RouterHandle, RoutingConfig};
    use serde_json::json;

    struct Fixture {
        replayer: DeadLetterReplayer,
        store: Arc<MemoryDeadLetterStore>,
        dedup: Arc<MemoryDedupStore>,
        api: Arc<MockPipelineApi>,
    }

    fn fixture(api: MockPipelineApi) -> Fixture {
        let api = Arc::new(api);
        let store = Arc::new(MemoryDeadLetterStore::new());
        let dedup = Arc::new(MemoryDedupStore::new());
        let router = RouterHandle::new(
            RoutingConfig::from_json(r#"{"defaultPipeline": "pl_default", "routes": {}}"#)
                .expect("failed to parse routing document"),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            router,
            dedup.clone(),
            PipelineInvoker::new(api.clone(), Arc::new(MemoryInvocationStore::new())),
        ));

        Fixture {
            replayer: DeadLetterReplayer::new(store.clone(), dispatcher, 100, 5, None),
            store,
            dedup,
            api,
        }
    }

    async fn dead_letter(store: &MemoryDeadLetterStore, message_id: &str, attempts: i32) {
        let event = decode_envelope(&json!({"messageId": message_id})).unwrap()[0].clone();
        store
            .record(NewDeadLetter {
                message_id: message_id.to_owned(),
                event: serde_json::to_value(&event).unwrap(),
                failure_reason: "upstream down".to_owned(),
                attempt_count: attempts,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replay_of_a_resolved_entry_invokes_and_deletes() {
        let fixture = fixture(MockPipelineApi::new());
        dead_letter(&fixture.store, "m1", 3).await;

        fixture.replayer.replay_batch().await;

        assert_eq!(fixture.api.runs_created().len(), 1);
        assert!(fixture.store.is_empty());
        assert!(fixture.dedup.has_processed("m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_does_not_bypass_dedup() {
        let fixture = fixture(MockPipelineApi::new());
        dead_letter(&fixture.store, "m1", 3).await;
        // The message made it through another path in the meantime.
        fixture.dedup.mark_processed("m1", "m1").await.unwrap();

        fixture.replayer.replay_batch().await;

        assert_eq!(fixture.api.runs_created().len(), 0);
        assert!(fixture.store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_the_entry_and_bumps_attempts() {
        let fixture = fixture(MockPipelineApi::failing_upstream(u32::MAX));
        dead_letter(&fixture.store, "m1", 3).await;

        fixture.replayer.replay_batch().await;

        let entries = fixture.store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 4);
    }

    #[tokio::test]
    async fn test_capped_entries_are_skipped() {
        let fixture = fixture(MockPipelineApi::new());
        dead_letter(&fixture.store, "m1", 5).await;

        fixture.replayer.replay_batch().await;

        // Untouched: no dispatch, no metadata bump, still present.
        assert_eq!(fixture.api.runs_created().len(), 0);
        let entries = fixture.store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 5);
    }

    #[tokio::test]
    async fn test_undecodable_entries_only_bump_attempts() {
        let fixture = fixture(MockPipelineApi::new());
        fixture
            .store
            .record(NewDeadLetter {
                message_id: "malformed-1".to_owned(),
                event: json!("not an event"),
                failure_reason: "envelope is neither an object nor an event array".to_owned(),
                attempt_count: 0,
            })
            .await
            .unwrap();

        fixture.replayer.replay_batch().await;

        assert_eq!(fixture.api.runs_created().len(), 0);
        let entries = fixture.store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 1);
    }
}
