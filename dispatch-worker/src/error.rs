use dispatch_common::deadletter::DeadLetterError;
use dispatch_common::queue::QueueError;
use thiserror::Error;

/// Enumeration of errors related to consuming and finalizing queue jobs.
/// Dispatch-level failures (validation, transient upstream errors) are not
/// here: those are outcomes the worker maps onto the queue, not errors that
/// stop it.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while consuming jobs")]
    QueueError(#[from] QueueError),
    #[error("a dead-letter store error occurred")]
    DeadLetterError(#[from] DeadLetterError),
}
