//! Priority operation queue with bounded concurrency, per-entity lanes,
//! exponential backoff and a dead-letter store.

mod backoff;
mod dead_letter;
mod metrics;
mod operation;
mod scheduler;

pub use backoff::{calculate_exponential_backoff, calculate_exponential_backoff_capped, BackoffPolicy};
pub use dead_letter::{DeadLetterEntry, DeadLetterReason};
pub use metrics::{QueueEvent, QueueMetrics};
pub use operation::{
    OperationError, OperationId, OperationOptions, OperationSnapshot, OperationStatus, Priority,
    QueueError,
};
pub use scheduler::{OperationHandle, OperationQueue, QueueConfig};
