use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::operation::{OperationId, Priority};

/// Derived view of the queue, recomputed on demand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_operations: u64,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub avg_processing_time_ms: f64,
    pub queue_length: usize,
    pub is_processing: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) total: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) avg_processing_ms: f64,
}

impl Counters {
    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.completed = self.completed.saturating_add(1);
        let sample = elapsed.as_secs_f64() * 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let n = self.completed as f64;
        self.avg_processing_ms += (sample - self.avg_processing_ms) / n;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed = self.failed.saturating_add(1);
    }
}

/// Lifecycle notifications for observers (UI banners, logs, shells).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        id: OperationId,
        priority: Priority,
    },
    Started {
        id: OperationId,
        attempt: u32,
    },
    Retrying {
        id: OperationId,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    Succeeded {
        id: OperationId,
        elapsed_ms: u64,
    },
    DeadLettered {
        id: OperationId,
        attempts_made: u32,
        error: String,
    },
    Cancelled {
        id: OperationId,
    },
    Paused,
    Resumed,
}

impl QueueEvent {
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Started { .. } => "started",
            Self::Retrying { .. } => "retrying",
            Self::Succeeded { .. } => "succeeded",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Cancelled { .. } => "cancelled",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut counters = Counters::default();
        counters.record_success(Duration::from_millis(100));
        counters.record_success(Duration::from_millis(300));
        counters.record_success(Duration::from_millis(200));
        assert_eq!(counters.completed, 3);
        assert!((counters.avg_processing_ms - 200.0).abs() < 1e-6);
    }
}
