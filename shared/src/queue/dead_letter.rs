use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

use super::operation::OperationSnapshot;
use crate::UnixTimeMs;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    NonRetryable,
    Panicked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub operation: OperationSnapshot,
    pub final_error: String,
    pub attempts_made: u32,
    pub reason: DeadLetterReason,
    pub timestamp: UnixTimeMs,
}

/// Bounded store of exhausted operations, oldest evicted first.
#[derive(Debug)]
pub(crate) struct DeadLetterStore {
    entries: VecDeque<DeadLetterEntry>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetterStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: DeadLetterEntry) {
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                self.evicted = self.evicted.saturating_add(1);
                warn!(
                    operation_id = %oldest.operation.id,
                    total_evicted = self.evicted,
                    "Dead-letter queue full, evicting oldest entry"
                );
            }
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::operation::{OperationId, OperationOptions};

    fn entry(n: u32) -> DeadLetterEntry {
        DeadLetterEntry {
            operation: OperationSnapshot::new(
                OperationId::generate(),
                OperationOptions::new(),
                UnixTimeMs(u64::from(n)),
            ),
            final_error: format!("failure {n}"),
            attempts_made: n,
            reason: DeadLetterReason::RetriesExhausted,
            timestamp: UnixTimeMs(u64::from(n)),
        }
    }

    #[test]
    fn test_oldest_entry_evicted_at_capacity() {
        let mut store = DeadLetterStore::new(2);
        store.push(entry(1));
        store.push(entry(2));
        store.push(entry(3));

        let entries = store.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempts_made, 2);
        assert_eq!(entries[1].attempts_made, 3);
        assert_eq!(store.evicted, 1);
    }

    #[test]
    fn test_clear_reports_count() {
        let mut store = DeadLetterStore::new(10);
        store.push(entry(1));
        store.push(entry(2));
        assert_eq!(store.clear(), 2);
        assert!(store.snapshot().is_empty());
    }
}
