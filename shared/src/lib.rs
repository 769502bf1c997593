//! Client-side resilience layer for field inspections.
//!
//! Three pieces cooperate:
//!
//! - [`queue::OperationQueue`] runs asynchronous operations in priority order
//!   with bounded concurrency, per-entity lanes, retries with exponential
//!   backoff and a dead-letter store.
//! - [`offline_store::OfflineMediaStore`] durably records captured evidence and
//!   uploads it through the queue.
//! - [`sync::SyncCoordinator`] drains the media store when
//!   [`network::NetworkStatusMonitor`] reports that connectivity is back.
//!
//! The crate never installs a `tracing` subscriber; the host shell does.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod network;
pub mod offline_store;
pub mod queue;
pub mod storage;
pub mod sync;

use serde::{Deserialize, Serialize};

pub use config::{ConfigError, ResilienceConfig};
pub use network::{NetworkStatusMonitor, NetworkSubscription, NetworkTransition};
pub use offline_store::{
    MediaId, MediaPayload, MediaStats, MediaStoreConfig, MediaStoreError, MediaUploader,
    OfflineMediaStore, PendingMedia, SyncReport,
};
pub use queue::{
    calculate_exponential_backoff, calculate_exponential_backoff_capped, DeadLetterEntry,
    OperationError, OperationHandle, OperationOptions, OperationQueue, Priority, QueueConfig,
    QueueError, QueueEvent, QueueMetrics,
};
pub use storage::{KeyValueStore, MemoryKvStore, StorageError, StorageKey};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use storage::SqliteKvStore;
pub use sync::{SyncConfig, SyncCoordinator, SyncEvent, SyncTrigger};

pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 1;
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 100;
pub const SYNC_STABILIZATION_DELAY_MS: u64 = 2000;
pub const UPLOAD_TIMEOUT_MS: u64 = 120_000;
pub const MAX_MEDIA_RETRIES: u32 = 3;
pub const MAX_PENDING_MEDIA: usize = 1000;
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_serializes_as_number() {
        let json = serde_json::to_string(&UnixTimeMs(1_700_000_000_000)).unwrap();
        assert_eq!(json, "1700000000000");
        let back: UnixTimeMs = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_millis(), 1_700_000_000_000);
    }
}
