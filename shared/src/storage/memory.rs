use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::{
    check_value_sizes, KeyValueStore, StorageError, StorageErrorCode, StorageKey, WriteOp,
    MAX_VALUE_BYTES,
};

/// In-process store with an optional byte quota.
///
/// Usage counts key and value bytes. A batch that would push usage past the
/// quota is rejected whole with [`StorageError::QuotaExceeded`].
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Bytes>>,
    /// `u64::MAX` means unlimited
    quota_bytes: AtomicU64,
    max_value_bytes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: AtomicU64::new(u64::MAX),
            max_value_bytes: AtomicUsize::new(MAX_VALUE_BYTES),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        let store = Self::default();
        store.set_quota(Some(quota_bytes));
        store
    }

    pub fn set_quota(&self, quota_bytes: Option<u64>) {
        self.quota_bytes
            .store(quota_bytes.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Lower the per-value limit, e.g. to exercise oversized writes cheaply.
    pub fn set_max_value_bytes(&self, max: usize) {
        self.max_value_bytes.store(max, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with an I/O error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> u64 {
        usage(&self.entries.read())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.read().contains_key(&key.raw())
    }
}

fn usage(entries: &HashMap<String, Bytes>) -> u64 {
    entries
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum()
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.read().get(&key.raw()).cloned())
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::backend(
                StorageErrorCode::IoError,
                "simulated write failure",
            ));
        }
        check_value_sizes(batch, self.max_value_bytes.load(Ordering::SeqCst))?;

        let mut entries = self.entries.write();
        let mut staged = entries.clone();
        for op in batch {
            match op {
                WriteOp::Put { key, value } => {
                    staged.insert(key.raw(), value.clone());
                }
                WriteOp::Delete { key } => {
                    staged.remove(&key.raw());
                }
            }
        }

        let limit = self.quota_bytes.load(Ordering::SeqCst);
        if limit != u64::MAX {
            let used = usage(&staged);
            if used > limit {
                return Err(StorageError::QuotaExceeded { used, limit });
            }
        }

        *entries = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyNamespace;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(KeyNamespace::MediaBlob, name).unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let store = MemoryKvStore::new();
        store.set(&key("a"), Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.get(&key("a")).unwrap(), Some(Bytes::from_static(b"hello")));

        store.delete(&key("a")).unwrap();
        assert_eq!(store.get(&key("a")).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_quota_rejects_whole_batch() {
        let store = MemoryKvStore::with_quota(64);
        store.set(&key("small"), Bytes::from(vec![0u8; 10])).unwrap();

        let result = store.apply(&[
            WriteOp::put(key("b"), vec![1u8; 8]),
            WriteOp::put(key("huge"), vec![2u8; 100]),
        ]);
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));
        assert!(!store.contains(&key("b")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_frees_quota() {
        let store = MemoryKvStore::with_quota(40);
        store.set(&key("x"), Bytes::from(vec![0u8; 20])).unwrap();
        assert!(store.set(&key("y"), Bytes::from(vec![0u8; 20])).is_err());

        store
            .apply(&[
                WriteOp::delete(key("x")),
                WriteOp::put(key("y"), vec![0u8; 20]),
            ])
            .unwrap();
        assert!(store.contains(&key("y")));
        assert!(!store.contains(&key("x")));
    }

    #[test]
    fn test_oversized_value_rejected_without_partial_write() {
        let store = MemoryKvStore::new();
        store.set_max_value_bytes(16);

        let err = store
            .apply(&[
                WriteOp::put(key("fits"), vec![0u8; 16]),
                WriteOp::put(key("big"), vec![0u8; 17]),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::ValueTooLarge {
                key: "media_blob:big".to_string(),
                size: 17,
                max: 16,
            }
        );
        assert!(!err.is_storage_pressure());
        assert!(store.is_empty());
    }

    #[test]
    fn test_injected_write_failure() {
        let store = MemoryKvStore::new();
        store.set_fail_writes(true);
        let err = store.set(&key("a"), Bytes::new()).unwrap_err();
        assert!(!err.is_storage_pressure());

        store.set_fail_writes(false);
        assert!(store.set(&key("a"), Bytes::new()).is_ok());
    }
}
