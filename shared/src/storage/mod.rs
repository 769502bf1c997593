//! Durable key-value storage used by the offline media store.
//!
//! Writes go through [`KeyValueStore::apply`], which commits a batch of
//! [`WriteOp`]s atomically: either every operation lands or none does.

mod memory;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use memory::MemoryKvStore;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteKvStore;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_PREFIX_LENGTH: usize = 64;
/// Largest single value a backend accepts.
pub const MAX_VALUE_BYTES: usize = 128 * 1024 * 1024;

// ============================================================================
// Keys
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Pending-media metadata documents
    Media,
    /// Captured binary payloads, one key per media id
    MediaBlob,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Media => "media",
            KeyNamespace::MediaBlob => "media_blob",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, StorageError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(invalid_key(
                &prefix,
                format!("namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            ));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid_key(&prefix, "namespace allows only [A-Za-z0-9_-]"));
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    namespace: KeyNamespace,
    key: String,
}

impl StorageKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        match key_violation(&key) {
            Some(reason) => Err(invalid_key(&key, reason)),
            None => Ok(Self { namespace, key }),
        }
    }

    /// Flat `"<namespace>:<key>"` form used by the backends.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// First rule `key` breaks, if any.
fn key_violation(key: &str) -> Option<String> {
    if key.trim().is_empty() {
        Some("needs at least one visible character".to_string())
    } else if key.len() > MAX_KEY_LENGTH {
        Some(format!("is {} bytes, limit is {MAX_KEY_LENGTH}", key.len()))
    } else if key.starts_with(['/', '\\']) || key.contains("..") {
        Some("must not point outside its namespace".to_string())
    } else if key.chars().any(|c| c.is_control() && c != '\t') {
        Some("contains control characters".to_string())
    } else {
        None
    }
}

fn invalid_key(key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::InvalidKey {
        key: key.chars().take(64).flat_map(char::escape_debug).collect(),
        reason: reason.into(),
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace.prefix(), self.key)
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: StorageKey, value: Bytes },
    Delete { key: StorageKey },
}

impl WriteOp {
    pub fn put(key: StorageKey, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key,
            value: value.into(),
        }
    }

    pub fn delete(key: StorageKey) -> Self {
        Self::Delete { key }
    }
}

/// Synchronous durable storage. Implementations must make [`apply`] atomic.
///
/// [`apply`]: KeyValueStore::apply
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError>;

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError>;

    fn set(&self, key: &StorageKey, value: Bytes) -> Result<(), StorageError> {
        self.apply(&[WriteOp::Put {
            key: key.clone(),
            value,
        }])
    }

    fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.apply(&[WriteOp::Delete { key: key.clone() }])
    }
}

/// Reject the whole batch if any put carries more than `max` bytes.
pub(crate) fn check_value_sizes(batch: &[WriteOp], max: usize) -> Result<(), StorageError> {
    for op in batch {
        if let WriteOp::Put { key, value } = op {
            if value.len() > max {
                return Err(StorageError::ValueTooLarge {
                    key: key.raw(),
                    size: value.len(),
                    max,
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value for '{key}' too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { key: String, size: usize, max: usize },

    #[error("quota exceeded: {used}/{limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Backend {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl StorageError {
    pub fn backend(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend { retryable: true, .. })
    }

    /// Quota and disk-full failures, which a cleanup pass may relieve.
    pub fn is_storage_pressure(&self) -> bool {
        matches!(
            self,
            StorageError::QuotaExceeded { .. }
                | StorageError::Backend {
                    code: StorageErrorCode::DiskFull,
                    ..
                }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization {
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation_empty() {
        let result = StorageKey::new(KeyNamespace::Media, "");
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_validation_whitespace() {
        assert!(StorageKey::new(KeyNamespace::Media, "   ").is_err());
    }

    #[test]
    fn test_key_validation_null_byte() {
        assert!(StorageKey::new(KeyNamespace::Media, "key\0value").is_err());
    }

    #[test]
    fn test_key_validation_path_traversal() {
        assert!(StorageKey::new(KeyNamespace::MediaBlob, "../etc/passwd").is_err());
        assert!(StorageKey::new(KeyNamespace::MediaBlob, "/abs").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(StorageKey::new(KeyNamespace::Media, long_key).is_err());
    }

    #[test]
    fn test_key_validation_control_chars() {
        assert!(StorageKey::new(KeyNamespace::Media, "key\x01value").is_err());
        assert!(StorageKey::new(KeyNamespace::Media, "tab\tseparated").is_ok());
    }

    #[test]
    fn test_invalid_key_is_escaped_for_logs() {
        let err = StorageKey::new(KeyNamespace::Media, "key\0value").unwrap_err();
        assert_eq!(
            err,
            StorageError::InvalidKey {
                key: "key\\0value".to_string(),
                reason: "contains control characters".to_string(),
            }
        );

        let long = "x".repeat(MAX_KEY_LENGTH + 1);
        match StorageKey::new(KeyNamespace::Media, long).unwrap_err() {
            StorageError::InvalidKey { key, reason } => {
                assert_eq!(key.len(), 64);
                assert!(reason.contains("513 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_oversized_put_rejects_batch() {
        let small = StorageKey::new(KeyNamespace::Media, "small").unwrap();
        let big = StorageKey::new(KeyNamespace::MediaBlob, "big").unwrap();
        let batch = [
            WriteOp::put(small, Bytes::from_static(b"ok")),
            WriteOp::put(big, Bytes::from_static(b"0123456789")),
        ];
        assert!(check_value_sizes(&batch, 10).is_ok());
        assert_eq!(
            check_value_sizes(&batch, 9),
            Err(StorageError::ValueTooLarge {
                key: "media_blob:big".to_string(),
                size: 10,
                max: 9,
            })
        );
    }

    #[test]
    fn test_raw_key_format() {
        let key = StorageKey::new(KeyNamespace::MediaBlob, "abc-123").unwrap();
        assert_eq!(key.raw(), "media_blob:abc-123");
        assert_eq!(key.to_string(), key.raw());
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("drafts").unwrap().prefix(), "drafts");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("bad namespace!").is_err());
    }

    #[test]
    fn test_storage_pressure_classification() {
        assert!(StorageError::QuotaExceeded { used: 10, limit: 5 }.is_storage_pressure());
        assert!(StorageError::backend(StorageErrorCode::DiskFull, "full").is_storage_pressure());
        assert!(!StorageError::backend(StorageErrorCode::Busy, "busy").is_storage_pressure());
        assert!(StorageError::backend(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!StorageError::backend(StorageErrorCode::Corrupted, "bad").is_retryable());
    }
}
