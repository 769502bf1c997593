use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::UnixTimeMs;

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(QueueError::InvalidOptions(
                "OperationId cannot be empty".into(),
            ));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidOptions(format!(
                "OperationId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::InvalidOptions(
                "OperationId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority tier. Higher tiers always drain before lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank used by the ready set: lower rank runs first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(QueueError::InvalidOptions(format!(
                "invalid priority: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    FailedRetrying,
    DeadLettered,
}

/// Submission policy for a single operation.
#[derive(Clone, Debug, Default)]
pub struct OperationOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub entity: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl OperationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Serializes this operation behind every earlier operation on the same entity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(QueueError::InvalidOptions(
                    "timeout must be greater than zero".into(),
                ));
            }
        }
        if let Some(entity) = &self.entity {
            if entity.trim().is_empty() {
                return Err(QueueError::InvalidOptions(
                    "entity key cannot be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Point-in-time view of an operation, also retained inside dead-letter entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub priority: Priority,
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: OperationStatus,
    pub entity: Option<String>,
    pub metadata: HashMap<String, String>,
    pub enqueued_at: UnixTimeMs,
    pub last_error: Option<String>,
}

impl OperationSnapshot {
    pub(crate) fn new(id: OperationId, options: OperationOptions, now: UnixTimeMs) -> Self {
        Self {
            id,
            priority: options.priority,
            timeout_ms: options
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            max_retries: options.max_retries,
            retry_count: 0,
            status: OperationStatus::Queued,
            entity: options.entity,
            metadata: options.metadata,
            enqueued_at: now,
            last_error: None,
        }
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure reported by a thunk. The variant decides whether the queue retries.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OperationError {
    /// Network failure, 5xx, temporary unavailability
    #[error("transient failure: {0}")]
    Transient(String),

    /// Validation or 4xx - never retried
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// 408, 429 and 5xx are retryable; every other 4xx is terminal.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("HTTP {status}: {}", message.into());
        match status {
            408 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Permanent(message),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Final outcome delivered to the submitter of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("operation was cancelled before it ran")]
    Cancelled,

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("operation panicked")]
    Panicked,

    #[error("queue has been destroyed")]
    Destroyed,

    #[error("invalid operation options: {0}")]
    InvalidOptions(String),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("queue dropped the operation without resolving it")]
    Dropped,
}

impl QueueError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Destroyed)
    }
}
