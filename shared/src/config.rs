use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::offline_store::MediaStoreConfig;
use crate::queue::QueueConfig;
use crate::sync::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {section} config: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

/// Settings for the whole resilience layer, typically shipped by the shell
/// as JSON. Missing sections and fields take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub queue: QueueConfig,
    pub media: MediaStoreConfig,
    pub sync: SyncConfig,
}

impl ResilienceConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate().map_err(|e| ConfigError::Invalid {
            section: "queue",
            reason: e.to_string(),
        })?;
        self.media.validate().map_err(|e| ConfigError::Invalid {
            section: "media",
            reason: e.to_string(),
        })?;
        self.sync.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = ResilienceConfig::from_json("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());
        assert_eq!(config.queue.concurrency, 1);
        assert_eq!(config.queue.max_delay_ms, 30_000);
        assert_eq!(config.sync.stabilization_delay_ms, 2_000);
        assert_eq!(config.media.metadata_key, "pending");
    }

    #[test]
    fn test_partial_document_overrides_fields() {
        let config = ResilienceConfig::from_json(
            r#"{
                "queue": { "concurrency": 4, "jitter_ms": 250 },
                "media": { "upload_priority": "high", "max_retries": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.queue.concurrency, 4);
        assert_eq!(config.queue.jitter_ms, 250);
        assert_eq!(config.queue.base_delay_ms, 1_000);
        assert_eq!(config.media.upload_priority, Priority::High);
        assert_eq!(config.media.max_retries, 5);
        assert_eq!(config.media.max_entries, 1_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ResilienceConfig::from_json(r#"{ "queue": { "concurrency": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "queue", .. }));

        let err =
            ResilienceConfig::from_json(r#"{ "media": { "metadata_key": "../x" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "media", .. }));

        let err = ResilienceConfig::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
