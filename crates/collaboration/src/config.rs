//! Engine configuration.
//!
//! Every section falls back to its defaults, so a config file only needs the
//! values it changes:
//!
//! ```json
//! { "rate_limit": { "max_updates_per_second": 5 }, "history": { "max_depth": 50 } }
//! ```
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CollaborationError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub optimistic: OptimisticConfig,
    pub history: HistoryConfig,
    pub conflict: ConflictConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| CollaborationError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CollaborationError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_updates_per_second == 0 {
            return Err(CollaborationError::ConfigError(
                "rate_limit.max_updates_per_second must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.max_queue_depth == 0 {
            return Err(CollaborationError::ConfigError(
                "rate_limit.max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.history.max_depth == 0 {
            return Err(CollaborationError::ConfigError(
                "history.max_depth must be at least 1".to_string(),
            ));
        }
        if self.conflict.tie_window_ms < 0 || self.conflict.storm_window_ms < 0 {
            return Err(CollaborationError::ConfigError(
                "conflict windows cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-key write limiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Writes allowed per key in any rolling second
    pub max_updates_per_second: usize,

    /// Quiet period before a debounced write fires
    pub debounce_ms: u64,

    /// Minimum spacing between two writes for the same key
    pub throttle_ms: u64,

    /// Queued writes kept per key; the oldest is dropped beyond this
    pub max_queue_depth: usize,

    /// Coalesce local edits through the batcher before limiting
    pub batch: bool,

    /// Retries per queued write before it is dropped
    pub max_retries: u32,

    pub retry_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_updates_per_second: 10,
            debounce_ms: 100,
            throttle_ms: 100,
            max_queue_depth: 50,
            batch: true,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Collection window, restarted on every addition
    pub batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_delay_ms: 100 }
    }
}

impl BatchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisticConfig {
    /// How long to wait for a store acknowledgement before re-arming
    pub operation_timeout_ms: u64,

    /// Timeout re-arms before an operation is marked failed
    pub max_retries: u32,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5000,
            max_retries: 3,
        }
    }
}

impl OptimisticConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Timestamps closer than this are a tie, resolved for the remote side
    pub tie_window_ms: i64,

    /// Move/update pairs closer than this can be a rapid edit storm
    pub storm_window_ms: i64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            tie_window_ms: 10,
            storm_window_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "rate_limit": { "max_updates_per_second": 5 }, "history": { "max_depth": 20 } }"#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.max_updates_per_second, 5);
        assert_eq!(config.rate_limit.debounce_ms, 100);
        assert_eq!(config.history.max_depth, 20);
        assert_eq!(config.optimistic, OptimisticConfig::default());
        assert_eq!(config.conflict.tie_window_ms, 10);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let err = EngineConfig::from_json_str(r#"{ "rate_limit": { "max_updates_per_second": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, CollaborationError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(EngineConfig::from_json_str("{ not json").is_err());
    }
}
