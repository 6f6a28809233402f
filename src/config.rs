//! Configuration for the discovery pipeline.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration.
//!
//! # Example
//!
//! ```
//! use cds_core::config::DiscoveryConfig;
//!
//! let config = DiscoveryConfig::from_json(r#"{"reconcile_batch_size": 50}"#).unwrap();
//! assert_eq!(config.reconcile_batch_size, 50);
//! assert_eq!(config.default_retry_after().as_secs(), 60);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::RetryPolicy;
use crate::recipient::DEFAULT_BATCH_SIZE;

/// Errors from loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The JSON could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables for [`DiscoveryManager`](crate::discovery::DiscoveryManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Recipients handled per reconciliation batch.
    pub reconcile_batch_size: usize,
    /// Retry-after applied when a rate limit carries no hint, in seconds.
    pub default_retry_after_secs: u64,
    /// How long a number stays "recently undiscoverable", in seconds.
    pub undiscoverable_ttl_secs: u64,
    /// Backoff for callers using [`perform_with_retry`](crate::discovery::perform_with_retry).
    pub retry: RetryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            reconcile_batch_size: DEFAULT_BATCH_SIZE,
            default_retry_after_secs: 60,
            undiscoverable_ttl_secs: 6 * 60 * 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is invalid.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "reconcile_batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the reconciliation batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.reconcile_batch_size = batch_size;
        self
    }

    /// Sets the default retry-after.
    #[must_use]
    pub const fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after_secs = retry_after.as_secs();
        self
    }

    /// Sets the undiscoverable TTL.
    #[must_use]
    pub const fn with_undiscoverable_ttl(mut self, ttl: Duration) -> Self {
        self.undiscoverable_ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the default retry-after.
    #[must_use]
    pub const fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    /// Returns the undiscoverable TTL.
    #[must_use]
    pub const fn undiscoverable_ttl(&self) -> Duration {
        Duration::from_secs(self.undiscoverable_ttl_secs)
    }
}
