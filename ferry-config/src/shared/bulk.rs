use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batched write configuration for sinks that commit through a bulk processor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BulkConfig {
    /// Number of concurrent committers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Number of pending requests that triggers a commit.
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: usize,
    /// Estimated size of pending requests, in bytes, that triggers a commit.
    #[serde(default = "default_bulk_size_bytes")]
    pub bulk_size_bytes: usize,
    /// Maximum time, in milliseconds, a request stays pending. `0` disables timed commits.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Number of times a failed commit is retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff, in milliseconds, before the first retry. Doubles with every further retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl BulkConfig {
    pub const DEFAULT_WORKERS: usize = 2;

    pub const DEFAULT_BULK_ACTIONS: usize = 1000;

    /// Default commit size threshold, 2 MiB.
    pub const DEFAULT_BULK_SIZE_BYTES: usize = 2 << 20;

    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;

    pub const DEFAULT_MAX_RETRIES: u32 = 2;

    pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

    /// Validates bulk configuration settings.
    ///
    /// Ensures the worker count and both commit thresholds are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let checks = [
            ("bulk.workers", self.workers),
            ("bulk.bulk_actions", self.bulk_actions),
            ("bulk.bulk_size_bytes", self.bulk_size_bytes),
        ];

        for (field, value) in checks {
            if value == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_string(),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            bulk_actions: default_bulk_actions(),
            bulk_size_bytes: default_bulk_size_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_workers() -> usize {
    BulkConfig::DEFAULT_WORKERS
}

fn default_bulk_actions() -> usize {
    BulkConfig::DEFAULT_BULK_ACTIONS
}

fn default_bulk_size_bytes() -> usize {
    BulkConfig::DEFAULT_BULK_SIZE_BYTES
}

fn default_flush_interval_ms() -> u64 {
    BulkConfig::DEFAULT_FLUSH_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    BulkConfig::DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    BulkConfig::DEFAULT_RETRY_BACKOFF_MS
}
