use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ferry_config::shared::BulkConfig;

use crate::error::{FerryError, FerryResult};
use crate::types::SizeHint;

/// Store-specific backend committing batches of requests.
pub trait BulkService: Send + Sync + 'static {
    /// A single pending write.
    type Request: SizeHint + Send + Sync + 'static;

    /// Commits `requests` in one round trip.
    ///
    /// An `Err` means the batch as a whole failed and may be retried. Failures of individual
    /// requests are reported through the returned [`BulkResponse`] instead.
    fn commit(
        &self,
        requests: &[Self::Request],
    ) -> impl Future<Output = FerryResult<BulkResponse>> + Send;

    /// Checks that the store is reachable before the first commit.
    fn ping(&self) -> impl Future<Output = FerryResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Outcome of one request within a committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResponse {
    pub id: Option<String>,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResponse {
    pub fn ok(id: Option<String>, status: u16) -> Self {
        Self {
            id,
            status,
            error: None,
        }
    }

    pub fn failed(id: Option<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            id,
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// Time the store reported spending on the batch.
    pub took: Duration,
    pub items: Vec<BulkItemResponse>,
}

impl BulkResponse {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Side-effect hook invoked after every commit attempt sequence with its execution id, the
/// committed requests and either the response or the final error.
pub type AfterCommitHook<R> =
    Arc<dyn Fn(u64, &[R], Option<&BulkResponse>, Option<&FerryError>) + Send + Sync>;

/// Runtime settings of a [`crate::bulk::BulkProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkProcessorConfig {
    pub workers: usize,
    /// Pending request count that triggers a commit. `0` disables the threshold.
    pub bulk_actions: usize,
    /// Pending request size that triggers a commit. `0` disables the threshold.
    pub bulk_size_bytes: usize,
    /// `None` disables timed commits.
    pub flush_interval: Option<Duration>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for BulkProcessorConfig {
    fn default() -> Self {
        Self::from(&BulkConfig::default())
    }
}

impl From<&BulkConfig> for BulkProcessorConfig {
    fn from(config: &BulkConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            bulk_actions: config.bulk_actions,
            bulk_size_bytes: config.bulk_size_bytes,
            flush_interval: (config.flush_interval_ms > 0)
                .then(|| Duration::from_millis(config.flush_interval_ms)),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Counters describing the work done by a bulk processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Number of batches committed, successfully or not.
    pub commits: u64,
    /// Number of requests the store accepted.
    pub succeeded: u64,
    /// Number of requests the store rejected, or that were part of a failed batch.
    pub failed: u64,
}

impl fmt::Display for BulkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commits={} succeeded={} failed={}",
            self.commits, self.succeeded, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_counts_item_outcomes() {
        let response = BulkResponse {
            took: Duration::from_millis(3),
            items: vec![
                BulkItemResponse::ok(Some("1".to_string()), 201),
                BulkItemResponse::failed(Some("2".to_string()), 409, "conflict"),
                BulkItemResponse::ok(None, 200),
            ],
        };

        assert_eq!(response.succeeded(), 2);
        assert_eq!(response.failed(), 1);
    }

    #[test]
    fn zero_flush_interval_disables_timer() {
        let config = BulkProcessorConfig::from(&BulkConfig {
            flush_interval_ms: 0,
            ..BulkConfig::default()
        });
        assert_eq!(config.flush_interval, None);

        let config = BulkProcessorConfig::default();
        assert_eq!(config.flush_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.workers, 2);
    }
}
