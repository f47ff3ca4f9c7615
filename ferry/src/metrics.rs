//! Metric names emitted through the `metrics` facade.

/// Label for the name of a bulk processor.
pub const PROCESSOR_LABEL: &str = "processor";

/// Label for the pipe path of an adaptor.
pub const PATH_LABEL: &str = "path";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Counter for batches committed by bulk processors.
pub const FERRY_BULK_COMMITS_TOTAL: &str = "ferry_bulk_commits_total";

/// Counter for batch commit retries.
pub const FERRY_BULK_COMMIT_RETRIES_TOTAL: &str = "ferry_bulk_commit_retries_total";

/// Counter for requests accepted by the store.
pub const FERRY_BULK_ITEMS_SUCCEEDED_TOTAL: &str = "ferry_bulk_items_succeeded_total";

/// Counter for requests rejected by the store or lost in a failed batch.
pub const FERRY_BULK_ITEMS_FAILED_TOTAL: &str = "ferry_bulk_items_failed_total";

/// Histogram of batch commit durations, retries included.
pub const FERRY_BULK_COMMIT_DURATION_SECONDS: &str = "ferry_bulk_commit_duration_seconds";

/// Counter for messages a source sent into its pipe.
pub const FERRY_MESSAGES_SENT_TOTAL: &str = "ferry_messages_sent_total";

/// Counter for errors reported on a pipeline's error channel.
pub const FERRY_ADAPTOR_ERRORS_TOTAL: &str = "ferry_adaptor_errors_total";
