//! Batched writes with count, size and time thresholds.
//!
//! A [`BulkProcessor`] accumulates requests for a store-specific [`BulkService`] and commits them
//! in batches. A batch is handed to one of several concurrent workers as soon as the pending
//! requests reach the configured count or size, and a ticker hands over whatever is pending once
//! per flush interval. [`BulkProcessor::flush`] waits for every dispatched batch and then commits
//! the rest inline, which lets writers order destructive requests after everything submitted
//! before them.

mod service;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use service::{
    AfterCommitHook, BulkItemResponse, BulkProcessorConfig, BulkResponse, BulkService, BulkStats,
};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, FerryResult};
use crate::metrics::{
    FERRY_BULK_COMMIT_DURATION_SECONDS, FERRY_BULK_COMMIT_RETRIES_TOTAL, FERRY_BULK_COMMITS_TOTAL,
    FERRY_BULK_ITEMS_FAILED_TOTAL, FERRY_BULK_ITEMS_SUCCEEDED_TOTAL, PROCESSOR_LABEL,
};
use crate::types::SizeHint;

type BatchTx<R> = mpsc::Sender<Vec<R>>;

type BatchRx<R> = Arc<Mutex<mpsc::Receiver<Vec<R>>>>;

#[derive(Debug)]
struct Pending<R> {
    requests: Vec<R>,
    size: usize,
}

/// A batch taken out of the accumulator, on its way to a worker.
struct Dispatch<R> {
    sender: Option<BatchTx<R>>,
    requests: Vec<R>,
}

struct Inner<S: BulkService> {
    name: String,
    config: BulkProcessorConfig,
    service: S,
    after_commit: Option<AfterCommitHook<S::Request>>,
    pending: Mutex<Pending<S::Request>>,
    queue: StdMutex<Option<BatchTx<S::Request>>>,
    in_flight: watch::Sender<usize>,
    execution_id: AtomicU64,
    commits: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
    ticker_shutdown: ShutdownTx,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Accumulates requests and commits them in batches through a [`BulkService`].
///
/// A processor must be closed with [`BulkProcessor::close`], which commits everything still
/// pending and stops its workers.
pub struct BulkProcessor<S: BulkService> {
    inner: Arc<Inner<S>>,
}

impl<S: BulkService> Clone for BulkProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: BulkService> BulkProcessor<S> {
    /// Starts a processor with its workers and, if configured, its flush ticker.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        service: S,
        config: BulkProcessorConfig,
        after_commit: Option<AfterCommitHook<S::Request>>,
    ) -> Self {
        let name = name.into();
        let workers = config.workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(workers);
        let (ticker_shutdown, ticker_shutdown_rx) = create_shutdown_channel();
        let (in_flight, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            name: name.clone(),
            config,
            service,
            after_commit,
            pending: Mutex::new(Pending {
                requests: Vec::new(),
                size: 0,
            }),
            queue: StdMutex::new(Some(queue_tx)),
            in_flight,
            execution_id: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ticker_shutdown,
            tasks: StdMutex::new(Vec::new()),
        });

        let queue_rx: BatchRx<S::Request> = Arc::new(Mutex::new(queue_rx));
        let mut tasks = Vec::with_capacity(workers + 1);
        for worker_id in 0..workers {
            let span = info_span!("bulk_worker", processor = %name, worker_id);
            tasks.push(tokio::spawn(
                run_worker(inner.clone(), queue_rx.clone()).instrument(span),
            ));
        }

        if let Some(interval) = inner.config.flush_interval {
            let span = info_span!("bulk_ticker", processor = %name);
            tasks.push(tokio::spawn(
                run_ticker(inner.clone(), interval, ticker_shutdown_rx).instrument(span),
            ));
        }

        *inner.tasks() = tasks;

        info!(
            processor = %name,
            workers,
            bulk_actions = inner.config.bulk_actions,
            bulk_size_bytes = inner.config.bulk_size_bytes,
            "bulk processor started"
        );

        Self { inner }
    }

    /// Adds a request to the accumulator.
    ///
    /// Hands the pending batch to a worker once a count or size threshold is reached, waiting
    /// for queue capacity if every worker is busy. Fails with [`ErrorKind::BulkProcessorClosed`]
    /// after [`BulkProcessor::close`].
    pub async fn add(&self, request: S::Request) -> FerryResult<()> {
        let dispatch = {
            let mut pending = self.inner.pending.lock().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                bail!(
                    ErrorKind::BulkProcessorClosed,
                    "Bulk processor no longer accepts requests",
                    format!("processor `{}` is closed", self.inner.name)
                );
            }

            pending.size += request.size_hint();
            pending.requests.push(request);

            if self.inner.threshold_reached(&pending) {
                self.inner.take_batch(&mut pending)
            } else {
                None
            }
        };

        if let Some(dispatch) = dispatch {
            self.inner.send(dispatch).await;
        }

        Ok(())
    }

    /// Waits for every dispatched batch to finish, then commits the pending requests inline.
    ///
    /// Returns the error of the inline commit if it failed after all retries.
    pub async fn flush(&self) -> FerryResult<()> {
        self.inner.flush().await
    }

    /// Stops the ticker, commits everything pending and joins the workers.
    ///
    /// Later calls return `Ok(())` without doing anything.
    pub async fn close(&self) -> FerryResult<()> {
        {
            let _pending = self.inner.pending.lock().await;
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        self.inner.ticker_shutdown.shutdown();
        let result = self.inner.flush().await;

        // Workers exit once the last sender is gone and the queue is empty.
        drop(self.inner.queue().take());

        let tasks = std::mem::take(&mut *self.inner.tasks());
        for task in tasks {
            if let Err(err) = task.await {
                error!(processor = %self.inner.name, error = %err, "bulk processor task failed");
            }
        }

        info!(processor = %self.inner.name, stats = %self.stats(), "bulk processor closed");

        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BulkStats {
        BulkStats {
            commits: self.inner.commits.load(Ordering::SeqCst),
            succeeded: self.inner.succeeded.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    /// Returns the number of requests waiting in the accumulator.
    pub async fn pending(&self) -> usize {
        self.inner.pending.lock().await.requests.len()
    }

    /// Returns the number of batches handed to workers and not yet committed.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    pub fn config(&self) -> &BulkProcessorConfig {
        &self.inner.config
    }
}

impl<S: BulkService> Inner<S> {
    fn threshold_reached(&self, pending: &Pending<S::Request>) -> bool {
        (self.config.bulk_actions > 0 && pending.requests.len() >= self.config.bulk_actions)
            || (self.config.bulk_size_bytes > 0 && pending.size >= self.config.bulk_size_bytes)
    }

    /// Takes every pending request out of the accumulator.
    ///
    /// Must be called with the accumulator locked so the batch is counted as in flight before
    /// any flush can observe the accumulator again.
    fn take_batch(&self, pending: &mut Pending<S::Request>) -> Option<Dispatch<S::Request>> {
        if pending.requests.is_empty() {
            return None;
        }

        let requests = std::mem::take(&mut pending.requests);
        pending.size = 0;

        let sender = self.queue().clone();
        self.in_flight.send_modify(|count| *count += 1);

        Some(Dispatch { sender, requests })
    }

    async fn send(&self, dispatch: Dispatch<S::Request>) {
        let requests = match dispatch.sender {
            Some(sender) => match sender.send(dispatch.requests).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(requests)) => requests,
            },
            None => dispatch.requests,
        };

        // No worker is left to take the batch, so it is committed right here.
        if let Err(err) = self.commit(requests).await {
            debug!(processor = %self.name, error = %err, "inline bulk commit failed");
        }
        self.finish_batch();
    }

    fn finish_batch(&self) {
        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    async fn flush(&self) -> FerryResult<()> {
        let mut in_flight = self.in_flight.subscribe();

        loop {
            let _ = in_flight.wait_for(|count| *count == 0).await;

            let mut pending = self.pending.lock().await;
            // A ticker dispatch may have slipped in before the lock was taken.
            if *self.in_flight.borrow() != 0 {
                continue;
            }

            if pending.requests.is_empty() {
                return Ok(());
            }

            let requests = std::mem::take(&mut pending.requests);
            pending.size = 0;

            debug!(processor = %self.name, requests = requests.len(), "flushing bulk processor");

            return self.commit(requests).await.map(|_| ());
        }
    }

    async fn commit(&self, requests: Vec<S::Request>) -> FerryResult<BulkResponse> {
        let execution_id = self.execution_id.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let result = loop {
            match self.service.commit(&requests).await {
                Ok(response) => break Ok(response),
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self
                        .config
                        .retry_backoff
                        .saturating_mul(1 << (attempt - 1).min(16));

                    warn!(
                        processor = %self.name,
                        execution_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "bulk commit failed, retrying"
                    );
                    counter!(FERRY_BULK_COMMIT_RETRIES_TOTAL, PROCESSOR_LABEL => self.name.clone())
                        .increment(1);

                    tokio::time::sleep(backoff).await;
                }
                Err(err) => break Err(err),
            }
        };

        self.commits.fetch_add(1, Ordering::SeqCst);
        counter!(FERRY_BULK_COMMITS_TOTAL, PROCESSOR_LABEL => self.name.clone()).increment(1);
        histogram!(FERRY_BULK_COMMIT_DURATION_SECONDS, PROCESSOR_LABEL => self.name.clone())
            .record(started.elapsed().as_secs_f64());

        let (succeeded, failed) = match &result {
            Ok(response) => (response.succeeded(), response.failed()),
            Err(_) => (0, requests.len()),
        };
        self.succeeded.fetch_add(succeeded as u64, Ordering::SeqCst);
        self.failed.fetch_add(failed as u64, Ordering::SeqCst);
        counter!(FERRY_BULK_ITEMS_SUCCEEDED_TOTAL, PROCESSOR_LABEL => self.name.clone())
            .increment(succeeded as u64);
        counter!(FERRY_BULK_ITEMS_FAILED_TOTAL, PROCESSOR_LABEL => self.name.clone())
            .increment(failed as u64);

        match &result {
            Ok(response) if failed > 0 => warn!(
                processor = %self.name,
                execution_id,
                took_ms = response.took.as_millis() as u64,
                succeeded,
                failed,
                "bulk commit finished with failed items"
            ),
            Ok(response) => info!(
                processor = %self.name,
                execution_id,
                took_ms = response.took.as_millis() as u64,
                succeeded,
                failed,
                "bulk commit finished"
            ),
            Err(err) => error!(
                processor = %self.name,
                execution_id,
                requests = requests.len(),
                error = %err,
                "bulk commit failed"
            ),
        }

        if let Some(after_commit) = &self.after_commit {
            after_commit(
                execution_id,
                &requests,
                result.as_ref().ok(),
                result.as_ref().err(),
            );
        }

        result
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, Option<BatchTx<S::Request>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_worker<S: BulkService>(inner: Arc<Inner<S>>, queue: BatchRx<S::Request>) {
    loop {
        let batch = queue.lock().await.recv().await;
        let Some(requests) = batch else {
            break;
        };

        // The after-commit hook has already seen the failure.
        if let Err(err) = inner.commit(requests).await {
            debug!(processor = %inner.name, error = %err, "worker bulk commit failed");
        }
        inner.finish_batch();
    }

    debug!("bulk worker stopped");
}

async fn run_ticker<S: BulkService>(
    inner: Arc<Inner<S>>,
    interval: Duration,
    mut shutdown_rx: ShutdownRx,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => break,
            _ = ticker.tick() => {}
        }

        let dispatch = {
            let mut pending = inner.pending.lock().await;
            inner.take_batch(&mut pending)
        };

        if let Some(dispatch) = dispatch {
            debug!(requests = dispatch.requests.len(), "flush interval elapsed");
            inner.send(dispatch).await;
        }
    }

    debug!("bulk ticker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::test_utils::bulk::RecordingBulkService;

    fn config(bulk_actions: usize, flush_interval: Option<Duration>) -> BulkProcessorConfig {
        BulkProcessorConfig {
            workers: 2,
            bulk_actions,
            bulk_size_bytes: 1 << 20,
            flush_interval,
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn request(value: &str) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn count_threshold_dispatches_batch() {
        let service = RecordingBulkService::new();
        let processor = BulkProcessor::start("test", service.clone(), config(3, None), None);

        for value in ["a", "b", "c"] {
            processor.add(request(value)).await.unwrap();
        }
        service.wait_for_commits(1).await;

        assert_eq!(service.batches(), vec![vec!["a", "b", "c"]]);
        assert_eq!(processor.pending().await, 0);

        processor.close().await.unwrap();
    }

    #[tokio::test]
    async fn size_threshold_dispatches_batch() {
        let service = RecordingBulkService::new();
        let processor = BulkProcessor::start(
            "test",
            service.clone(),
            BulkProcessorConfig {
                bulk_size_bytes: 8,
                ..config(100, None)
            },
            None,
        );

        processor.add(request("1234")).await.unwrap();
        assert_eq!(processor.pending().await, 1);
        processor.add(request("5678")).await.unwrap();
        service.wait_for_commits(1).await;

        assert_eq!(service.batches(), vec![vec!["1234", "5678"]]);
        processor.close().await.unwrap();
    }

    #[tokio::test]
    async fn flush_commits_pending_after_in_flight_batches() {
        let service = RecordingBulkService::new().with_delay(Duration::from_millis(20));
        let processor = BulkProcessor::start("test", service.clone(), config(2, None), None);

        for value in ["a", "b", "c"] {
            processor.add(request(value)).await.unwrap();
        }
        processor.flush().await.unwrap();

        assert_eq!(service.batches(), vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(processor.in_flight(), 0);
        assert_eq!(processor.pending().await, 0);

        processor.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_commits_pending_requests() {
        let service = RecordingBulkService::new();
        let processor = BulkProcessor::start(
            "test",
            service.clone(),
            config(1000, Some(Duration::from_secs(1))),
            None,
        );

        processor.add(request("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(service.batches().is_empty());

        service.wait_for_commits(1).await;
        assert_eq!(service.batches(), vec![vec!["a"]]);

        processor.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_commits_are_retried() {
        let service = RecordingBulkService::new().failing_first(2);
        let processor = BulkProcessor::start("test", service.clone(), config(1, None), None);

        processor.add(request("a")).await.unwrap();
        processor.close().await.unwrap();

        assert_eq!(service.attempts(), 3);
        assert_eq!(service.batches(), vec![vec!["a"]]);
        assert_eq!(
            processor.stats(),
            BulkStats {
                commits: 1,
                succeeded: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_report_error_to_hook() {
        let service = RecordingBulkService::new().failing_first(10);
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let hook: AfterCommitHook<String> = {
            let errors = errors.clone();
            Arc::new(move |execution_id, requests, response, error| {
                assert!(response.is_none());
                errors.lock().unwrap().push((
                    execution_id,
                    requests.len(),
                    error.map(|err| err.kind()),
                ));
            })
        };
        let processor = BulkProcessor::start("test", service.clone(), config(10, None), Some(hook));

        processor.add(request("a")).await.unwrap();
        let err = processor.flush().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BulkCommitFailed);
        assert_eq!(service.attempts(), 3);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![(1, 1, Some(ErrorKind::BulkCommitFailed))]
        );
        assert_eq!(processor.stats().failed, 1);

        processor.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_after_close_is_rejected_and_close_is_idempotent() {
        let service = RecordingBulkService::new();
        let processor = BulkProcessor::start("test", service.clone(), config(10, None), None);

        processor.add(request("a")).await.unwrap();
        processor.close().await.unwrap();
        processor.close().await.unwrap();

        let err = processor.add(request("b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BulkProcessorClosed);
        assert!(processor.is_closed());
        assert_eq!(service.batches(), vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn execution_ids_increase_monotonically() {
        let service = RecordingBulkService::new();
        let ids = Arc::new(StdMutex::new(Vec::new()));
        let hook: AfterCommitHook<String> = {
            let ids = ids.clone();
            Arc::new(move |execution_id, _requests, _response, _error| {
                ids.lock().unwrap().push(execution_id);
            })
        };
        let processor = BulkProcessor::start("test", service.clone(), config(100, None), Some(hook));

        for value in ["a", "b", "c"] {
            processor.add(request(value)).await.unwrap();
            processor.flush().await.unwrap();
        }
        processor.close().await.unwrap();

        assert_eq!(*ids.lock().unwrap(), vec![1, 2, 3]);
    }
}
