use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::bulk::{BulkItemResponse, BulkResponse, BulkService};
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::test_utils::notify::DEFAULT_NOTIFY_TIMEOUT;
use crate::types::SizeHint;

#[derive(Debug)]
struct Recorded<R> {
    batches: Mutex<Vec<Vec<R>>>,
    attempts: AtomicUsize,
    commits: watch::Sender<usize>,
}

/// Bulk service that records every successfully committed batch.
///
/// Can be configured to fail a number of initial commit attempts, to reject some items of
/// every batch and to take a fixed time per commit.
#[derive(Debug)]
pub struct RecordingBulkService<R> {
    recorded: Arc<Recorded<R>>,
    fail_first: usize,
    failing_items: usize,
    delay: Option<Duration>,
    _request: PhantomData<fn() -> R>,
}

impl<R> Clone for RecordingBulkService<R> {
    fn clone(&self) -> Self {
        Self {
            recorded: self.recorded.clone(),
            fail_first: self.fail_first,
            failing_items: self.failing_items,
            delay: self.delay,
            _request: PhantomData,
        }
    }
}

impl<R> Default for RecordingBulkService<R> {
    fn default() -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            recorded: Arc::new(Recorded {
                batches: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                commits,
            }),
            fail_first: 0,
            failing_items: 0,
            delay: None,
            _request: PhantomData,
        }
    }
}

impl<R> RecordingBulkService<R>
where
    R: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `attempts` commit attempts as a whole.
    pub fn failing_first(mut self, attempts: usize) -> Self {
        self.fail_first = attempts;
        self
    }

    /// Reports the last `items` requests of every batch as rejected.
    pub fn with_failing_items(mut self, items: usize) -> Self {
        self.failing_items = items;
        self
    }

    /// Makes every commit take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the successfully committed batches in commit order.
    pub fn batches(&self) -> Vec<Vec<R>> {
        self.recorded
            .batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    /// Returns the number of commit attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.recorded.attempts.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` batches were committed successfully.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within [`DEFAULT_NOTIFY_TIMEOUT`].
    pub async fn wait_for_commits(&self, count: usize) {
        let mut commits = self.recorded.commits.subscribe();
        let timed_out = timeout(
            DEFAULT_NOTIFY_TIMEOUT,
            commits.wait_for(|committed| *committed >= count),
        )
        .await
        .is_err();

        if timed_out {
            panic!(
                "waiting for {count} bulk commits timed out after {DEFAULT_NOTIFY_TIMEOUT:?}"
            );
        }
    }
}

impl<R> BulkService for RecordingBulkService<R>
where
    R: SizeHint + Clone + Send + Sync + 'static,
{
    type Request = R;

    async fn commit(&self, requests: &[R]) -> FerryResult<BulkResponse> {
        let attempt = self.recorded.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if attempt < self.fail_first {
            return Err(ferry_error!(
                ErrorKind::BulkCommitFailed,
                "Recording service rejected the batch",
                format!("attempt {}", attempt + 1)
            ));
        }

        let failing_from = requests.len().saturating_sub(self.failing_items);
        let items = (0..requests.len())
            .map(|index| {
                if index >= failing_from {
                    BulkItemResponse::failed(Some(index.to_string()), 400, "rejected")
                } else {
                    BulkItemResponse::ok(Some(index.to_string()), 201)
                }
            })
            .collect();

        if let Ok(mut batches) = self.recorded.batches.lock() {
            batches.push(requests.to_vec());
        }
        self.recorded.commits.send_modify(|committed| *committed += 1);

        Ok(BulkResponse {
            took: self.delay.unwrap_or_default(),
            items,
        })
    }
}
