use std::time::Duration;
use std::{fmt, sync::Arc};

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default time tests wait for an expected state before failing.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`Notify`] whose waits fail the test instead of hanging when nothing is notified.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(timeout_duration: Duration) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            timeout_duration,
        }
    }

    /// Wakes the current waiter, or the next one if nobody waits yet.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Waits for a notification.
    ///
    /// # Panics
    ///
    /// Panics if the timeout elapses before a notification arrives.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "test notification timed out after {:?}, the expected state was never reached",
                self.timeout_duration
            );
        }
    }

    /// Re-evaluates `condition` on every notification until it holds.
    ///
    /// # Panics
    ///
    /// Panics if the condition does not hold within the timeout.
    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let notify = self.notify.clone();
        let wait = async move {
            loop {
                let notified = notify.notified();
                if condition() {
                    return;
                }
                notified.await;
            }
        };

        if timeout(self.timeout_duration, wait).await.is_err() {
            panic!(
                "test condition not reached after {:?}",
                self.timeout_duration
            );
        }
    }
}

impl Default for TimedNotify {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
