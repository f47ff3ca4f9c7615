//! One-shot shutdown broadcast and completion tracking.
//!
//! A [`ShutdownTx`] fires a signal observed by any number of [`ShutdownRx`] handles. Tasks that
//! must finish cleanup before their owner returns register on a [`CompletionCounter`], and the
//! owner waits for the counter to drop back to zero.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::Session;

/// Transmitter side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Fires the shutdown signal.
    ///
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let was_shutdown = self.0.send_replace(true);
        if !was_shutdown {
            debug!("shutdown signal fired");
        }
    }

    /// Returns `true` if the signal has already fired.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Creates a new receiver for this signal.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Waits until the shutdown signal fires.
    ///
    /// Returns immediately if it already fired. If every transmitter is dropped without firing,
    /// the wait also completes since no signal can arrive anymore.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }

    /// Returns `true` if the signal has already fired.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Creates a new shutdown signal, initially not fired.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

/// Counts outstanding background tasks that must complete before their owner stops.
#[derive(Debug, Clone)]
pub struct CompletionCounter {
    tx: watch::Sender<usize>,
}

impl CompletionCounter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Registers `n` more outstanding tasks.
    pub fn add(&self, n: usize) {
        self.tx.send_modify(|count| *count += n);
    }

    /// Reports one task as complete.
    pub fn done(&self) {
        self.tx
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Returns the number of outstanding tasks.
    pub fn outstanding(&self) -> usize {
        *self.tx.borrow()
    }

    /// Waits until no task is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for `done`, releases `session` through its close capability and reports completion.
///
/// The caller must register this watcher with `completions.add(1)` before spawning it, so that an
/// owner waiting on `completions` can never observe zero before the session was released.
pub async fn run_shutdown_watcher<S>(
    mut done: ShutdownRx,
    completions: CompletionCounter,
    mut session: S,
) where
    S: Session,
{
    done.wait().await;

    if let Some(closer) = session.closer() {
        info!("closing session after shutdown");
        closer.close().await;
    }

    completions.done();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::client::Closer;

    struct CountingSession {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Closer for CountingSession {
        async fn close(&mut self) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Session for CountingSession {
        fn closer(&mut self) -> Option<&mut dyn Closer> {
            Some(self)
        }
    }

    struct PlainSession;

    impl Session for PlainSession {}

    #[tokio::test]
    async fn wait_returns_immediately_after_fire() {
        let (tx, mut rx) = create_shutdown_channel();
        tx.shutdown();
        tx.shutdown();

        rx.wait().await;
        assert!(rx.is_shutdown());
        assert!(tx.subscribe().is_shutdown());
    }

    #[tokio::test]
    async fn every_receiver_observes_signal() {
        let (tx, rx) = create_shutdown_channel();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut rx = rx.clone();
            handles.push(tokio::spawn(async move { rx.wait().await }));
        }

        tx.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn counter_waits_for_all_completions() {
        let counter = CompletionCounter::new();
        counter.add(2);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait().await })
        };

        counter.done();
        assert_eq!(counter.outstanding(), 1);
        assert!(!waiter.is_finished());

        counter.done();
        waiter.await.unwrap();
        assert_eq!(counter.outstanding(), 0);
    }

    #[tokio::test]
    async fn watcher_closes_session_before_completing() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = create_shutdown_channel();
        let completions = CompletionCounter::new();

        completions.add(1);
        tokio::spawn(run_shutdown_watcher(
            rx,
            completions.clone(),
            CountingSession {
                closes: closes.clone(),
            },
        ));

        tx.shutdown();
        completions.wait().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn watcher_completes_without_close_capability() {
        let (tx, rx) = create_shutdown_channel();
        let completions = CompletionCounter::new();

        completions.add(1);
        tokio::spawn(run_shutdown_watcher(rx, completions.clone(), PlainSession));

        tx.shutdown();
        completions.wait().await;
        assert_eq!(completions.outstanding(), 0);
    }
}
