//! Message routing between adaptors.
//!
//! Pipes form a tree rooted at the source adaptor. Every child is attached to its parent through
//! a namespace route, so a message sent into a pipe reaches exactly the children whose route
//! matches the message namespace. All pipes of one tree share a single error channel on which
//! adaptors report failures as [`AdaptorError`]s.
//!
//! A pipe moves through [`PipeState::Created`], [`PipeState::Listening`],
//! [`PipeState::Stopping`] and [`PipeState::Stopped`]. Stopping a listening pipe drains the
//! messages already in its inbox before its children are stopped in turn.

mod chain;
mod error;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, trace, warn};

pub use chain::{ApplyChain, ApplyFn};
pub use error::{AdaptorError, ErrorLevel, ErrorRx, ErrorTx, create_error_channel};

use crate::bail;
use crate::error::{ErrorKind, FerryError, FerryResult};
use crate::ferry_error;
use crate::message::Message;

/// Default number of messages buffered in a pipe's inbox.
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// Lifecycle state of a [`Pipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeState {
    Created,
    Listening,
    Stopping,
    Stopped,
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            PipeState::Created => "created",
            PipeState::Listening => "listening",
            PipeState::Stopping => "stopping",
            PipeState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

struct Route {
    pattern: Regex,
    child: Pipe,
}

struct PipeInner {
    path: String,
    capacity: usize,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    routes: RwLock<Vec<Route>>,
    errors: ErrorTx,
    state: watch::Sender<PipeState>,
}

/// A node in the routing tree. Cloning a [`Pipe`] yields another handle to the same node.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// Creates the root pipe of a new tree.
    pub fn new(path: impl Into<String>, errors: ErrorTx) -> Self {
        Self::with_capacity(path, errors, DEFAULT_PIPE_CAPACITY)
    }

    /// Creates the root pipe of a new tree whose pipes buffer `capacity` messages each.
    pub fn with_capacity(path: impl Into<String>, errors: ErrorTx, capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(PipeState::Created);

        Self {
            inner: Arc::new(PipeInner {
                path: path.into(),
                capacity,
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                routes: RwLock::new(Vec::new()),
                errors,
                state,
            }),
        }
    }

    /// Creates a child pipe receiving the messages whose namespace matches `namespace_pattern`.
    pub fn child(&self, path: impl Into<String>, namespace_pattern: &str) -> FerryResult<Pipe> {
        let pattern = Regex::new(namespace_pattern)?;
        let child = Pipe::with_capacity(path, self.inner.errors.clone(), self.inner.capacity);

        self.routes_mut().push(Route {
            pattern,
            child: child.clone(),
        });

        debug!(
            parent = %self.path(),
            child = %child.path(),
            pattern = namespace_pattern,
            "pipe route added"
        );

        Ok(child)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn state(&self) -> PipeState {
        *self.inner.state.borrow()
    }

    /// Returns the number of children attached to this pipe.
    pub fn children(&self) -> usize {
        self.routes().len()
    }

    /// Waits until this pipe has left [`PipeState::Created`].
    pub async fn wait_until_listening(&self) {
        let mut state_rx = self.inner.state.subscribe();
        let _ = state_rx
            .wait_for(|state| *state != PipeState::Created)
            .await;
    }

    /// Sends `message` to every child whose route matches its namespace.
    ///
    /// Waits for inbox capacity of each receiving child. A message that matches no route is
    /// dropped. Fails with [`ErrorKind::PipeStopped`] once this pipe is stopping or stopped.
    pub async fn send(&self, message: Message) -> FerryResult<()> {
        if matches!(self.state(), PipeState::Stopping | PipeState::Stopped) {
            bail!(
                ErrorKind::PipeStopped,
                "Cannot send on a stopped pipe",
                format!("pipe `{}` is {}", self.path(), self.state())
            );
        }

        self.route(message).await
    }

    /// Reports an error on the shared error channel.
    pub fn report(&self, error: AdaptorError) {
        if self.inner.errors.send(error).is_err() {
            debug!(path = %self.path(), "error channel closed, adaptor error dropped");
        }
    }

    /// Receives messages and runs `apply` on those whose collection matches `match_pattern`.
    ///
    /// The pattern is matched against the collection part of the `database.collection`
    /// namespace, the same part a source read filter is applied to. Messages whose namespace
    /// cannot be split are skipped.
    ///
    /// A message returned by `apply` is forwarded to this pipe's children. Errors are reported
    /// on the error channel and the loop continues, unless the error is fatal, in which case it
    /// is reported as [`ErrorLevel::Critical`], the pipe stops and the error is returned.
    ///
    /// Returns once the pipe was stopped and every message in the inbox was processed.
    pub async fn listen<F, Fut>(&self, mut apply: F, match_pattern: &Regex) -> FerryResult<()>
    where
        F: FnMut(Message) -> Fut + Send,
        Fut: Future<Output = FerryResult<Option<Message>>> + Send,
    {
        let Some(mut inbox) = self.inner.inbox_rx.lock().await.take() else {
            bail!(
                ErrorKind::InvalidState,
                "Pipe is already listening",
                format!("pipe `{}` has no inbox left", self.path())
            );
        };

        let started = self.inner.state.send_if_modified(|state| {
            if *state == PipeState::Created {
                *state = PipeState::Listening;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(path = %self.path(), "pipe stopped before listening");
            return Ok(());
        }

        info!(path = %self.path(), "pipe listening");

        let mut state_rx = self.inner.state.subscribe();
        loop {
            let message = tokio::select! {
                biased;

                _ = state_rx.wait_for(|state| *state != PipeState::Listening) => break,
                message = inbox.recv() => message,
            };

            let Some(message) = message else {
                break;
            };

            if let Err(err) = self.process(&mut apply, match_pattern, message).await {
                inbox.close();
                self.finish().await;
                return Err(err);
            }
        }

        inbox.close();
        let mut drained = 0usize;
        while let Some(message) = inbox.recv().await {
            drained += 1;
            if let Err(err) = self.process(&mut apply, match_pattern, message).await {
                self.finish().await;
                return Err(err);
            }
        }
        debug!(path = %self.path(), drained, "pipe inbox drained");

        self.finish().await;
        info!(path = %self.path(), "pipe stopped");

        Ok(())
    }

    /// Stops this pipe and, once drained, all of its children.
    ///
    /// Returns after the pipe reached [`PipeState::Stopped`]. Calling it again, or concurrently,
    /// only waits for that state.
    pub fn stop(&self) -> BoxFuture<'static, ()> {
        let pipe = self.clone();

        async move {
            let mut cascade = false;
            pipe.inner.state.send_if_modified(|state| match *state {
                PipeState::Created => {
                    *state = PipeState::Stopping;
                    cascade = true;
                    true
                }
                PipeState::Listening => {
                    *state = PipeState::Stopping;
                    true
                }
                PipeState::Stopping | PipeState::Stopped => false,
            });

            // Nobody listens on a created pipe, so the stopping caller completes the cascade.
            if cascade {
                pipe.finish().await;
            }

            let mut state_rx = pipe.inner.state.subscribe();
            let _ = state_rx
                .wait_for(|state| *state == PipeState::Stopped)
                .await;
        }
        .boxed()
    }

    async fn process<F, Fut>(
        &self,
        apply: &mut F,
        match_pattern: &Regex,
        message: Message,
    ) -> FerryResult<()>
    where
        F: FnMut(Message) -> Fut + Send,
        Fut: Future<Output = FerryResult<Option<Message>>> + Send,
    {
        let matched = message
            .split_namespace()
            .is_ok_and(|(_, collection)| match_pattern.is_match(collection));
        if !matched {
            trace!(path = %self.path(), namespace = message.namespace(), "message skipped by listen pattern");
            return Ok(());
        }

        let original = message.clone();
        match apply(message).await {
            Ok(Some(result)) => {
                if let Err(err) = self.route(result).await {
                    warn!(path = %self.path(), error = %err, "failed to forward message");
                    self.report(
                        AdaptorError::new(ErrorLevel::Warning, self.path(), err)
                            .with_message(&original),
                    );
                }
            }
            Ok(None) => {
                trace!(path = %self.path(), namespace = original.namespace(), "message dropped by apply");
            }
            Err(err) if err.is_fatal() => {
                self.report(
                    AdaptorError::new(ErrorLevel::Critical, self.path(), err.clone())
                        .with_message(&original),
                );
                return Err(err);
            }
            Err(err) => {
                self.report(
                    AdaptorError::new(ErrorLevel::Error, self.path(), err).with_message(&original),
                );
            }
        }

        Ok(())
    }

    async fn route(&self, message: Message) -> FerryResult<()> {
        let targets: Vec<Pipe> = self
            .routes()
            .iter()
            .filter(|route| route.pattern.is_match(message.namespace()))
            .map(|route| route.child.clone())
            .collect();

        let Some((last, rest)) = targets.split_last() else {
            trace!(path = %self.path(), namespace = message.namespace(), "no route matched, message dropped");
            return Ok(());
        };

        let mut errors: Vec<FerryError> = Vec::new();
        for child in rest {
            if let Err(err) = child.deliver(message.clone()).await {
                errors.push(err);
            }
        }
        if let Err(err) = last.deliver(message).await {
            errors.push(err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn deliver(&self, message: Message) -> FerryResult<()> {
        let mut state_rx = self.inner.state.subscribe();

        tokio::select! {
            biased;

            _ = state_rx.wait_for(|state| *state == PipeState::Stopped) => {
                Err(stopped_error(self.path()))
            }
            result = self.inner.inbox_tx.send(message) => {
                result.map_err(|_| stopped_error(self.path()))
            }
        }
    }

    async fn finish(&self) {
        let children: Vec<Pipe> = self
            .routes()
            .iter()
            .map(|route| route.child.clone())
            .collect();

        for child in children {
            child.stop().await;
        }

        self.inner.state.send_replace(PipeState::Stopped);
    }

    fn routes(&self) -> std::sync::RwLockReadGuard<'_, Vec<Route>> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn routes_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Route>> {
        self.inner
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("path", &self.path())
            .field("state", &self.state())
            .field("children", &self.children())
            .finish()
    }
}

fn stopped_error(path: &str) -> FerryError {
    ferry_error!(
        ErrorKind::PipeStopped,
        "Pipe no longer accepts messages",
        format!("pipe `{path}` is stopped")
    )
}
