use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;

use crate::bail;
use crate::client::{Client, Closer, Session, WriteOp, Writer, write_op};
use crate::error::{ErrorKind, FerryResult};
use crate::message::Message;

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    written: Mutex<Vec<Message>>,
}

/// Client whose sessions record every write and count how often they are closed.
#[derive(Debug, Clone, Default)]
pub struct TrackingClient {
    counters: Arc<Counters>,
    fail_connect: bool,
}

impl TrackingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client whose `connect` always fails.
    pub fn failing_connect() -> Self {
        Self {
            counters: Arc::default(),
            fail_connect: true,
        }
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Returns the messages written through sessions of this client so far.
    pub fn written(&self) -> Vec<Message> {
        self.counters
            .written
            .lock()
            .map(|written| written.clone())
            .unwrap_or_default()
    }
}

impl Client for TrackingClient {
    type Session = TrackingSession;

    async fn connect(&self) -> FerryResult<TrackingSession> {
        if self.fail_connect {
            bail!(
                ErrorKind::DestinationConnectionFailed,
                "Tracking client refused the connection"
            );
        }

        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        Ok(TrackingSession {
            counters: self.counters.clone(),
        })
    }
}

/// Session handed out by [`TrackingClient`].
#[derive(Debug)]
pub struct TrackingSession {
    counters: Arc<Counters>,
}

impl TrackingSession {
    fn record(&self, message: Message) {
        if let Ok(mut written) = self.counters.written.lock() {
            written.push(message);
        }
    }
}

#[async_trait]
impl Closer for TrackingSession {
    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Session for TrackingSession {
    fn closer(&mut self) -> Option<&mut dyn Closer> {
        Some(self)
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteBehavior {
    Succeed,
    Fail,
    Panic,
}

/// Writer for [`TrackingSession`]s with a fixed outcome.
#[derive(Debug, Clone, Copy)]
pub struct TrackingWriter {
    behavior: WriteBehavior,
}

impl TrackingWriter {
    pub fn succeeding() -> Self {
        Self {
            behavior: WriteBehavior::Succeed,
        }
    }

    pub fn failing() -> Self {
        Self {
            behavior: WriteBehavior::Fail,
        }
    }

    pub fn panicking() -> Self {
        Self {
            behavior: WriteBehavior::Panic,
        }
    }
}

impl Writer<TrackingSession> for TrackingWriter {
    fn write(&self, message: Message) -> WriteOp<TrackingSession> {
        let behavior = self.behavior;

        write_op(move |session: &mut TrackingSession| {
            async move {
                match behavior {
                    WriteBehavior::Succeed => {
                        session.record(message);
                        Ok(())
                    }
                    WriteBehavior::Fail => {
                        bail!(ErrorKind::DestinationError, "Tracking writer rejected write")
                    }
                    WriteBehavior::Panic => panic!("tracking writer panicked"),
                }
            }
            .boxed()
        })
    }
}
