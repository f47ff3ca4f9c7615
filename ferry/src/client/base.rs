use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::FerryResult;
use crate::message::Message;

/// Predicate deciding whether a namespace should be read.
pub type NamespaceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Lazy stream of messages produced by a [`Reader`].
pub type MessageStream = BoxStream<'static, FerryResult<Message>>;

/// Deferred read bound to a session once one is available.
///
/// The returned stream must do no work before it is first polled and must end once the given
/// shutdown receiver fires.
pub type ReadFn<S> = Box<dyn Fn(&S, ShutdownRx) -> FerryResult<MessageStream> + Send + Sync>;

/// Deferred write bound to a session once one is available.
pub type WriteOp<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FerryResult<()>> + Send>;

/// Capability of a session to release its underlying resources.
#[async_trait]
pub trait Closer: Send {
    /// Flushes any buffered work and releases the session's resources.
    async fn close(&mut self);
}

/// A live handle to a concrete store, obtained from a [`Client`].
///
/// Sessions that hold resources expose a [`Closer`] through [`Session::closer`]. Whoever
/// obtains a session is responsible for invoking it once the session is no longer used.
pub trait Session: Send + 'static {
    /// Returns the close capability of this session, if it has one.
    fn closer(&mut self) -> Option<&mut dyn Closer> {
        None
    }
}

/// Connects to a concrete store.
///
/// A client's configuration is fixed after construction. Implementations may hand out a cached
/// live connection or create fresh state on every call, so callers must not assume either.
pub trait Client: Send + Sync {
    type Session: Session;

    /// Returns a session connected to the store.
    fn connect(&self) -> impl Future<Output = FerryResult<Self::Session>> + Send;
}

/// Produces deferred reads for a store.
pub trait Reader<S>: Send + Sync {
    /// Returns a read function that yields every message whose namespace passes `filter`.
    fn read(&self, filter: NamespaceFilter) -> ReadFn<S>;
}

/// Produces deferred writes for a store.
pub trait Writer<S>: Send + Sync {
    /// Returns the session-bound operation that applies `message`.
    fn write(&self, message: Message) -> WriteOp<S>;
}

/// Builds a [`WriteOp`] from a closure, pinning down its higher-ranked signature.
pub fn write_op<S, F>(op: F) -> WriteOp<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FerryResult<()>> + Send + 'static,
{
    Box::new(op)
}

/// Builds a [`NamespaceFilter`] from a closure.
pub fn namespace_filter<F>(filter: F) -> NamespaceFilter
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(filter)
}
