use core::pin::Pin;
use core::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Future, FutureExt, Stream};
use pin_project_lite::pin_project;
use tracing::debug;

use crate::concurrency::shutdown::ShutdownRx;

pin_project! {
    /// A stream adapter that ends as soon as the shutdown signal fires.
    ///
    /// The signal is checked before every element of the inner stream is polled, so no further
    /// element is produced once shutdown was requested.
    #[must_use = "streams do nothing unless polled"]
    pub struct ShutdownStream<S> {
        #[pin]
        stream: S,
        shutdown: BoxFuture<'static, ()>,
        stopped: bool,
    }
}

impl<S: Stream> ShutdownStream<S> {
    /// Creates a new [`ShutdownStream`] wrapping `stream`.
    pub fn wrap(stream: S, mut shutdown_rx: ShutdownRx) -> Self {
        let shutdown = async move { shutdown_rx.wait().await }.boxed();

        Self {
            stream,
            shutdown,
            stopped: false,
        }
    }
}

impl<S: Stream> Stream for ShutdownStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.stopped {
            return Poll::Ready(None);
        }

        // Shutdown takes priority over any element the inner stream may have ready.
        if this.shutdown.as_mut().poll(cx).is_ready() {
            debug!("stream stopped due to shutdown signal");
            *this.stopped = true;
            return Poll::Ready(None);
        }

        let next = this.stream.poll_next(cx);
        if let Poll::Ready(None) = next {
            *this.stopped = true;
        }

        next
    }
}
