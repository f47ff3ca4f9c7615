//! Start and listen loops shared by store adaptors.

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use regex::Regex;
use tracing::{debug, info};

use crate::client::{self, Client, NamespaceFilter, Reader, Session, Writer};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{FerryError, FerryResult};
use crate::metrics::{FERRY_MESSAGES_SENT_TOTAL, PATH_LABEL};
use crate::pipe::{AdaptorError, ErrorLevel, Pipe, PipeState};

/// Reads every message `filter` admits through `reader` and sends it into `pipe`.
///
/// Stops reading once the store is exhausted, `shutdown` fires or the pipe is stopped. Errors
/// of single messages are reported on the pipe's error channel, a fatal one ends the loop. The
/// pipe is stopped before returning, which drains every pipe below it.
pub(crate) async fn run_source<C, R>(
    pipe: &Pipe,
    client: &C,
    reader: &R,
    filter: NamespaceFilter,
    shutdown: ShutdownRx,
) -> FerryResult<()>
where
    C: Client,
    R: Reader<C::Session> + ?Sized,
{
    let result = pump(pipe, client, reader, filter, shutdown).await;
    pipe.stop().await;

    result
}

async fn pump<C, R>(
    pipe: &Pipe,
    client: &C,
    reader: &R,
    filter: NamespaceFilter,
    shutdown: ShutdownRx,
) -> FerryResult<()>
where
    C: Client,
    R: Reader<C::Session> + ?Sized,
{
    let mut session = client.connect().await.map_err(FerryError::fatal)?;

    let read = reader.read(filter);
    let mut messages = read(&session, shutdown).map_err(FerryError::fatal)?;

    let mut sent = 0u64;
    let result = loop {
        let Some(next) = messages.next().await else {
            break Ok(());
        };

        let message = match next {
            Ok(message) => message,
            Err(err) if err.is_fatal() => break Err(err),
            Err(err) => {
                pipe.report(AdaptorError::new(ErrorLevel::Error, pipe.path(), err));
                continue;
            }
        };

        match pipe.send(message).await {
            Ok(()) => {
                sent += 1;
                counter!(FERRY_MESSAGES_SENT_TOTAL, PATH_LABEL => pipe.path().to_string())
                    .increment(1);
            }
            Err(_) if matches!(pipe.state(), PipeState::Stopping | PipeState::Stopped) => {
                debug!(path = %pipe.path(), "pipe stopped, source stops reading");
                break Ok(());
            }
            Err(err) => pipe.report(AdaptorError::new(ErrorLevel::Warning, pipe.path(), err)),
        }
    };
    drop(messages);

    if let Some(closer) = session.closer() {
        closer.close().await;
    }

    info!(path = %pipe.path(), sent, "source finished reading");

    result
}

/// Listens on `pipe` and writes every message matching `match_pattern` through `writer`.
///
/// Every write acquires and releases its own session. Written messages are forwarded to the
/// pipe's children.
pub(crate) async fn run_sink<C, W>(
    pipe: &Pipe,
    client: Arc<C>,
    writer: Arc<W>,
    match_pattern: &Regex,
) -> FerryResult<()>
where
    C: Client + 'static,
    W: Writer<C::Session> + 'static,
{
    info!(path = %pipe.path(), pattern = %match_pattern, "sink listening");

    pipe.listen(
        move |message| {
            let client = client.clone();
            let writer = writer.clone();
            async move {
                client::write(client.as_ref(), writer.as_ref(), message.clone()).await?;
                Ok(Some(message))
            }
        },
        match_pattern,
    )
    .await
}
