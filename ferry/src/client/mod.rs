//! The contract between the pipeline and concrete stores.
//!
//! A [`Client`] connects to a store and hands out a [`Session`]. A [`Reader`] turns a namespace
//! filter into a lazy message stream over a session, and a [`Writer`] turns a message into a
//! deferred operation over a session. The [`write`] dispatcher acquires a session, runs one
//! operation and releases the session again.

mod base;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::debug;

pub use base::*;

use crate::error::FerryResult;
use crate::message::Message;

/// Connects through `client`, applies `message` with `writer` and closes the session.
///
/// The session's close capability runs exactly once whether the operation succeeds, fails or
/// panics. A panic is resumed after the session was closed. If connecting fails there is no
/// session, so nothing is closed and the connect error is returned.
pub async fn write<C, W>(client: &C, writer: &W, message: Message) -> FerryResult<()>
where
    C: Client,
    W: Writer<C::Session> + ?Sized,
{
    let mut session = client.connect().await?;

    let result = AssertUnwindSafe(async {
        let op = writer.write(message);
        op(&mut session).await
    })
    .catch_unwind()
    .await;

    if let Some(closer) = session.closer() {
        debug!("closing session after write");
        closer.close().await;
    }

    match result {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
