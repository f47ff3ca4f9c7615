use std::fmt;
use std::future::Future;

use crate::error::FerryResult;

/// Role a worker plays in a pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// Runs the start loop of the root adaptor.
    Source,
    /// Runs the listen loop of an adaptor below the root.
    Sink,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Source => f.write_str("source"),
            WorkerType::Sink => f.write_str("sink"),
        }
    }
}

/// Trait for background workers of a pipeline.
///
/// Starting a worker spawns its task and returns a handle to wait for it.
pub trait Worker<H>
where
    H: WorkerHandle,
{
    fn start(self) -> H;
}

/// Handle for waiting on a running worker.
pub trait WorkerHandle {
    /// Returns the pipe path of the adaptor the worker runs.
    fn path(&self) -> &str;

    /// Waits for the worker to complete and returns its result.
    ///
    /// A worker that panicked or was cancelled yields an error.
    fn wait(self) -> impl Future<Output = FerryResult<()>> + Send;
}
