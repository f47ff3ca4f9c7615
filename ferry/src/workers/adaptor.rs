use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info, info_span};

use crate::adaptor::Adaptor;
use crate::bail;
use crate::error::{ErrorKind, FerryError, FerryResult};
use crate::ferry_error;
use crate::pipe::Pipe;
use crate::workers::base::{Worker, WorkerHandle, WorkerType};

/// Worker running [`Adaptor::start`] or [`Adaptor::listen`] on its own task.
pub struct AdaptorWorker {
    path: String,
    worker_type: WorkerType,
    adaptor: Arc<dyn Adaptor>,
}

impl AdaptorWorker {
    pub fn new(path: impl Into<String>, worker_type: WorkerType, adaptor: Arc<dyn Adaptor>) -> Self {
        Self {
            path: path.into(),
            worker_type,
            adaptor,
        }
    }
}

impl Worker<AdaptorWorkerHandle> for AdaptorWorker {
    /// Spawns the worker.
    ///
    /// Must be called within a tokio runtime.
    fn start(self) -> AdaptorWorkerHandle {
        let span = info_span!("adaptor_worker", path = %self.path, worker_type = %self.worker_type);
        let path = self.path.clone();
        let worker_type = self.worker_type;

        let handle = tokio::spawn(
            async move {
                info!("adaptor worker started");

                let result = match self.worker_type {
                    WorkerType::Source => self.adaptor.start().await,
                    WorkerType::Sink => self.adaptor.listen().await,
                };

                match &result {
                    Ok(()) => info!("adaptor worker completed"),
                    Err(err) => error!(error = %err, "adaptor worker failed"),
                }

                result
            }
            .instrument(span),
        );

        AdaptorWorkerHandle {
            path,
            worker_type,
            handle: Some(handle),
        }
    }
}

/// Handle of a spawned [`AdaptorWorker`].
#[derive(Debug)]
pub struct AdaptorWorkerHandle {
    path: String,
    worker_type: WorkerType,
    handle: Option<JoinHandle<FerryResult<()>>>,
}

impl AdaptorWorkerHandle {
    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// Waits until `pipe` has left [`PipeState::Created`](crate::pipe::PipeState::Created).
    ///
    /// Fails with the worker's error if the worker ends while the pipe is still created, or
    /// with [`ErrorKind::InvalidState`] if it ended successfully without ever listening.
    pub async fn wait_until_listening(&mut self, pipe: &Pipe) -> FerryResult<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };

        let result = tokio::select! {
            biased;

            _ = pipe.wait_until_listening() => return Ok(()),
            result = handle => result,
        };
        self.handle = None;

        result.map_err(|err| self.join_error(err))??;

        bail!(
            ErrorKind::InvalidState,
            "Adaptor worker finished without listening",
            format!("{} worker `{}`", self.worker_type, self.path)
        );
    }

    fn join_error(&self, err: JoinError) -> FerryError {
        if err.is_cancelled() {
            ferry_error!(
                ErrorKind::WorkerCancelled,
                "Adaptor worker was cancelled",
                format!("{} worker `{}`: {err}", self.worker_type, self.path)
            )
        } else {
            ferry_error!(
                ErrorKind::AdaptorPanic,
                "Adaptor worker panicked",
                format!("{} worker `{}`: {err}", self.worker_type, self.path)
            )
        }
    }
}

impl WorkerHandle for AdaptorWorkerHandle {
    fn path(&self) -> &str {
        &self.path
    }

    async fn wait(mut self) -> FerryResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| self.join_error(err))??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::pipe::create_error_channel;

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct ScriptedAdaptor {
        behavior: Behavior,
    }

    #[async_trait]
    impl Adaptor for ScriptedAdaptor {
        fn description(&self) -> &'static str {
            "scripted"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        async fn connect(&self) -> FerryResult<()> {
            Ok(())
        }

        async fn listen(&self) -> FerryResult<()> {
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => bail!(ErrorKind::DestinationError, "Scripted failure"),
                Behavior::Panic => panic!("scripted panic"),
            }
        }

        async fn stop(&self) -> FerryResult<()> {
            Ok(())
        }
    }

    fn start(worker_type: WorkerType, behavior: Behavior) -> AdaptorWorkerHandle {
        AdaptorWorker::new("node", worker_type, Arc::new(ScriptedAdaptor { behavior })).start()
    }

    #[tokio::test]
    async fn wait_returns_adaptor_result() {
        start(WorkerType::Sink, Behavior::Succeed).wait().await.unwrap();

        let err = start(WorkerType::Sink, Behavior::Fail).wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationError);

        let err = start(WorkerType::Source, Behavior::Succeed)
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn wait_until_listening_surfaces_early_exit() {
        let (errors, _errors_rx) = create_error_channel();
        let pipe = Pipe::new("node", errors);

        let mut handle = start(WorkerType::Sink, Behavior::Fail);
        let err = handle.wait_until_listening(&pipe).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationError);
        handle.wait().await.unwrap();

        let mut handle = start(WorkerType::Sink, Behavior::Panic);
        let err = handle.wait_until_listening(&pipe).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdaptorPanic);

        let mut handle = start(WorkerType::Sink, Behavior::Succeed);
        let err = handle.wait_until_listening(&pipe).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        pipe.stop().await;
        let mut handle = start(WorkerType::Sink, Behavior::Succeed);
        handle.wait_until_listening(&pipe).await.unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn panic_becomes_an_error() {
        let handle = start(WorkerType::Sink, Behavior::Panic);
        assert_eq!(handle.path(), "node");

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdaptorPanic);
        assert!(err.detail().unwrap().contains("sink worker `node`"));
    }
}
