use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bail;
use crate::client::{Client, Closer, Session};
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::message::Data;

/// URI writing to the process's standard output.
pub const STDOUT_URI: &str = "stdout://";

const FILE_SCHEME: &str = "file://";

/// Where a file client reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    Stdout,
    File(PathBuf),
}

impl FileTarget {
    /// Parses a `stdout://` or `file:///path` URI.
    pub fn parse(uri: &str) -> FerryResult<Self> {
        if uri == STDOUT_URI {
            return Ok(FileTarget::Stdout);
        }

        match uri.strip_prefix(FILE_SCHEME) {
            Some(path) if !path.is_empty() => Ok(FileTarget::File(PathBuf::from(path))),
            _ => bail!(
                ErrorKind::ConfigError,
                "Unsupported file adaptor URI",
                format!("`{uri}` is neither `{STDOUT_URI}` nor `{FILE_SCHEME}<path>`")
            ),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            FileTarget::Stdout => None,
            FileTarget::File(path) => Some(path),
        }
    }
}

#[derive(Debug)]
enum Output {
    Stdout(BufWriter<Stdout>),
    File(BufWriter<File>),
}

impl Output {
    async fn open(target: &FileTarget) -> FerryResult<Self> {
        match target {
            FileTarget::Stdout => Ok(Output::Stdout(BufWriter::new(tokio::io::stdout()))),
            FileTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|err| {
                        ferry_error!(
                            ErrorKind::DestinationConnectionFailed,
                            "Could not open file",
                            path.display(),
                            source: err
                        )
                    })?;
                debug!(path = %path.display(), "file opened");

                Ok(Output::File(BufWriter::new(file)))
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self {
            Output::Stdout(out) => {
                out.write_all(line).await?;
                out.write_all(b"\n").await
            }
            Output::File(out) => {
                out.write_all(line).await?;
                out.write_all(b"\n").await
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Output::Stdout(out) => out.flush().await,
            Output::File(out) => out.flush().await,
        }
    }
}

/// Client for JSON-lines files and standard output.
///
/// The output is opened on the first connect and shared by every later session.
#[derive(Debug)]
pub struct FileClient {
    target: FileTarget,
    output: Mutex<Option<Arc<Mutex<Output>>>>,
}

impl FileClient {
    pub fn new(target: FileTarget) -> Self {
        Self {
            target,
            output: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &FileTarget {
        &self.target
    }

    /// Returns whether an output is currently held open for new sessions.
    pub async fn is_open(&self) -> bool {
        self.output.lock().await.is_some()
    }

    /// Flushes the shared output and stops handing it to new sessions.
    ///
    /// The file is closed once the last open session is dropped. A later connect opens it
    /// again.
    pub async fn release(&self) {
        let Some(shared) = self.output.lock().await.take() else {
            return;
        };

        if let Err(err) = shared.lock().await.flush().await {
            warn!(error = %err, "failed to flush file output");
        }
        debug!(target = ?self.target, "file output released");
    }
}

impl Client for FileClient {
    type Session = FileSession;

    async fn connect(&self) -> FerryResult<FileSession> {
        let mut output = self.output.lock().await;

        let shared = match output.as_ref() {
            Some(shared) => shared.clone(),
            None => {
                let shared = Arc::new(Mutex::new(Output::open(&self.target).await?));
                *output = Some(shared.clone());
                shared
            }
        };

        Ok(FileSession {
            target: self.target.clone(),
            output: shared,
        })
    }
}

/// Session over the shared output of a [`FileClient`].
#[derive(Debug)]
pub struct FileSession {
    target: FileTarget,
    output: Arc<Mutex<Output>>,
}

impl FileSession {
    pub fn target(&self) -> &FileTarget {
        &self.target
    }

    /// Appends `data` as one JSON line.
    pub async fn write_line(&self, data: &Data) -> FerryResult<()> {
        let line = serde_json::to_vec(data)?;
        self.output.lock().await.write_line(&line).await?;

        Ok(())
    }
}

#[async_trait]
impl Closer for FileSession {
    async fn close(&mut self) {
        if let Err(err) = self.output.lock().await.flush().await {
            warn!(error = %err, "failed to flush file output");
        }
    }
}

impl Session for FileSession {
    fn closer(&mut self) -> Option<&mut dyn Closer> {
        Some(self)
    }
}
