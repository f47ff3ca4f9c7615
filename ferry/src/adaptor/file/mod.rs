//! JSON-lines files and standard output.
//!
//! As a source the adaptor emits one insert per line of a `file://` URI. As a sink it appends
//! the payload of every message as one line, to a file or to `stdout://`.

mod client;
mod reader;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

pub use client::{FileClient, FileSession, FileTarget, STDOUT_URI};
pub use reader::{FILE_DATABASE, FileReader, file_namespace};
pub use writer::FileWriter;

use crate::adaptor::pump::{run_sink, run_source};
use crate::adaptor::{Adaptor, AdaptorConfig, MATCH_ALL, compile_namespace};
use crate::client::{Client, namespace_filter};
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::FerryResult;
use crate::pipe::Pipe;

const DESCRIPTION: &str = "an adaptor that reads / writes files";

const SAMPLE_CONFIG: &str = r#"- name: stdout
  type: file
  options:
    uri: stdout://"#;

fn default_uri() -> String {
    STDOUT_URI.to_string()
}

/// Settings of a file node.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    /// Restricts a sink to the collections matched by this namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

pub struct FileAdaptor {
    path: String,
    pipe: Pipe,
    client: Arc<FileClient>,
    collections: Regex,
    done: ShutdownTx,
}

impl FileAdaptor {
    pub fn new(pipe: Pipe, path: impl Into<String>, config: &AdaptorConfig) -> FerryResult<Self> {
        let config: FileConfig = config.construct()?;
        let target = FileTarget::parse(&config.uri)?;
        let collections = match &config.namespace {
            Some(namespace) => compile_namespace(namespace)?.1,
            None => Regex::new(MATCH_ALL)?,
        };
        let (done, _) = create_shutdown_channel();

        Ok(Self {
            path: path.into(),
            pipe,
            client: Arc::new(FileClient::new(target)),
            collections,
            done,
        })
    }
}

#[async_trait]
impl Adaptor for FileAdaptor {
    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    async fn connect(&self) -> FerryResult<()> {
        self.client.connect().await.map(|_| ())
    }

    async fn start(&self) -> FerryResult<()> {
        info!(path = %self.path, target = ?self.client.target(), "file source starting");

        run_source(
            &self.pipe,
            self.client.as_ref(),
            &FileReader,
            namespace_filter(|_| true),
            self.done.subscribe(),
        )
        .await
    }

    async fn listen(&self) -> FerryResult<()> {
        run_sink(
            &self.pipe,
            self.client.clone(),
            Arc::new(FileWriter),
            &self.collections,
        )
        .await
    }

    async fn stop(&self) -> FerryResult<()> {
        self.done.shutdown();
        self.pipe.stop().await;
        self.client.release().await;

        info!(path = %self.path, "file adaptor stopped");

        Ok(())
    }
}
