//! In-process document store.
//!
//! The memory adaptor reads and writes the tables of one database of a [`MemoryStore`]
//! shared through the adaptor registry. With `tail` set, a source keeps following the store's
//! change feed after copying the existing documents, until it is stopped.

mod client;
mod reader;
mod store;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

pub use client::{MemoryClient, MemorySession};
pub use reader::MemoryReader;
pub use store::{Change, MemoryStore};
pub use writer::MemoryWriter;

use crate::adaptor::pump::{run_sink, run_source};
use crate::adaptor::{Adaptor, AdaptorConfig, compile_namespace};
use crate::bail;
use crate::client::namespace_filter;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, FerryResult};
use crate::pipe::Pipe;

const MEMORY_SCHEME: &str = "memory://";

const DESCRIPTION: &str = "an in-process document store with a change feed";

const SAMPLE_CONFIG: &str = r#"- name: source
  type: memory
  options:
    uri: memory://
    namespace: shop./.*/
    tail: false"#;

/// Settings of a memory node.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    pub uri: String,
    pub namespace: String,
    #[serde(default)]
    pub tail: bool,
}

pub struct MemoryAdaptor {
    path: String,
    pipe: Pipe,
    client: Arc<MemoryClient>,
    database: String,
    tables: Regex,
    tail: bool,
    done: ShutdownTx,
}

impl MemoryAdaptor {
    pub fn new(
        pipe: Pipe,
        path: impl Into<String>,
        config: &AdaptorConfig,
        store: MemoryStore,
    ) -> FerryResult<Self> {
        let config: MemoryConfig = config.construct()?;
        if !config.uri.starts_with(MEMORY_SCHEME) {
            bail!(
                ErrorKind::ConfigError,
                "Unsupported memory adaptor URI",
                format!("`{}` does not start with `{MEMORY_SCHEME}`", config.uri)
            );
        }

        let (database, tables) = compile_namespace(&config.namespace)?;
        let (done, _) = create_shutdown_channel();

        Ok(Self {
            path: path.into(),
            pipe,
            client: Arc::new(MemoryClient::new(store)),
            database,
            tables,
            tail: config.tail,
            done,
        })
    }
}

#[async_trait]
impl Adaptor for MemoryAdaptor {
    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    async fn connect(&self) -> FerryResult<()> {
        Ok(())
    }

    async fn start(&self) -> FerryResult<()> {
        info!(
            path = %self.path,
            database = %self.database,
            tables = %self.tables,
            tail = self.tail,
            "memory source starting"
        );

        let tables = self.tables.clone();
        run_source(
            &self.pipe,
            self.client.as_ref(),
            &MemoryReader::new(&self.database, self.tail),
            namespace_filter(move |table| tables.is_match(table)),
            self.done.subscribe(),
        )
        .await
    }

    async fn listen(&self) -> FerryResult<()> {
        run_sink(
            &self.pipe,
            self.client.clone(),
            Arc::new(MemoryWriter::new(&self.database)),
            &self.tables,
        )
        .await
    }

    async fn stop(&self) -> FerryResult<()> {
        self.done.shutdown();
        self.pipe.stop().await;

        info!(path = %self.path, "memory adaptor stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adaptor::MATCH_ALL;
    use crate::message::{Data, Message, Operation};
    use crate::pipe::{PipeState, create_error_channel};

    fn options(value: serde_json::Value) -> AdaptorConfig {
        let Some(map) = value.as_object().cloned() else {
            panic!("object expected");
        };
        AdaptorConfig::new(map)
    }

    fn data(value: serde_json::Value) -> Data {
        let Some(map) = value.as_object().cloned() else {
            panic!("object expected");
        };
        map
    }

    #[tokio::test]
    async fn requires_uri_and_namespace() {
        let (errors, _errors_rx) = create_error_channel();
        let store = MemoryStore::new();

        for config in [
            json!({"namespace": "shop.orders"}),
            json!({"uri": "memory://"}),
            json!({"uri": "mongodb://", "namespace": "shop.orders"}),
            json!({"uri": "memory://", "namespace": "orders"}),
        ] {
            let result = MemoryAdaptor::new(
                Pipe::new("source", errors.clone()),
                "source",
                &options(config),
                store.clone(),
            );
            assert!(result.err().unwrap().is_fatal());
        }
    }

    #[tokio::test]
    async fn sink_writes_only_its_own_tables() {
        let (errors, _errors_rx) = create_error_channel();
        let store = MemoryStore::new();

        let root = Pipe::new("source", errors);
        let child = root.child("source/sink", MATCH_ALL).unwrap();
        let sink = Arc::new(
            MemoryAdaptor::new(
                child.clone(),
                "source/sink",
                &options(json!({"uri": "memory://", "namespace": "copy.orders"})),
                store.clone(),
            )
            .unwrap(),
        );

        let listening = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.listen().await })
        };
        child.wait_until_listening().await;

        root.send(Message::new(
            "shop.users",
            Operation::Insert,
            data(json!({"_id": 7})),
        ))
        .await
        .unwrap();
        root.send(Message::new(
            "shop.orders",
            Operation::Insert,
            data(json!({"_id": 8})),
        ))
        .await
        .unwrap();
        root.stop().await;
        listening.await.unwrap().unwrap();

        assert_eq!(store.tables("copy").await, vec!["orders".to_string()]);
        assert_eq!(
            store.documents("copy", "orders").await,
            vec![data(json!({"id": 8}))]
        );
    }

    #[tokio::test]
    async fn tailing_source_runs_until_stopped() {
        let (errors, _errors_rx) = create_error_channel();
        let store = MemoryStore::new();
        store
            .apply("shop", "orders", Operation::Insert, data(json!({"id": 1})))
            .await
            .unwrap();

        let root = Pipe::new("source", errors);
        let child = root.child("source/sink", MATCH_ALL).unwrap();
        let source = Arc::new(
            MemoryAdaptor::new(
                root.clone(),
                "source",
                &options(json!({"uri": "memory://", "namespace": "shop./.*/", "tail": true})),
                store.clone(),
            )
            .unwrap(),
        );
        let sink = Arc::new(
            MemoryAdaptor::new(
                child.clone(),
                "source/sink",
                &options(json!({"uri": "memory://", "namespace": "copy./.*/"})),
                store.clone(),
            )
            .unwrap(),
        );

        let listening = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.listen().await })
        };
        child.wait_until_listening().await;
        let mut changes = store.subscribe();
        let started = {
            let source = source.clone();
            tokio::spawn(async move { source.start().await })
        };

        store
            .apply("shop", "orders", Operation::Insert, data(json!({"id": 2})))
            .await
            .unwrap();
        let mut copied = 0;
        while copied < 2 {
            let change = changes.recv().await.unwrap();
            if change.database == "copy" {
                copied += 1;
            }
        }

        source.stop().await.unwrap();
        started.await.unwrap().unwrap();
        listening.await.unwrap().unwrap();

        assert_eq!(root.state(), PipeState::Stopped);
        assert_eq!(child.state(), PipeState::Stopped);
        assert_eq!(
            store.documents("copy", "orders").await,
            vec![data(json!({"id": 1})), data(json!({"id": 2}))]
        );
    }
}
