use futures::{Stream, StreamExt, future, stream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::adaptor::memory::client::MemorySession;
use crate::adaptor::memory::store::{Change, MemoryStore};
use crate::client::{NamespaceFilter, ReadFn, Reader};
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::stream::ShutdownStream;
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::message::{Data, Message, Operation, normalize_id};

/// Reads the tables of one database, optionally following their changes afterwards.
///
/// The filter passed to [`Reader::read`] receives table names.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    database: String,
    tail: bool,
}

impl MemoryReader {
    pub fn new(database: impl Into<String>, tail: bool) -> Self {
        Self {
            database: database.into(),
            tail,
        }
    }
}

impl Reader<MemorySession> for MemoryReader {
    fn read(&self, filter: NamespaceFilter) -> ReadFn<MemorySession> {
        let database = self.database.clone();
        let tail = self.tail;

        Box::new(move |session: &MemorySession, shutdown: ShutdownRx| {
            let messages = read_tables(
                session.store().clone(),
                database.clone(),
                filter.clone(),
                tail,
            );

            Ok(ShutdownStream::wrap(messages, shutdown).boxed())
        })
    }
}

fn read_tables(
    store: MemoryStore,
    database: String,
    filter: NamespaceFilter,
    tail: bool,
) -> impl Stream<Item = FerryResult<Message>> + Send + 'static {
    stream::once(async move {
        let (documents, changes) = store.snapshot(&database, |table| filter(table)).await;

        let copied = stream::iter(documents.into_iter().map({
            let database = database.clone();
            move |(table, data)| Ok(message(&database, &table, Operation::Insert, data))
        }));

        if tail {
            copied.chain(follow(changes, database, filter)).boxed()
        } else {
            copied.boxed()
        }
    })
    .flatten()
}

fn follow(
    changes: broadcast::Receiver<Change>,
    database: String,
    filter: NamespaceFilter,
) -> impl Stream<Item = FerryResult<Message>> + Send + 'static {
    stream::unfold(changes, |mut changes| async move {
        match changes.recv().await {
            Ok(change) => Some((Some(Ok(change)), changes)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "memory change feed lagged behind");
                let err = ferry_error!(
                    ErrorKind::SourceError,
                    "Changes were dropped before they could be read",
                    format!("{skipped} changes skipped")
                );
                Some((Some(Err(err)), changes))
            }
            Err(RecvError::Closed) => None,
        }
    })
    .filter_map(move |change| {
        let item = match change {
            Some(Ok(change)) if change.database == database && filter(&change.table) => Some(Ok(
                message(&change.database, &change.table, change.operation, change.data),
            )),
            Some(Ok(_)) | None => None,
            Some(Err(err)) => Some(Err(err)),
        };
        future::ready(item)
    })
}

fn message(database: &str, table: &str, operation: Operation, mut data: Data) -> Message {
    normalize_id(&mut data);
    Message::new(format!("{database}.{table}"), operation, data)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adaptor::memory::client::MemoryClient;
    use crate::client::{Client, namespace_filter};
    use crate::concurrency::shutdown::create_shutdown_channel;

    fn data(value: serde_json::Value) -> Data {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        for (table, id) in [("orders", 1), ("orders", 2), ("users", 3)] {
            store
                .apply("shop", table, Operation::Insert, data(json!({"id": id})))
                .await
                .unwrap();
        }
        store
            .apply("other", "orders", Operation::Insert, data(json!({"id": 4})))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn copies_matching_tables() {
        let store = seeded_store().await;
        let session = MemoryClient::new(store).connect().await.unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = MemoryReader::new("shop", false).read(namespace_filter(|t| t == "orders"));
        let messages: Vec<Message> = read(&session, shutdown_rx)
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.namespace() == "shop.orders"));
        assert_eq!(messages[0].data(), &data(json!({"_id": 1})));
        assert_eq!(messages[1].id().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn tail_follows_changes_until_shutdown() {
        let store = seeded_store().await;
        let session = MemoryClient::new(store.clone()).connect().await.unwrap();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = MemoryReader::new("shop", true).read(namespace_filter(|t| t == "orders"));
        let mut messages = read(&session, shutdown_rx).unwrap();

        assert_eq!(messages.next().await.unwrap().unwrap().id().as_deref(), Some("1"));
        assert_eq!(messages.next().await.unwrap().unwrap().id().as_deref(), Some("2"));

        store
            .apply("shop", "users", Operation::Insert, data(json!({"id": 5})))
            .await
            .unwrap();
        store
            .apply("shop", "orders", Operation::Delete, data(json!({"id": 1})))
            .await
            .unwrap();

        let deleted = messages.next().await.unwrap().unwrap();
        assert_eq!(deleted.operation(), Operation::Delete);
        assert_eq!(deleted.id().as_deref(), Some("1"));

        shutdown_tx.shutdown();
        assert!(messages.next().await.is_none());
    }
}
