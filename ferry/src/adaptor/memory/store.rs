use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, FerryResult};
use crate::message::{DENORMALIZED_ID_KEY, Data, Operation};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// A mutation applied to a [`MemoryStore`] table.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub database: String,
    pub table: String,
    pub operation: Operation,
    /// The document after the change, or the deleted document's key for deletes.
    pub data: Data,
}

type Table = BTreeMap<String, Data>;

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<(String, String), Table>,
}

/// In-process document store with a change feed.
///
/// Documents are keyed by their `id` field and kept in key order. Every applied mutation is
/// published to subscribers of [`MemoryStore::subscribe`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<Change>,
    closed_sessions: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
            closed_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Applies one mutation to `database.table` and publishes it.
    ///
    /// Inserts without an `id` get a generated one. Inserts of an existing `id` replace the
    /// document, updates merge into it or insert it if it is missing. Updates and deletes need
    /// an `id`.
    pub async fn apply(
        &self,
        database: &str,
        table: &str,
        operation: Operation,
        mut data: Data,
    ) -> FerryResult<()> {
        let mut inner = self.inner.lock().await;
        let documents = inner
            .tables
            .entry((database.to_string(), table.to_string()))
            .or_default();

        let id = match (document_id(&data), operation) {
            (Some(id), _) => id,
            (None, Operation::Insert) => {
                let id = Uuid::new_v4().to_string();
                data.insert(DENORMALIZED_ID_KEY.to_string(), Value::String(id.clone()));
                id
            }
            (None, operation) => {
                bail!(
                    ErrorKind::InvalidData,
                    "Document has no id",
                    format!("{operation} on `{database}.{table}` needs an `{DENORMALIZED_ID_KEY}`")
                );
            }
        };

        let changed = match operation {
            Operation::Insert => {
                documents.insert(id, data.clone());
                data
            }
            Operation::Update => {
                let document = documents.entry(id).or_default();
                for (key, value) in data {
                    document.insert(key, value);
                }
                document.clone()
            }
            Operation::Delete => {
                documents.remove(&id);
                data
            }
        };

        // Published under the lock so subscribers see changes in apply order.
        let _ = self.changes.send(Change {
            database: database.to_string(),
            table: table.to_string(),
            operation,
            data: changed,
        });

        Ok(())
    }

    /// Returns the documents of `database.table` in key order.
    pub async fn documents(&self, database: &str, table: &str) -> Vec<Data> {
        let inner = self.inner.lock().await;

        inner
            .tables
            .get(&(database.to_string(), table.to_string()))
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the names of the tables of `database`.
    pub async fn tables(&self, database: &str) -> Vec<String> {
        let inner = self.inner.lock().await;

        inner
            .tables
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, table)| table.clone())
            .collect()
    }

    /// Returns every document of the tables of `database` accepted by `filter`, together with
    /// a change feed that starts right after them.
    pub async fn snapshot<F>(
        &self,
        database: &str,
        filter: F,
    ) -> (Vec<(String, Data)>, broadcast::Receiver<Change>)
    where
        F: Fn(&str) -> bool,
    {
        let inner = self.inner.lock().await;
        let changes = self.changes.subscribe();

        let documents = inner
            .tables
            .iter()
            .filter(|((db, table), _)| db == database && filter(table))
            .flat_map(|((_, table), documents)| {
                documents
                    .values()
                    .map(move |document| (table.clone(), document.clone()))
            })
            .collect();

        (documents, changes)
    }

    /// Subscribes to every change applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Returns how many sessions over this store were closed.
    pub fn closed_sessions(&self) -> usize {
        self.closed_sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn session_closed(&self) {
        self.closed_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn document_id(data: &Data) -> Option<String> {
    match data.get(DENORMALIZED_ID_KEY)? {
        Value::Null => None,
        Value::String(id) => Some(id.clone()),
        other => Some(other.to_string()),
    }
}
