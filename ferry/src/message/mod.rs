//! The unit of data flowing through a pipeline.
//!
//! A [`Message`] describes one mutation observed in a source store: the namespace it belongs to,
//! the [`Operation`] that produced it and the document payload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, FerryResult};
use crate::types::SizeHint;

/// Document payload of a [`Message`].
///
/// Keys keep their insertion order.
pub type Data = serde_json::Map<String, Value>;

/// Key holding the identifier of a normalized document.
pub const NORMALIZED_ID_KEY: &str = "_id";

/// Key holding the identifier of a denormalized document.
pub const DENORMALIZED_ID_KEY: &str = "id";

/// Mutation kind carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Returns the lower-case name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation moving from a source to one or more sinks.
///
/// The operation is fixed at construction. The payload can be modified through
/// [`Message::data_mut`] by transform steps before a writer receives the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    namespace: String,
    operation: Operation,
    data: Data,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message stamped with the current time.
    pub fn new(namespace: impl Into<String>, operation: Operation, data: Data) -> Self {
        Self {
            namespace: namespace.into(),
            operation,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Replaces the timestamp of the message.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns a copy of this message under a different namespace.
    ///
    /// Operation, payload and timestamp are preserved.
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operation: self.operation,
            data: self.data.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Data {
        &mut self.data
    }

    /// Consumes the message, returning its payload.
    pub fn into_data(self) -> Data {
        self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the stringified document identifier.
    ///
    /// Looks up `_id` first and falls back to `id`. String identifiers are returned without
    /// quotes, any other JSON value is rendered as JSON.
    pub fn id(&self) -> Option<String> {
        let value = self
            .data
            .get(NORMALIZED_ID_KEY)
            .or_else(|| self.data.get(DENORMALIZED_ID_KEY))?;

        match value {
            Value::Null => None,
            Value::String(id) => Some(id.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Splits the namespace of this message, see [`split_namespace`].
    pub fn split_namespace(&self) -> FerryResult<(&str, &str)> {
        split_namespace(&self.namespace)
    }
}

impl SizeHint for Message {
    fn size_hint(&self) -> usize {
        self.namespace.len() + self.data.size_hint()
    }
}

/// Splits a `database.collection` namespace on its first `.`.
///
/// Fails with [`ErrorKind::InvalidNamespace`] when there is no `.` or either side is empty.
pub fn split_namespace(namespace: &str) -> FerryResult<(&str, &str)> {
    let Some((database, collection)) = namespace.split_once('.') else {
        bail!(
            ErrorKind::InvalidNamespace,
            "Namespace is not in the database.collection format",
            format!("namespace `{namespace}` does not contain a `.`")
        );
    };

    if database.is_empty() || collection.is_empty() {
        bail!(
            ErrorKind::InvalidNamespace,
            "Namespace is not in the database.collection format",
            format!("namespace `{namespace}` has an empty database or collection")
        );
    }

    Ok((database, collection))
}

/// Moves the `id` key of a document to `_id`.
///
/// Does nothing when `id` is absent.
pub fn normalize_id(data: &mut Data) {
    move_key(data, DENORMALIZED_ID_KEY, NORMALIZED_ID_KEY);
}

/// Moves the `_id` key of a document to `id`.
///
/// Does nothing when `_id` is absent.
pub fn denormalize_id(data: &mut Data) {
    move_key(data, NORMALIZED_ID_KEY, DENORMALIZED_ID_KEY);
}

fn move_key(data: &mut Data, from: &str, to: &str) {
    if let Some(value) = data.shift_remove(from) {
        data.insert(to.to_string(), value);
    }
}
