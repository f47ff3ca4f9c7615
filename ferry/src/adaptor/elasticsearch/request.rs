use serde::Serialize;
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::message::{Data, Message, NORMALIZED_ID_KEY, Operation};
use crate::types::SizeHint;

/// Serialized size of the action line surrounding a document, without the names it contains.
const ACTION_OVERHEAD: usize = 48;

#[derive(Serialize)]
struct UpdateSource<'a> {
    doc: &'a Data,
    doc_as_upsert: bool,
}

/// One action of an Elasticsearch `_bulk` request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkRequest {
    Index {
        index: String,
        doc_type: String,
        id: Option<String>,
        document: Data,
    },
    Update {
        index: String,
        doc_type: String,
        id: String,
        document: Data,
    },
    Delete {
        index: String,
        doc_type: String,
        id: String,
    },
}

impl BulkRequest {
    /// Maps `message` to a bulk action.
    ///
    /// The index is `index` if given and the namespace database otherwise, the type is the
    /// namespace collection. The `_id` of the document becomes the action's id and is removed
    /// from the document. Updates and deletes need an `_id`.
    pub fn from_message(index: Option<&str>, message: Message) -> FerryResult<Self> {
        let (database, collection) = message.split_namespace().map_err(|err| {
            ferry_error!(
                ErrorKind::InvalidData,
                "Message namespace names no type",
                message.namespace(),
                source: err
            )
        })?;
        let index = index.unwrap_or(database).to_string();
        let doc_type = collection.to_string();

        let operation = message.operation();
        let id = message.id();
        let mut document = message.into_data();
        document.shift_remove(NORMALIZED_ID_KEY);

        let request = match (operation, id) {
            (Operation::Insert, id) => BulkRequest::Index {
                index,
                doc_type,
                id,
                document,
            },
            (Operation::Update, Some(id)) => BulkRequest::Update {
                index,
                doc_type,
                id,
                document,
            },
            (Operation::Delete, Some(id)) => BulkRequest::Delete {
                index,
                doc_type,
                id,
            },
            (operation, None) => {
                bail!(
                    ErrorKind::InvalidData,
                    "Document has no id",
                    format!("{operation} into `{index}/{doc_type}` needs an `{NORMALIZED_ID_KEY}`")
                );
            }
        };

        Ok(request)
    }

    pub fn action(&self) -> &'static str {
        match self {
            BulkRequest::Index { .. } => "index",
            BulkRequest::Update { .. } => "update",
            BulkRequest::Delete { .. } => "delete",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            BulkRequest::Index { id, .. } => id.as_deref(),
            BulkRequest::Update { id, .. } | BulkRequest::Delete { id, .. } => Some(id),
        }
    }

    /// Appends the action line and, unless it is a delete, the source line to `body`.
    pub fn write_ndjson(&self, body: &mut Vec<u8>) -> FerryResult<()> {
        let (index, doc_type) = match self {
            BulkRequest::Index {
                index, doc_type, ..
            }
            | BulkRequest::Update {
                index, doc_type, ..
            }
            | BulkRequest::Delete {
                index, doc_type, ..
            } => (index, doc_type),
        };

        let mut metadata = Map::new();
        metadata.insert("_index".to_string(), Value::String(index.clone()));
        metadata.insert("_type".to_string(), Value::String(doc_type.clone()));
        if let Some(id) = self.id() {
            metadata.insert("_id".to_string(), Value::String(id.to_string()));
        }

        let mut action = Map::new();
        action.insert(self.action().to_string(), Value::Object(metadata));
        serde_json::to_writer(&mut *body, &action)?;
        body.push(b'\n');

        match self {
            BulkRequest::Index { document, .. } => {
                serde_json::to_writer(&mut *body, document)?;
                body.push(b'\n');
            }
            BulkRequest::Update { document, .. } => {
                let source = UpdateSource {
                    doc: document,
                    doc_as_upsert: true,
                };
                serde_json::to_writer(&mut *body, &source)?;
                body.push(b'\n');
            }
            BulkRequest::Delete { .. } => {}
        }

        Ok(())
    }
}

impl SizeHint for BulkRequest {
    fn size_hint(&self) -> usize {
        match self {
            BulkRequest::Index {
                index,
                doc_type,
                id,
                document,
            } => ACTION_OVERHEAD + index.len() + doc_type.len() + id.size_hint() + document.size_hint(),
            BulkRequest::Update {
                index,
                doc_type,
                id,
                document,
            } => ACTION_OVERHEAD + index.len() + doc_type.len() + id.len() + document.size_hint(),
            BulkRequest::Delete {
                index,
                doc_type,
                id,
            } => ACTION_OVERHEAD + index.len() + doc_type.len() + id.len(),
        }
    }
}

/// Serializes `requests` into one `_bulk` body.
pub fn bulk_body(requests: &[BulkRequest]) -> FerryResult<Vec<u8>> {
    let mut body = Vec::with_capacity(requests.iter().map(SizeHint::size_hint).sum());
    for request in requests {
        request.write_ndjson(&mut body)?;
    }

    Ok(body)
}
