use futures::FutureExt;

use crate::adaptor::memory::client::MemorySession;
use crate::bail;
use crate::client::{WriteOp, Writer, write_op};
use crate::error::ErrorKind;
use crate::message::{Message, denormalize_id};

/// Applies every message to the table named by its collection, in a fixed database.
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    database: String,
}

impl MemoryWriter {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }
}

impl Writer<MemorySession> for MemoryWriter {
    fn write(&self, message: Message) -> WriteOp<MemorySession> {
        let database = self.database.clone();

        write_op(move |session: &mut MemorySession| {
            async move {
                let table = match message.split_namespace() {
                    Ok((_, table)) => table.to_string(),
                    Err(err) => {
                        bail!(
                            ErrorKind::InvalidData,
                            "Message namespace names no table",
                            message.namespace(),
                            source: err
                        );
                    }
                };
                let operation = message.operation();

                let mut data = message.into_data();
                denormalize_id(&mut data);

                session.store().apply(&database, &table, operation, data).await
            }
            .boxed()
        })
    }
}
