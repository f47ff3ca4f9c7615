use futures::FutureExt;

use crate::adaptor::file::client::FileSession;
use crate::client::{WriteOp, Writer, write_op};
use crate::message::Message;

/// Appends the payload of every message as one JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileWriter;

impl Writer<FileSession> for FileWriter {
    fn write(&self, message: Message) -> WriteOp<FileSession> {
        write_op(move |session: &mut FileSession| {
            async move { session.write_line(message.data()).await }.boxed()
        })
    }
}
