use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt, future, stream};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::adaptor::file::client::FileSession;
use crate::bail;
use crate::client::{MessageStream, NamespaceFilter, ReadFn, Reader};
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::stream::ShutdownStream;
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::message::{Data, Message, Operation, normalize_id};

/// Database part of the namespaces of messages read from files.
pub const FILE_DATABASE: &str = "file";

/// Reads a JSON-lines file, one insert per non-empty line.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileReader;

impl Reader<FileSession> for FileReader {
    fn read(&self, filter: NamespaceFilter) -> ReadFn<FileSession> {
        Box::new(move |session: &FileSession, shutdown: ShutdownRx| {
            let Some(path) = session.target().path() else {
                bail!(
                    ErrorKind::ConfigError,
                    "Cannot read from standard output",
                    "a file source needs a `file://` URI"
                );
            };

            let namespace = file_namespace(path);
            if !filter(&namespace) {
                let messages: MessageStream = stream::empty().boxed();
                return Ok(messages);
            }

            let messages = read_lines(path.to_path_buf(), namespace);
            Ok(ShutdownStream::wrap(messages, shutdown).boxed())
        })
    }
}

/// Returns the namespace messages read from `path` carry.
pub fn file_namespace(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    format!("{FILE_DATABASE}.{name}")
}

fn read_lines(
    path: PathBuf,
    namespace: String,
) -> impl Stream<Item = FerryResult<Message>> + Send + 'static {
    stream::once(async move {
        File::open(&path).await.map_err(|err| {
            ferry_error!(
                ErrorKind::SourceConnectionFailed,
                "Could not open file for reading",
                path.display(),
                source: err
            )
        })
    })
    .flat_map(move |opened| match opened {
        Ok(file) => lines(BufReader::new(file).lines(), namespace.clone()).boxed(),
        Err(err) => stream::iter([Err(err)]).boxed(),
    })
}

fn lines(
    lines: Lines<BufReader<File>>,
    namespace: String,
) -> impl Stream<Item = FerryResult<Message>> + Send + 'static {
    stream::unfold(Some((lines, 0usize, namespace)), |state| async move {
        let (mut lines, line_number, namespace) = state?;
        let line_number = line_number + 1;

        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {
                Some((None, Some((lines, line_number, namespace))))
            }
            Ok(Some(line)) => {
                let message = parse_line(&namespace, line_number, &line);
                Some((Some(message), Some((lines, line_number, namespace))))
            }
            Ok(None) => None,
            // The stream ends after an IO error.
            Err(err) => Some((Some(Err(err.into())), None)),
        }
    })
    .filter_map(future::ready)
}

fn parse_line(namespace: &str, line_number: usize, line: &str) -> FerryResult<Message> {
    let mut data: Data = serde_json::from_str(line).map_err(|err| {
        ferry_error!(
            ErrorKind::DeserializationError,
            "Line is not a JSON object",
            format!("line {line_number}: {err}"),
            source: err
        )
    })?;
    normalize_id(&mut data);

    Ok(Message::new(namespace, Operation::Insert, data))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::adaptor::file::client::{FileClient, FileTarget};
    use crate::client::{Client, namespace_filter};
    use crate::concurrency::shutdown::create_shutdown_channel;

    async fn session_for(contents: &str) -> (tempfile::TempDir, FileSession) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        tokio::fs::write(&path, contents).await.unwrap();

        let session = FileClient::new(FileTarget::File(path))
            .connect()
            .await
            .unwrap();
        (dir, session)
    }

    #[tokio::test]
    async fn reads_one_insert_per_line() {
        let (_dir, session) =
            session_for("{\"id\": 1, \"total\": 10}\n\n{\"id\": 2, \"total\": 20}\n").await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = FileReader.read(namespace_filter(|_| true));
        let messages: Vec<_> = read(&session, shutdown_rx)
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].namespace(), "file.orders.json");
        assert_eq!(messages[0].operation(), Operation::Insert);
        assert_eq!(messages[0].id().as_deref(), Some("1"));
        assert!(messages[0].data().get("id").is_none());
        assert_eq!(messages[1].id().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn malformed_line_is_an_item_error() {
        let (_dir, session) = session_for("{\"id\": 1}\nnot json\n{\"id\": 3}\n").await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = FileReader.read(namespace_filter(|_| true));
        let results: Vec<_> = read(&session, shutdown_rx).unwrap().collect().await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
        assert!(err.detail().unwrap().starts_with("line 2"));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn filtered_namespace_yields_nothing() {
        let (_dir, session) = session_for("{\"id\": 1}\n").await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = FileReader.read(namespace_filter(|namespace| namespace == "file.other.json"));
        let results: Vec<_> = read(&session, shutdown_rx).unwrap().collect().await;

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream() {
        let (_dir, session) = session_for("{\"id\": 1}\n{\"id\": 2}\n").await;
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        shutdown_tx.shutdown();

        let read = FileReader.read(namespace_filter(|_| true));
        let results: Vec<_> = read(&session, shutdown_rx).unwrap().collect().await;

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn stdout_cannot_be_read() {
        let session = FileClient::new(FileTarget::Stdout).connect().await.unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let read = FileReader.read(namespace_filter(|_| true));
        let err = read(&session, shutdown_rx).err().unwrap();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}
