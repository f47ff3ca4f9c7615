use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::adaptor::elasticsearch::request::BulkRequest;
use crate::bulk::{BulkProcessor, BulkService};
use crate::client::{Closer, Session, WriteOp, Writer, write_op};
use crate::message::{Message, Operation};

/// Writes messages through a bulk processor.
///
/// Deletes flush every pending request first, so a delete is never committed ahead of an
/// earlier insert or update of the same document. A failed flush does not drop the delete; the
/// failure reaches the after-commit hook and the delete is queued anyway. As a [`Session`], the
/// writer closes its processor, which commits whatever is still pending.
pub struct BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
{
    processor: BulkProcessor<S>,
    index: Option<String>,
}

impl<S> BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
{
    /// Creates a writer targeting `index`, or the namespace database of every message if no
    /// index is given.
    pub fn new(processor: BulkProcessor<S>, index: Option<String>) -> Self {
        Self { processor, index }
    }

    pub fn processor(&self) -> &BulkProcessor<S> {
        &self.processor
    }
}

impl<S> Clone for BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
{
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            index: self.index.clone(),
        }
    }
}

impl<S, X> Writer<X> for BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
    X: Send + 'static,
{
    fn write(&self, message: Message) -> WriteOp<X> {
        let processor = self.processor.clone();
        let index = self.index.clone();

        write_op(move |_session: &mut X| {
            async move {
                let flush_first = message.operation() == Operation::Delete;
                let request = BulkRequest::from_message(index.as_deref(), message)?;

                if flush_first && let Err(err) = processor.flush().await {
                    debug!(error = %err, "flush before delete failed, queueing the delete anyway");
                }
                processor.add(request).await
            }
            .boxed()
        })
    }
}

#[async_trait]
impl<S> Closer for BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
{
    async fn close(&mut self) {
        match self.processor.close().await {
            Ok(()) => info!(stats = %self.processor.stats(), "bulk writer closed"),
            Err(err) => warn!(error = %err, "bulk writer closed with errors"),
        }
    }
}

impl<S> Session for BulkWriter<S>
where
    S: BulkService<Request = BulkRequest>,
{
    fn closer(&mut self) -> Option<&mut dyn Closer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bulk::BulkProcessorConfig;
    use crate::client;
    use crate::error::ErrorKind;
    use crate::test_utils::bulk::RecordingBulkService;
    use crate::test_utils::client::TrackingClient;

    fn message(operation: Operation, id: &str) -> Message {
        let Some(data) = json!({"_id": id, "n": 1}).as_object().cloned() else {
            panic!("object expected");
        };
        Message::new("shop.orders", operation, data)
    }

    fn config() -> BulkProcessorConfig {
        BulkProcessorConfig {
            workers: 2,
            bulk_actions: 10,
            bulk_size_bytes: 0,
            flush_interval: None,
            ..BulkProcessorConfig::default()
        }
    }

    #[tokio::test]
    async fn delete_flushes_pending_writes_first() {
        let service = RecordingBulkService::<BulkRequest>::new();
        let processor = BulkProcessor::start("es", service.clone(), config(), None);
        let writer = BulkWriter::new(processor.clone(), None);
        let client = TrackingClient::new();

        client::write(&client, &writer, message(Operation::Insert, "1"))
            .await
            .unwrap();
        client::write(&client, &writer, message(Operation::Update, "1"))
            .await
            .unwrap();
        client::write(&client, &writer, message(Operation::Delete, "1"))
            .await
            .unwrap();

        let batches = service.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].iter().map(BulkRequest::action).collect::<Vec<_>>(),
            vec!["index", "update"]
        );
        assert_eq!(processor.pending().await, 1);

        let mut session = writer.clone();
        session.closer().unwrap().close().await;

        let batches = service.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].action(), "delete");
        assert!(processor.is_closed());
    }

    #[tokio::test]
    async fn delete_is_queued_when_the_flush_before_it_fails() {
        let service = RecordingBulkService::<BulkRequest>::new().failing_first(1);
        let config = BulkProcessorConfig {
            max_retries: 0,
            ..config()
        };
        let processor = BulkProcessor::start("es", service.clone(), config, None);
        let mut writer = BulkWriter::new(processor.clone(), None);
        let client = TrackingClient::new();

        client::write(&client, &writer, message(Operation::Insert, "1"))
            .await
            .unwrap();
        client::write(&client, &writer, message(Operation::Delete, "1"))
            .await
            .unwrap();

        assert_eq!(service.attempts(), 1);
        assert!(service.batches().is_empty());
        assert_eq!(processor.pending().await, 1);

        writer.closer().unwrap().close().await;

        let batches = service.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].iter().map(BulkRequest::action).collect::<Vec<_>>(),
            vec!["delete"]
        );
    }

    #[tokio::test]
    async fn writes_after_close_are_rejected() {
        let service = RecordingBulkService::<BulkRequest>::new();
        let processor = BulkProcessor::start("es", service, config(), None);
        let mut writer = BulkWriter::new(processor, Some("archive".to_string()));

        writer.closer().unwrap().close().await;

        let err = client::write(
            &TrackingClient::new(),
            &writer,
            message(Operation::Insert, "1"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BulkProcessorClosed);
    }
}
