use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::FerryResult;
use crate::message::Message;

/// A single step applied to messages received by a pipe.
///
/// Returning `Ok(None)` drops the message.
pub type ApplyFn =
    Arc<dyn Fn(Message) -> BoxFuture<'static, FerryResult<Option<Message>>> + Send + Sync>;

/// An ordered list of [`ApplyFn`] steps composed into one.
///
/// Each step receives the output of the previous one. The first step that drops the message or
/// fails ends the chain.
#[derive(Clone, Default)]
pub struct ApplyChain {
    steps: Arc<Vec<ApplyFn>>,
}

impl ApplyChain {
    pub fn new(steps: Vec<ApplyFn>) -> Self {
        Self {
            steps: Arc::new(steps),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs `message` through every step in order.
    pub async fn apply(&self, message: Message) -> FerryResult<Option<Message>> {
        let mut current = message;
        for step in self.steps.iter() {
            match step(current).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }
}

impl fmt::Debug for ApplyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyChain")
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::bail;
    use crate::error::ErrorKind;
    use crate::message::Operation;

    fn message() -> Message {
        let Some(data) = json!({"n": 0}).as_object().cloned() else {
            panic!("expected object");
        };
        Message::new("db.items", Operation::Insert, data)
    }

    fn increment() -> ApplyFn {
        Arc::new(|mut message: Message| {
            async move {
                let n = message.data()["n"].as_i64().unwrap_or_default();
                message.data_mut().insert("n".to_string(), json!(n + 1));
                Ok(Some(message))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let chain = ApplyChain::new(vec![increment(), increment(), increment()]);

        let result = chain.apply(message()).await.unwrap().unwrap();
        assert_eq!(result.data()["n"], json!(3));
    }

    #[tokio::test]
    async fn empty_chain_passes_message_through() {
        let chain = ApplyChain::default();
        assert!(chain.is_empty());

        let original = message();
        let result = chain.apply(original.clone()).await.unwrap();
        assert_eq!(result, Some(original));
    }

    #[tokio::test]
    async fn drop_and_error_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting: ApplyFn = {
            let calls = calls.clone();
            Arc::new(move |message: Message| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(message)) }.boxed()
            })
        };
        let dropping: ApplyFn = Arc::new(|_message: Message| async { Ok(None) }.boxed());
        let failing: ApplyFn = Arc::new(|_message: Message| {
            async { bail!(ErrorKind::TransformFailed, "Step failed") }.boxed()
        });

        let chain = ApplyChain::new(vec![dropping, counting.clone()]);
        assert_eq!(chain.apply(message()).await.unwrap(), None);

        let chain = ApplyChain::new(vec![failing, counting]);
        let err = chain.apply(message()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransformFailed);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
