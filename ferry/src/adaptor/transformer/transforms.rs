use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;

use crate::error::FerryError;
use crate::message::{Message, Operation, denormalize_id, normalize_id};
use crate::pipe::{ApplyChain, ApplyFn};

/// A built-in message transformation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Moves `id` to `_id`.
    NormalizeId,
    /// Moves `_id` to `id`.
    DenormalizeId,
    /// Moves the value of field `from` to field `to`.
    RenameField { from: String, to: String },
    DropFields { fields: Vec<String> },
    /// Drops messages of the listed operations.
    SkipOperations { operations: Vec<Operation> },
}

impl Transform {
    /// Applies the transformation, returning `None` if the message is dropped.
    pub fn apply(&self, mut message: Message) -> Option<Message> {
        match self {
            Transform::NormalizeId => normalize_id(message.data_mut()),
            Transform::DenormalizeId => denormalize_id(message.data_mut()),
            Transform::RenameField { from, to } => {
                let data = message.data_mut();
                if let Some(value) = data.shift_remove(from) {
                    data.insert(to.clone(), value);
                }
            }
            Transform::DropFields { fields } => {
                let data = message.data_mut();
                for field in fields {
                    data.shift_remove(field);
                }
            }
            Transform::SkipOperations { operations } => {
                if operations.contains(&message.operation()) {
                    return None;
                }
            }
        }

        Some(message)
    }

    fn into_apply_fn(self) -> ApplyFn {
        let transform = Arc::new(self);

        Arc::new(move |message: Message| {
            let transform = transform.clone();
            async move { Ok::<_, FerryError>(transform.apply(message)) }.boxed()
        })
    }
}

/// Composes `transforms` in order into one chain.
pub fn build_chain(transforms: &[Transform]) -> ApplyChain {
    ApplyChain::new(
        transforms
            .iter()
            .cloned()
            .map(Transform::into_apply_fn)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(operation: Operation, value: serde_json::Value) -> Message {
        let Some(data) = value.as_object().cloned() else {
            panic!("object expected");
        };
        Message::new("shop.orders", operation, data)
    }

    #[test]
    fn deserializes_tagged_transforms() {
        let transforms: Vec<Transform> = serde_json::from_value(json!([
            {"type": "normalize_id"},
            {"type": "drop_fields", "fields": ["secret"]},
            {"type": "skip_operations", "operations": ["update", "delete"]}
        ]))
        .unwrap();

        assert_eq!(
            transforms,
            vec![
                Transform::NormalizeId,
                Transform::DropFields {
                    fields: vec!["secret".to_string()]
                },
                Transform::SkipOperations {
                    operations: vec![Operation::Update, Operation::Delete]
                },
            ]
        );
    }

    #[tokio::test]
    async fn chain_applies_steps_in_order() {
        let chain = build_chain(&[
            Transform::DenormalizeId,
            Transform::RenameField {
                from: "id".to_string(),
                to: "key".to_string(),
            },
            Transform::DropFields {
                fields: vec!["secret".to_string()],
            },
        ]);

        let output = chain
            .apply(message(
                Operation::Insert,
                json!({"_id": 7, "secret": "x", "name": "a"}),
            ))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(output.data(), message(Operation::Insert, json!({"name": "a", "key": 7})).data());
    }

    #[tokio::test]
    async fn skipped_operation_is_dropped() {
        let chain = build_chain(&[Transform::SkipOperations {
            operations: vec![Operation::Delete],
        }]);

        let dropped = chain
            .apply(message(Operation::Delete, json!({"_id": 1})))
            .await
            .unwrap();
        assert!(dropped.is_none());

        let kept = chain
            .apply(message(Operation::Update, json!({"_id": 1})))
            .await
            .unwrap();
        assert!(kept.is_some());
    }

    #[test]
    fn normalize_and_denormalize_round_trip() {
        let original = message(Operation::Insert, json!({"id": "a", "n": 1}));

        let normalized = Transform::NormalizeId.apply(original.clone()).unwrap();
        assert_eq!(normalized.data().get("_id"), Some(&json!("a")));

        let restored = Transform::DenormalizeId.apply(normalized).unwrap();
        assert_eq!(restored.data().get("id"), original.data().get("id"));
    }
}
