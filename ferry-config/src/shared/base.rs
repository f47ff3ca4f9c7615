use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A pipeline must have exactly one node without a parent.
    #[error("pipeline `{pipeline}` must have exactly one root node, found {found}")]
    RootNodeCount { pipeline: String, found: usize },

    /// Two nodes share the same name.
    #[error("node name `{0}` is used more than once")]
    DuplicateNodeName(String),

    /// A node references a parent that does not exist.
    #[error("node `{node}` references unknown parent `{parent}`")]
    UnknownParent { node: String, parent: String },

    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
