use std::fmt;

use tokio::sync::mpsc;

use crate::error::FerryError;
use crate::message::{Data, Message, Operation};

/// Severity of an error reported on a pipe's error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorLevel {
    Note,
    Warning,
    Error,
    /// The reporting adaptor cannot continue and the pipeline must shut down.
    Critical,
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            ErrorLevel::Note => "note",
            ErrorLevel::Warning => "warning",
            ErrorLevel::Error => "error",
            ErrorLevel::Critical => "critical",
        };
        f.write_str(level)
    }
}

/// An error reported by an adaptor while processing messages.
#[derive(Debug, Clone)]
pub struct AdaptorError {
    pub level: ErrorLevel,
    /// Path of the pipe on which the error occurred.
    pub path: String,
    pub error: FerryError,
    pub namespace: Option<String>,
    pub operation: Option<Operation>,
    /// Payload of the message that could not be processed.
    pub record: Option<Data>,
}

impl AdaptorError {
    pub fn new(level: ErrorLevel, path: impl Into<String>, error: FerryError) -> Self {
        Self {
            level,
            path: path.into(),
            error,
            namespace: None,
            operation: None,
            record: None,
        }
    }

    /// Attaches the namespace, operation and payload of `message`.
    pub fn with_message(mut self, message: &Message) -> Self {
        self.namespace = Some(message.namespace().to_string());
        self.operation = Some(message.operation());
        self.record = Some(message.data().clone());
        self
    }
}

impl fmt::Display for AdaptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error on `{}`", self.level, self.path)?;
        if let Some(namespace) = &self.namespace {
            write!(f, " ({namespace}")?;
            if let Some(operation) = self.operation {
                write!(f, ", {operation}")?;
            }
            write!(f, ")")?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Sending half of the error channel shared by every pipe of one tree.
pub type ErrorTx = mpsc::UnboundedSender<AdaptorError>;

/// Receiving half of the error channel shared by every pipe of one tree.
pub type ErrorRx = mpsc::UnboundedReceiver<AdaptorError>;

/// Creates the error channel for a new pipe tree.
pub fn create_error_channel() -> (ErrorTx, ErrorRx) {
    mpsc::unbounded_channel()
}
