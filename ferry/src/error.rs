//! Error types and result definitions for pipeline operations.
//!
//! Provides an error system with classification, aggregation, and captured diagnostic metadata
//! for adaptors, pipes and the bulk processor. The [`FerryError`] type supports single errors,
//! errors with additional detail, and multiple aggregated errors (e.g. several adaptors failing
//! during one shutdown).

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for pipeline operations using [`FerryError`] as the error type.
pub type FerryResult<T> = Result<T, FerryError>;

/// Detailed payload stored for single [`FerryError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    fatal: bool,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for pipeline operations.
///
/// [`FerryError`] can represent a single error, an error with additional detail, or multiple
/// aggregated errors. Errors can be explicitly marked as fatal with [`FerryError::fatal`], which
/// makes a listening pipe stop instead of reporting the error and moving on.
#[derive(Debug, Clone)]
pub struct FerryError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors.
    ///
    /// This variant is mainly useful to capture failures of several adaptors at once.
    Many {
        errors: Vec<FerryError>,
        location: &'static Location<'static>,
    },
}

/// Specific categories of errors that can occur while moving messages.
///
/// Error kinds are organized by functional area and failure mode. Configuration and connection
/// kinds are fatal for the run, the remaining kinds are reported per message.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration Errors
    ConfigError,
    InvalidNamespace,
    AdaptorNotFound,

    // Connection Errors
    SourceConnectionFailed,
    DestinationConnectionFailed,

    // Read & Write Errors
    SourceError,
    DestinationError,
    BulkCommitFailed,

    // Data & Transformation Errors
    InvalidData,
    TransformFailed,

    // IO & Serialization Errors
    IoError,
    SerializationError,
    DeserializationError,

    // State & Workflow Errors
    PipeStopped,
    BulkProcessorClosed,
    InvalidState,
    AdaptorPanic,
    WorkerCancelled,
    ErrorThresholdExceeded,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` if errors of this kind must halt the adaptor that observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigError
                | ErrorKind::InvalidNamespace
                | ErrorKind::AdaptorNotFound
                | ErrorKind::SourceConnectionFailed
                | ErrorKind::DestinationConnectionFailed
                | ErrorKind::ErrorThresholdExceeded
        )
    }
}

impl FerryError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the aggregated errors, or `None` for a single error.
    pub fn errors(&self) -> Option<&[FerryError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors.as_slice()),
        }
    }

    /// Returns the static description of this error, or of the first aggregated error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("aggregated errors"),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Marks this error as fatal and returns the modified instance.
    ///
    /// Aggregated errors are marked by marking every contained error.
    pub fn fatal(mut self) -> Self {
        match self.repr {
            ErrorRepr::Single(ref mut payload) => payload.fatal = true,
            ErrorRepr::Many { ref mut errors, .. } => {
                for err in errors.iter_mut() {
                    *err = err.clone().fatal();
                }
            }
        }

        self
    }

    /// Returns `true` if this error was marked fatal or belongs to a fatal [`ErrorKind`].
    pub fn is_fatal(&self) -> bool {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.fatal || payload.kind.is_fatal(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().any(|err| err.is_fatal()),
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect when called on aggregated errors because aggregates forward the first
    /// contained error as their source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    /// Creates a [`FerryError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        FerryError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                fatal: false,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for FerryError {
    fn eq(&self, other: &FerryError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for FerryError {
    /// Hashes the error using only its stable identifying components.
    ///
    /// Location, detail, source and backtrace are excluded so that errors of the same category
    /// produce the same hash.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for FerryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }

                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for FerryError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            // For aggregated errors, we forward the first contained error as the source.
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes the detail block with indentation.
fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    let indent_str = "  ".repeat(indent);
    if detail.trim().is_empty() {
        return write!(f, "\n{indent_str}Detail: <empty>");
    }

    write!(f, "\n{indent_str}Detail:")?;
    for line in detail.lines() {
        write!(f, "\n{indent_str}  {line}")?;
    }

    Ok(())
}

/// Creates a [`FerryError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for FerryError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> FerryError {
        FerryError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`FerryError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for FerryError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> FerryError {
        FerryError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Creates a [`FerryError`] from a vector of errors for aggregation.
///
/// If the vector contains exactly one error, returns that error directly without wrapping
/// it in the [`ErrorRepr::Many`] variant.
impl<E> From<Vec<E>> for FerryError
where
    E: Into<FerryError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> FerryError {
        let location = Location::caller();

        let mut errors: Vec<FerryError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        FerryError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`std::io::Error`] to [`FerryError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for FerryError {
    #[track_caller]
    fn from(err: std::io::Error) -> FerryError {
        let detail = err.to_string();
        FerryError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`FerryError`] with the appropriate error kind.
impl From<serde_json::Error> for FerryError {
    #[track_caller]
    fn from(err: serde_json::Error) -> FerryError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        FerryError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`regex::Error`] to [`FerryError`] with [`ErrorKind::InvalidNamespace`].
impl From<regex::Error> for FerryError {
    #[track_caller]
    fn from(err: regex::Error) -> FerryError {
        let detail = err.to_string();
        FerryError::from_components(
            ErrorKind::InvalidNamespace,
            Cow::Borrowed("Namespace pattern is not a valid regular expression"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`reqwest::Error`] to [`FerryError`].
///
/// Decode failures map to [`ErrorKind::DeserializationError`], anything else to
/// [`ErrorKind::DestinationError`]. Connection failures stay non-fatal here; callers that
/// establish a connection map them to [`ErrorKind::DestinationConnectionFailed`] themselves.
impl From<reqwest::Error> for FerryError {
    #[track_caller]
    fn from(err: reqwest::Error) -> FerryError {
        let (kind, description) = if err.is_connect() || err.is_timeout() {
            (
                ErrorKind::DestinationError,
                "HTTP connection to the destination failed",
            )
        } else if err.is_decode() {
            (
                ErrorKind::DeserializationError,
                "HTTP response could not be decoded",
            )
        } else {
            (ErrorKind::DestinationError, "HTTP request failed")
        };

        let detail = err.to_string();
        FerryError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
