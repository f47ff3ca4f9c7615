use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use ferry::error::FerryError;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Captured backtrace wrapper to avoid thiserror's unstable feature detection.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for the replicator service.
///
/// Wraps [`FerryError`] for pipeline errors and provides variants for the errors raised while
/// setting the process up.
#[derive(Debug)]
pub enum ReplicatorError {
    /// Pipeline error.
    Ferry(FerryError),
    /// Configuration or telemetry setup error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// I/O error.
    Io(std::io::Error, CapturedBacktrace),
}

impl ReplicatorError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Ferry(_) => "pipeline error",
            ReplicatorError::Config(_, _) => "configuration error",
            ReplicatorError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ReplicatorError::Ferry(err) => err.backtrace(),
            ReplicatorError::Config(_, backtrace) => Some(&backtrace.0),
            ReplicatorError::Io(_, backtrace) => Some(&backtrace.0),
        }
    }

    /// Creates a configuration error from any error.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a user-oriented report for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("replicator failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        match self {
            ReplicatorError::Ferry(err) if err.errors().is_some() => {
                for (idx, err) in err.errors().unwrap_or_default().iter().enumerate() {
                    out.push_str(&format!("error {}: {err}\n", idx + 1));
                }
            }
            _ => {
                let mut source = Error::source(self);
                let mut idx = 1usize;
                while let Some(err) = source {
                    out.push_str(&format!("cause {idx}: {err}\n"));
                    source = err.source();
                    idx += 1;
                }
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Ferry(err) => write!(f, "{err}"),
            ReplicatorError::Config(source, _) => write!(f, "configuration error: {source}"),
            ReplicatorError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ReplicatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicatorError::Ferry(err) => err.source(),
            ReplicatorError::Config(source, _) => Some(source.as_ref()),
            ReplicatorError::Io(source, _) => Some(source),
        }
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<FerryError> for ReplicatorError {
    fn from(err: FerryError) -> Self {
        ReplicatorError::Ferry(err)
    }
}

impl From<anyhow::Error> for ReplicatorError {
    /// Recovers the pipeline error carried by `err`, if any.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FerryError>() {
            Ok(err) => ReplicatorError::Ferry(err),
            Err(err) => match err.downcast::<std::io::Error>() {
                Ok(err) => err.into(),
                Err(err) => ReplicatorError::Config(err.into(), CapturedBacktrace::capture()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use ferry::error::ErrorKind;
    use ferry::ferry_error;

    use super::*;

    #[test]
    fn pipeline_errors_survive_anyhow() {
        let err = anyhow::Error::new(ferry_error!(ErrorKind::ConfigError, "Broken pipeline"));

        let err = ReplicatorError::from(err);

        assert!(matches!(&err, ReplicatorError::Ferry(err) if err.kind() == ErrorKind::ConfigError));
        assert_eq!(err.category(), "pipeline error");
    }

    #[test]
    fn report_lists_aggregated_errors() {
        let err: FerryError = vec![
            ferry_error!(ErrorKind::DestinationError, "First failure"),
            ferry_error!(ErrorKind::AdaptorPanic, "Second failure"),
        ]
        .into();

        let report = ReplicatorError::from(err).render_report();

        assert!(report.starts_with("replicator failed\ncategory: pipeline error\n"));
        assert!(report.contains("error 1: "));
        assert!(report.contains("error 2: "));
    }
}
