//! Tracing subscriber setup.
//!
//! Development processes log human readable lines to stdout. Production processes log JSON to
//! daily rolling files under [`LOGS_DIR`], written by a background thread that is flushed when
//! the returned [`LogFlusher`] is dropped.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::io;
use std::panic::PanicHookInfo;
use std::sync::Once;

use ferry_config::environment::Environment;
use thiserror::Error;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_log::log::SetLoggerError;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{Layer, fmt};

/// Directory, relative to the working directory, receiving production log files.
pub const LOGS_DIR: &str = "logs";

const LOG_FILE_SUFFIX: &str = "log";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to create the log file appender: {0}")]
    Appender(#[from] InitError),

    #[error("failed to forward `log` records to tracing: {0}")]
    LogTracer(#[from] SetLoggerError),

    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Flushes buffered log lines when dropped. Keep it alive until the process exits.
#[must_use = "dropping the flusher stops the background log writer"]
#[derive(Debug)]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for `app_name`.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. `log` records of dependencies are
/// forwarded to tracing and panics are logged as errors.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    LogTracer::init()?;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let (layer, guard) = if environment.is_dev() {
        (fmt::layer().boxed(), None)
    } else {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(app_name)
            .filename_suffix(LOG_FILE_SUFFIX)
            .build(LOGS_DIR)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = fmt::layer()
            .json()
            .with_ansi(false)
            .flatten_event(true)
            .with_current_span(true)
            .with_writer(writer)
            .boxed();

        (layer, Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    std::panic::set_hook(Box::new(report_panic));

    info!(app = app_name, environment = %environment, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a subscriber writing through the test harness, once per process.
///
/// Does nothing unless `ENABLE_TRACING` is set, so test output stays quiet by default.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_err() {
            return;
        }

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let backtrace = Backtrace::capture();
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic_info.payload().downcast_ref::<String>().map(String::as_str));

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload
            );
        }
        _ => error!("{panic_info}\n{backtrace}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_can_be_initialized_repeatedly() {
        init_test_tracing();
        init_test_tracing();
    }

    #[test]
    fn appender_writes_into_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("ferry-test")
            .filename_suffix(LOG_FILE_SUFFIX)
            .build(dir.path());

        assert!(appender.is_ok());
    }
}
