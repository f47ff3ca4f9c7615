//! Ferry replicator binary.
//!
//! Loads the pipeline configuration, initializes telemetry and runs the pipeline until it
//! completes or the process is asked to stop.

use ferry_config::shared::ReplicatorConfig;
use ferry_telemetry::metrics::init_metrics;
use ferry_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod config;
mod core;
mod error;

fn main() {
    if let Err(err) = run() {
        eprint!("{}", err.render_report());
        std::process::exit(1);
    }
}

/// Loads configuration, initializes tracing and metrics, then runs the pipeline on a
/// multi-threaded runtime.
fn run() -> ReplicatorResult<()> {
    let replicator_config = load_replicator_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    init_metrics(Some(&replicator_config.pipeline.name)).map_err(ReplicatorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        let err = ReplicatorError::from(err);
        error!("{err}");

        return Err(err);
    }

    Ok(())
}
