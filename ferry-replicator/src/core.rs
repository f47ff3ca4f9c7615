use ferry::adaptor::AdaptorRegistry;
use ferry::adaptor::memory::MemoryStore;
use ferry::pipeline::Pipeline;
use ferry_config::shared::{PipelineConfig, ReplicatorConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// Starts the replicator service with the provided configuration.
///
/// Builds the adaptor registry with every built-in adaptor, constructs the configured pipeline
/// and runs it until its source is exhausted or a shutdown signal arrives.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> anyhow::Result<()> {
    info!("starting replicator service");

    log_pipeline_config(&replicator_config.pipeline);

    // Memory adaptors of one process share a single store.
    let registry = AdaptorRegistry::with_builtins(MemoryStore::new());
    debug!(adaptors = ?registry.names(), "adaptor registry built");

    let pipeline = Pipeline::new(replicator_config.pipeline, &registry)?;
    start_pipeline(pipeline).await?;

    info!("replicator service completed");

    Ok(())
}

fn log_pipeline_config(config: &PipelineConfig) {
    debug!(
        pipeline = config.name,
        nodes = config.nodes.len(),
        error_threshold = config.error_threshold,
        "pipeline config"
    );

    // Options are not logged, they may hold credentials.
    for node in config.nodes_top_down() {
        debug!(
            node = node.name,
            adaptor = node.adaptor,
            parent = node.parent,
            namespace = node.namespace,
            "pipeline node config"
        );
    }
}

/// Starts a pipeline and handles graceful shutdown signals.
///
/// On SIGTERM or SIGINT the pipeline stops its source, drains every pipe and flushes all sinks
/// before this function returns.
#[tracing::instrument(skip(pipeline), fields(pipeline = pipeline.name()))]
async fn start_pipeline(mut pipeline: Pipeline) -> anyhow::Result<()> {
    pipeline.start().await?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to register sigterm handler, only ctrl+c stops the pipeline");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("sigint (ctrl+c) received, shutting down pipeline");
                    shutdown_tx.shutdown();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down pipeline");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = pipeline.wait().await;

    // The pipeline can complete on its own, in which case no signal will ever arrive.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}
