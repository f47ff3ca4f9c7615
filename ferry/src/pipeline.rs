use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ferry_config::shared::{NodeConfig, PipelineConfig};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::adaptor::{
    Adaptor, AdaptorConfig, AdaptorRegistry, MATCH_ALL, NAMESPACE_KEY, namespace_route_pattern,
};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, FerryError, FerryResult};
use crate::ferry_error;
use crate::metrics::{ERROR_KIND_LABEL, FERRY_ADAPTOR_ERRORS_TOTAL, PATH_LABEL};
use crate::pipe::{AdaptorError, ErrorLevel, ErrorRx, Pipe, create_error_channel};
use crate::workers::adaptor::{AdaptorWorker, AdaptorWorkerHandle};
use crate::workers::base::{Worker, WorkerHandle, WorkerType};

/// An adaptor bound to its pipe within a pipeline tree.
#[derive(Clone)]
struct PipelineNode {
    path: String,
    pipe: Pipe,
    adaptor: Arc<dyn Adaptor>,
}

impl fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineNode")
            .field("path", &self.path)
            .field("adaptor", &self.adaptor.description())
            .finish()
    }
}

#[derive(Debug)]
enum PipelineState {
    NotStarted {
        errors: ErrorRx,
    },
    Started {
        source: AdaptorWorkerHandle,
        sinks: Vec<AdaptorWorkerHandle>,
        error_watcher: JoinHandle<FerryResult<()>>,
        stopper: JoinHandle<()>,
        finished_tx: ShutdownTx,
    },
    Finished,
}

/// A tree of adaptors rooted at one source.
///
/// The source sends every message it reads into the root pipe, and every other node receives
/// the messages routed to it by its parent.
#[derive(Debug)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    // Ordered from the source down.
    nodes: Vec<PipelineNode>,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl Pipeline {
    /// Builds the pipe tree and every adaptor of `config` through `registry`.
    pub fn new(config: PipelineConfig, registry: &AdaptorRegistry) -> FerryResult<Self> {
        config.validate().map_err(|err| {
            ferry_error!(
                ErrorKind::ConfigError,
                "Invalid pipeline configuration",
                err.to_string(),
                source: err
            )
        })?;

        let (errors_tx, errors_rx) = create_error_channel();
        let mut nodes: Vec<PipelineNode> = Vec::with_capacity(config.nodes.len());
        let mut by_name: HashMap<String, usize> = HashMap::with_capacity(config.nodes.len());

        for node_config in config.nodes_top_down() {
            let (path, pipe) = match &node_config.parent {
                None => {
                    let path = node_config.name.clone();
                    let pipe = Pipe::new(path.clone(), errors_tx.clone());
                    (path, pipe)
                }
                Some(parent) => {
                    let Some(parent) = by_name.get(parent.as_str()).map(|index| &nodes[*index])
                    else {
                        return Err(ferry_error!(
                            ErrorKind::ConfigError,
                            "Pipeline node has no parent",
                            format!("node `{}` refers to `{parent}`", node_config.name)
                        ));
                    };

                    let path = format!("{}/{}", parent.path, node_config.name);
                    let route = route_pattern(node_config)?;
                    let pipe = parent.pipe.child(path.clone(), &route)?;
                    (path, pipe)
                }
            };

            let adaptor =
                registry.build(&node_config.adaptor, pipe.clone(), path.clone(), adaptor_config(node_config))?;
            info!(path = %path, adaptor = %node_config.adaptor, "pipeline node built");

            by_name.insert(node_config.name.clone(), nodes.len());
            nodes.push(PipelineNode {
                path,
                pipe,
                adaptor: Arc::from(adaptor),
            });
        }

        let (shutdown_tx, _) = create_shutdown_channel();

        Ok(Self {
            config: Arc::new(config),
            nodes,
            state: PipelineState::NotStarted { errors: errors_rx },
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the paths of all nodes, starting with the source.
    pub fn paths(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.path.as_str()).collect()
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Connects every adaptor, starts the sinks and, once all of them listen, the source.
    ///
    /// If a sink worker ends before its pipe listens, every adaptor is stopped and the errors
    /// are returned. The pipeline cannot be started again afterwards.
    pub async fn start(&mut self) -> FerryResult<()> {
        let errors = match std::mem::replace(&mut self.state, PipelineState::Finished) {
            PipelineState::NotStarted { errors } => errors,
            state => {
                self.state = state;
                info!(pipeline = %self.config.name, "pipeline was already started");

                return Ok(());
            }
        };

        info!(pipeline = %self.config.name, nodes = self.nodes.len(), "starting pipeline");

        for node in &self.nodes {
            node.adaptor.connect().await.map_err(FerryError::fatal)?;
        }

        let Some((source, sinks)) = self.nodes.split_first() else {
            return Err(ferry_error!(
                ErrorKind::ConfigError,
                "Pipeline has no source node",
                self.config.name.clone()
            ));
        };

        let (finished_tx, _) = create_shutdown_channel();

        let error_watcher = tokio::spawn(
            run_error_watcher(
                errors,
                self.config.error_threshold,
                self.shutdown_tx.clone(),
                finished_tx.subscribe(),
            )
            .instrument(info_span!("pipeline_error_watcher", pipeline = %self.config.name)),
        );
        let stopper = tokio::spawn(
            stop_on_shutdown(
                self.nodes.clone(),
                self.shutdown_tx.subscribe(),
                finished_tx.subscribe(),
            )
            .instrument(info_span!("pipeline_stopper", pipeline = %self.config.name)),
        );

        let mut sink_handles: Vec<_> = sinks
            .iter()
            .map(|node| {
                AdaptorWorker::new(node.path.clone(), WorkerType::Sink, node.adaptor.clone()).start()
            })
            .collect();

        let mut failure = None;
        for (node, handle) in sinks.iter().zip(sink_handles.iter_mut()) {
            if let Err(err) = handle.wait_until_listening(&node.pipe).await {
                error!(path = %node.path, error = %err, "sink worker failed before listening");
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            // The stopper stops every adaptor, which ends the sinks that are listening.
            self.shutdown_tx.shutdown();

            let mut errors = vec![err];
            for handle in sink_handles {
                if let Err(err) = handle.wait().await {
                    errors.push(err);
                }
            }

            finished_tx.shutdown();
            let _ = stopper.await;
            if let Ok(Err(err)) = error_watcher.await {
                errors.push(err);
            }

            info!(pipeline = %self.config.name, "pipeline failed to start");

            return Err(errors.into());
        }

        let source_handle =
            AdaptorWorker::new(source.path.clone(), WorkerType::Source, source.adaptor.clone())
                .start();

        self.state = PipelineState::Started {
            source: source_handle,
            sinks: sink_handles,
            error_watcher,
            stopper,
            finished_tx,
        };

        Ok(())
    }

    /// Waits for every worker to complete and releases all adaptors.
    ///
    /// Returns the errors of all failed workers, including a crossed error threshold.
    pub async fn wait(self) -> FerryResult<()> {
        let PipelineState::Started {
            source,
            sinks,
            error_watcher,
            stopper,
            finished_tx,
        } = self.state
        else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        let mut errors = vec![];

        info!("waiting for source worker to complete");

        // Without a running source nothing stops the sinks, so a failed source shuts them down.
        if let Err(err) = source.wait().await {
            errors.push(err);
            self.shutdown_tx.shutdown();

            info!("source worker completed with an error, shutting down sink workers");
        }

        info!(sinks = sinks.len(), "waiting for sink workers to complete");

        for sink in sinks {
            let path = sink.path().to_string();
            if let Err(err) = sink.wait().await {
                info!(path = %path, "sink worker completed with an error");
                errors.push(err);
            }
        }

        for node in &self.nodes {
            if let Err(err) = node.adaptor.stop().await {
                error!(path = %node.path, error = %err, "failed to stop adaptor");
                errors.push(err);
            }
        }

        finished_tx.shutdown();
        let _ = stopper.await;
        match error_watcher.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(err),
            Err(err) => errors.push(ferry_error!(
                ErrorKind::WorkerCancelled,
                "Pipeline error watcher did not complete",
                err.to_string()
            )),
        }

        info!(pipeline = %self.config.name, failed = errors.len(), "pipeline completed");

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Asks every adaptor to stop, starting with the source.
    pub fn shutdown(&self) {
        info!(pipeline = %self.config.name, "trying to shut down the pipeline");

        self.shutdown_tx.shutdown();
    }

    pub async fn shutdown_and_wait(self) -> FerryResult<()> {
        self.shutdown();
        self.wait().await
    }
}

/// Returns the pattern under which a node is routed from its parent.
fn route_pattern(node: &NodeConfig) -> FerryResult<String> {
    match &node.namespace {
        Some(namespace) => namespace_route_pattern(namespace),
        None => Ok(MATCH_ALL.to_string()),
    }
}

/// Returns the options of `node` with its namespace injected unless they set one.
fn adaptor_config(node: &NodeConfig) -> AdaptorConfig {
    let mut config = AdaptorConfig::new(node.options.clone());
    if let Some(namespace) = &node.namespace
        && config.get(NAMESPACE_KEY).is_none()
    {
        config.insert(NAMESPACE_KEY, namespace.clone());
    }

    config
}

async fn stop_on_shutdown(
    nodes: Vec<PipelineNode>,
    mut shutdown_rx: ShutdownRx,
    mut finished_rx: ShutdownRx,
) {
    tokio::select! {
        biased;

        _ = finished_rx.wait() => return,
        _ = shutdown_rx.wait() => {}
    }

    info!("shutdown requested, stopping adaptors");

    for node in &nodes {
        if let Err(err) = node.adaptor.stop().await {
            error!(path = %node.path, error = %err, "failed to stop adaptor");
        }
    }
}

/// Logs and counts adaptor errors until the pipeline finished.
///
/// Shuts the pipeline down on a critical error, or once a node reported more than
/// `error_threshold` errors.
async fn run_error_watcher(
    mut errors: ErrorRx,
    error_threshold: Option<u64>,
    shutdown_tx: ShutdownTx,
    mut finished_rx: ShutdownRx,
) -> FerryResult<()> {
    let mut watcher = ErrorWatcher {
        error_threshold,
        shutdown_tx,
        counts: HashMap::new(),
        exceeded: None,
    };

    loop {
        tokio::select! {
            biased;

            error = errors.recv() => match error {
                Some(error) => watcher.observe(error),
                None => break,
            },
            _ = finished_rx.wait() => {
                while let Ok(error) = errors.try_recv() {
                    watcher.observe(error);
                }
                break;
            }
        }
    }

    match watcher.exceeded {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct ErrorWatcher {
    error_threshold: Option<u64>,
    shutdown_tx: ShutdownTx,
    counts: HashMap<String, u64>,
    exceeded: Option<FerryError>,
}

impl ErrorWatcher {
    fn observe(&mut self, report: AdaptorError) {
        counter!(
            FERRY_ADAPTOR_ERRORS_TOTAL,
            PATH_LABEL => report.path.clone(),
            ERROR_KIND_LABEL => format!("{:?}", report.error.kind())
        )
        .increment(1);

        match report.level {
            ErrorLevel::Note => info!(path = %report.path, "{report}"),
            ErrorLevel::Warning => warn!(path = %report.path, "{report}"),
            ErrorLevel::Error => error!(path = %report.path, "{report}"),
            ErrorLevel::Critical => {
                error!(path = %report.path, "{report}");
                self.shutdown_tx.shutdown();

                return;
            }
        }

        if report.level == ErrorLevel::Note {
            return;
        }

        let count = self.counts.entry(report.path.clone()).or_default();
        *count += 1;

        let Some(threshold) = self.error_threshold else {
            return;
        };
        if *count <= threshold || self.exceeded.is_some() {
            return;
        }

        error!(path = %report.path, errors = *count, threshold, "error threshold exceeded, shutting down the pipeline");

        self.exceeded = Some(ferry_error!(
            ErrorKind::ErrorThresholdExceeded,
            "Adaptor exceeded its error threshold",
            format!(
                "`{}` reported {} errors, threshold is {threshold}",
                report.path, *count
            )
        ));
        self.shutdown_tx.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use regex::Regex;
    use serde_json::json;

    use std::time::Duration;

    use super::*;
    use crate::adaptor::memory::MemoryStore;
    use crate::message::{Message, Operation};
    use crate::pipe::PipeState;

    fn node(name: &str, adaptor: &str, parent: Option<&str>, options: serde_json::Value) -> NodeConfig {
        let Some(options) = options.as_object().cloned() else {
            panic!("object expected");
        };
        NodeConfig {
            name: name.to_string(),
            adaptor: adaptor.to_string(),
            parent: parent.map(str::to_string),
            namespace: None,
            options,
        }
    }

    fn pipeline_config(nodes: Vec<NodeConfig>, error_threshold: Option<u64>) -> PipelineConfig {
        PipelineConfig {
            name: "test".to_string(),
            nodes,
            error_threshold,
        }
    }

    /// Sink rejecting every message it receives.
    struct RejectingAdaptor {
        pipe: Pipe,
    }

    #[async_trait]
    impl Adaptor for RejectingAdaptor {
        fn description(&self) -> &'static str {
            "rejects every message"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        async fn connect(&self) -> FerryResult<()> {
            Ok(())
        }

        async fn listen(&self) -> FerryResult<()> {
            self.pipe
                .listen(
                    |_message: Message| async {
                        Err(ferry_error!(ErrorKind::InvalidData, "Rejected message"))
                    },
                    &Regex::new(MATCH_ALL)?,
                )
                .await
        }

        async fn stop(&self) -> FerryResult<()> {
            self.pipe.stop().await;
            Ok(())
        }
    }

    /// Sink whose listen fails before its pipe ever listens.
    struct BrokenAdaptor;

    #[async_trait]
    impl Adaptor for BrokenAdaptor {
        fn description(&self) -> &'static str {
            "fails to listen"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        async fn connect(&self) -> FerryResult<()> {
            Ok(())
        }

        async fn listen(&self) -> FerryResult<()> {
            Err(ferry_error!(ErrorKind::DestinationError, "Store refused the listener"))
        }

        async fn stop(&self) -> FerryResult<()> {
            Ok(())
        }
    }

    fn registry(store: &MemoryStore) -> AdaptorRegistry {
        let mut registry = AdaptorRegistry::with_builtins(store.clone());
        registry.register("rejecting", |pipe, _path, _config| {
            Ok(Box::new(RejectingAdaptor { pipe }) as Box<dyn Adaptor>)
        });
        registry.register("broken", |_pipe, _path, _config| {
            Ok(Box::new(BrokenAdaptor) as Box<dyn Adaptor>)
        });
        registry
    }

    #[test]
    fn node_namespace_is_injected_into_options() {
        let mut with_namespace = node("sink", "memory", Some("source"), json!({}));
        with_namespace.namespace = Some("shop.orders".to_string());
        assert_eq!(
            adaptor_config(&with_namespace).get_str(NAMESPACE_KEY),
            Some("shop.orders")
        );

        let mut explicit = node("sink", "memory", Some("source"), json!({"namespace": "other.t"}));
        explicit.namespace = Some("shop.orders".to_string());
        assert_eq!(adaptor_config(&explicit).get_str(NAMESPACE_KEY), Some("other.t"));
    }

    #[test]
    fn builds_nested_paths() {
        let store = MemoryStore::new();
        let config = pipeline_config(
            vec![
                node("sink", "file", Some("trans"), json!({"uri": "stdout://"})),
                node("trans", "transformer", Some("source"), json!({"transforms": []})),
                node(
                    "source",
                    "memory",
                    None,
                    json!({"uri": "memory://", "namespace": "shop./.*/"}),
                ),
            ],
            None,
        );

        let pipeline = Pipeline::new(config, &registry(&store)).unwrap();

        assert_eq!(pipeline.paths(), vec!["source", "source/trans", "source/trans/sink"]);
    }

    #[test]
    fn rejects_unknown_adaptor_and_invalid_tree() {
        let store = MemoryStore::new();

        let unknown = pipeline_config(
            vec![
                node("source", "memory", None, json!({"uri": "memory://", "namespace": "a.b"})),
                node("sink", "postgres", Some("source"), json!({})),
            ],
            None,
        );
        let err = Pipeline::new(unknown, &registry(&store)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdaptorNotFound);

        let no_source = pipeline_config(vec![node("sink", "file", Some("sink"), json!({}))], None);
        let err = Pipeline::new(no_source, &registry(&store)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn error_threshold_shuts_the_pipeline_down() {
        let store = MemoryStore::new();
        for id in 0..5 {
            store
                .apply("shop", "orders", Operation::Insert, json!({"id": id}).as_object().cloned().unwrap())
                .await
                .unwrap();
        }

        let config = pipeline_config(
            vec![
                node(
                    "source",
                    "memory",
                    None,
                    json!({"uri": "memory://", "namespace": "shop.orders", "tail": true}),
                ),
                node("sink", "rejecting", Some("source"), json!({})),
            ],
            Some(2),
        );

        let mut pipeline = Pipeline::new(config, &registry(&store)).unwrap();
        pipeline.start().await.unwrap();

        let err = pipeline.wait().await.unwrap_err();
        assert!(err.kinds().contains(&ErrorKind::ErrorThresholdExceeded));
    }

    #[tokio::test]
    async fn start_fails_when_a_sink_cannot_listen() {
        let store = MemoryStore::new();
        let config = pipeline_config(
            vec![
                node(
                    "source",
                    "memory",
                    None,
                    json!({"uri": "memory://", "namespace": "shop.orders", "tail": true}),
                ),
                node(
                    "copy",
                    "memory",
                    Some("source"),
                    json!({"uri": "memory://", "namespace": "copy./.*/"}),
                ),
                node("broken", "broken", Some("source"), json!({})),
            ],
            None,
        );

        let mut pipeline = Pipeline::new(config, &registry(&store)).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), pipeline.start())
            .await
            .expect("start returned")
            .unwrap_err();

        assert_eq!(err.kinds(), vec![ErrorKind::DestinationError]);
        for node in &pipeline.nodes {
            assert_eq!(node.pipe.state(), PipeState::Stopped, "{}", node.path);
        }

        pipeline.wait().await.unwrap();
    }

    #[tokio::test]
    async fn wait_without_start_returns() {
        let store = MemoryStore::new();
        let config = pipeline_config(
            vec![node("source", "memory", None, json!({"uri": "memory://", "namespace": "a.b"}))],
            None,
        );

        let pipeline = Pipeline::new(config, &registry(&store)).unwrap();
        pipeline.shutdown_and_wait().await.unwrap();
    }
}
