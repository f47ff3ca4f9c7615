use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::adaptor::elasticsearch::ElasticsearchAdaptor;
use crate::adaptor::file::FileAdaptor;
use crate::adaptor::memory::{MemoryAdaptor, MemoryStore};
use crate::adaptor::transformer::TransformerAdaptor;
use crate::adaptor::{Adaptor, AdaptorConfig};
use crate::bail;
use crate::error::{ErrorKind, FerryResult};
use crate::pipe::Pipe;

/// Builds an adaptor bound to `pipe` at `path` from its configuration.
pub type AdaptorConstructor =
    Arc<dyn Fn(Pipe, String, AdaptorConfig) -> FerryResult<Box<dyn Adaptor>> + Send + Sync>;

/// Name to constructor map of the adaptors a pipeline can be built from.
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    constructors: BTreeMap<String, AdaptorConstructor>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a registry with every built-in adaptor.
    ///
    /// Memory adaptors built from it share `store`.
    pub fn with_builtins(store: MemoryStore) -> Self {
        let mut registry = Self::new();

        registry.register("file", |pipe, path, config| {
            Ok(Box::new(FileAdaptor::new(pipe, path, &config)?) as Box<dyn Adaptor>)
        });
        registry.register("elasticsearch", |pipe, path, config| {
            Ok(Box::new(ElasticsearchAdaptor::new(pipe, path, &config)?) as Box<dyn Adaptor>)
        });
        registry.register("memory", move |pipe, path, config| {
            Ok(
                Box::new(MemoryAdaptor::new(pipe, path, &config, store.clone())?)
                    as Box<dyn Adaptor>,
            )
        });
        registry.register("transformer", |pipe, path, config| {
            Ok(Box::new(TransformerAdaptor::new(pipe, path, &config)?) as Box<dyn Adaptor>)
        });

        registry
    }

    /// Registers `constructor` under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Pipe, String, AdaptorConfig) -> FerryResult<Box<dyn Adaptor>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(adaptor = %name, "adaptor registered");
        self.constructors.insert(name, Arc::new(constructor));
    }

    /// Builds the adaptor registered under `name`.
    pub fn build(
        &self,
        name: &str,
        pipe: Pipe,
        path: impl Into<String>,
        config: AdaptorConfig,
    ) -> FerryResult<Box<dyn Adaptor>> {
        let Some(constructor) = self.constructors.get(name) else {
            bail!(
                ErrorKind::AdaptorNotFound,
                "No adaptor registered under this name",
                format!("unknown adaptor `{name}`, known adaptors: {}", self.names().join(", "))
            );
        };

        constructor(pipe, path.into(), config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Returns the registered names in lexicographic order.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("adaptors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::pipe::create_error_channel;

    fn options(value: serde_json::Value) -> AdaptorConfig {
        match value {
            serde_json::Value::Object(map) => AdaptorConfig::new(map),
            _ => panic!("options must be an object"),
        }
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let registry = AdaptorRegistry::with_builtins(MemoryStore::new());

        assert_eq!(
            registry.names(),
            vec!["elasticsearch", "file", "memory", "transformer"]
        );
    }

    #[tokio::test]
    async fn builds_registered_adaptor() {
        let (errors, _errors_rx) = create_error_channel();
        let registry = AdaptorRegistry::with_builtins(MemoryStore::new());

        let adaptor = registry
            .build(
                "memory",
                Pipe::new("source", errors),
                "source",
                options(json!({"uri": "memory://", "namespace": "shop./.*/"})),
            )
            .unwrap();

        assert!(!adaptor.description().is_empty());
        assert!(adaptor.sample_config().contains("memory"));
    }

    #[tokio::test]
    async fn unknown_adaptor_is_rejected() {
        let (errors, _errors_rx) = create_error_channel();
        let registry = AdaptorRegistry::new();

        let err = registry
            .build(
                "rethinkdb",
                Pipe::new("source", errors),
                "source",
                AdaptorConfig::default(),
            )
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::AdaptorNotFound);
        assert!(err.is_fatal());
    }
}
