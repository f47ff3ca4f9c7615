//! Adaptors connecting stores to a pipeline.
//!
//! An [`Adaptor`] is bound to one [`crate::pipe::Pipe`] for its whole life. A source pumps the
//! messages its reader yields into the pipe from [`Adaptor::start`], a sink consumes the pipe
//! from [`Adaptor::listen`] and writes every matching message through its client. Adaptors are
//! built by name through an [`AdaptorRegistry`] from an untyped [`AdaptorConfig`].

pub mod elasticsearch;
pub mod file;
pub mod memory;
mod pump;
pub mod registry;
pub mod transformer;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use registry::{AdaptorConstructor, AdaptorRegistry};

use crate::bail;
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;
use crate::message::{Data, split_namespace};

/// Configuration key holding the namespace an adaptor reads or writes.
pub const NAMESPACE_KEY: &str = "namespace";

/// Route and listen pattern that matches every namespace.
pub const MATCH_ALL: &str = ".*";

/// Lifecycle of a store bound to a pipe.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// One line describing what the adaptor does.
    fn description(&self) -> &'static str;

    /// Example configuration of a node using this adaptor.
    fn sample_config(&self) -> &'static str;

    /// Verifies that the store is reachable with the configured settings.
    async fn connect(&self) -> FerryResult<()>;

    /// Reads from the store and sends every message into the pipe.
    ///
    /// Returns once the store is exhausted or [`Adaptor::stop`] was called. Adaptors that can
    /// only write keep the default, which rejects the call.
    async fn start(&self) -> FerryResult<()> {
        bail!(
            ErrorKind::InvalidState,
            "Adaptor cannot be used as a source",
            self.description()
        );
    }

    /// Consumes the pipe and writes every message until the pipe is stopped.
    async fn listen(&self) -> FerryResult<()>;

    /// Stops the adaptor and releases its sessions. Calling it again is a no-op.
    async fn stop(&self) -> FerryResult<()>;
}

/// Untyped adaptor settings as found in a pipeline node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptorConfig(Data);

impl AdaptorConfig {
    pub fn new(options: Data) -> Self {
        Self(options)
    }

    /// Decodes the settings into the adaptor-specific configuration type.
    pub fn construct<T>(&self) -> FerryResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|err| {
            ferry_error!(
                ErrorKind::ConfigError,
                "Invalid adaptor configuration",
                err.to_string(),
                source: err
            )
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the string value of `key`, if it is set to a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Splits the configured namespace into its database and a collection matcher.
    pub fn compile_namespace(&self) -> FerryResult<(String, Regex)> {
        let Some(namespace) = self.get_str(NAMESPACE_KEY) else {
            bail!(
                ErrorKind::ConfigError,
                "Adaptor configuration has no namespace",
                "the `namespace` option is required"
            );
        };

        compile_namespace(namespace)
    }

    pub fn into_inner(self) -> Data {
        self.0
    }
}

impl From<Data> for AdaptorConfig {
    fn from(options: Data) -> Self {
        Self(options)
    }
}

/// Splits `namespace` into its database and a regex matching collection names.
///
/// A collection written as `/pattern/` is used as a regex verbatim, any other collection
/// matches exactly itself.
pub fn compile_namespace(namespace: &str) -> FerryResult<(String, Regex)> {
    let (database, collection) = split_namespace(namespace)?;
    let pattern = collection_pattern(collection);

    Ok((database.to_string(), Regex::new(&pattern)?))
}

/// Builds the pipe route pattern selecting the messages of `namespace`.
///
/// The result matches full `database.collection` namespaces. The database must match exactly,
/// the collection as [`compile_namespace`] matches it.
pub fn namespace_route_pattern(namespace: &str) -> FerryResult<String> {
    let (database, collection) = split_namespace(namespace)?;
    let database = regex::escape(database);

    let Some(inner) = regex_collection(collection) else {
        return Ok(format!("^{database}\\.{collection}$"));
    };

    let (anchored_start, inner) = match inner.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let (anchored_end, inner) = match inner.strip_suffix('$') {
        Some(rest) if !rest.ends_with('\\') => (true, rest),
        _ => (false, inner),
    };

    let pattern = format!(
        "^{database}\\.{}(?:{inner}){}$",
        if anchored_start { "" } else { ".*?" },
        if anchored_end { "" } else { ".*" }
    );
    Regex::new(&pattern)?;

    Ok(pattern)
}

fn collection_pattern(collection: &str) -> String {
    match regex_collection(collection) {
        Some(inner) => inner.to_string(),
        None => format!("^{collection}$"),
    }
}

fn regex_collection(collection: &str) -> Option<&str> {
    collection
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
}
