//! Change-data-capture pipelines.
//!
//! A [`pipeline::Pipeline`] moves insert, update and delete messages from one source store to
//! any number of sink stores. Stores plug in as [`adaptor::Adaptor`]s built by name from an
//! [`adaptor::AdaptorRegistry`], messages flow between them through a tree of [`pipe::Pipe`]s
//! and sinks that commit in batches do so through a [`bulk::BulkProcessor`].

pub mod adaptor;
pub mod bulk;
pub mod client;
pub mod concurrency;
pub mod error;
mod macros;
pub mod message;
pub mod metrics;
pub mod pipe;
pub mod pipeline;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
