//! Shared configuration types for ferry pipelines.

mod base;
mod bulk;
mod pipeline;
mod replicator;

pub use base::ValidationError;
pub use bulk::BulkConfig;
pub use pipeline::{NodeConfig, NodeOptions, PipelineConfig};
pub use replicator::ReplicatorConfig;
