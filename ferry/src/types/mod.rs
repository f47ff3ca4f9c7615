//! Common types used throughout the pipeline.

mod sized;

pub use sized::*;
