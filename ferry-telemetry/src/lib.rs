//! Logging and metrics setup shared by ferry binaries and tests.

pub mod metrics;
pub mod tracing;
