//! Tasks running the lifecycle methods of adaptors.

pub mod adaptor;
pub mod base;
