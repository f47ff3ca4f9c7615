//! Concurrency utilities for coordinating pipeline tasks.
//!
//! # Coordination Patterns
//!
//! ## Graceful Shutdown
//!
//! The [`shutdown`] module implements a one-shot broadcast where a single signal reaches every
//! reader stream, listen loop and bulk ticker. Adaptors pair it with a completion counter so that
//! `stop` only returns after each long-lived session has been flushed and released.
//!
//! ## Stream Processing
//!
//! The [`stream`] module integrates the shutdown signal into reader streams, ending them before
//! the next element once shutdown was requested.

pub mod shutdown;
pub mod stream;
