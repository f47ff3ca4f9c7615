//! Helpers shared by unit and integration tests.
//!
//! - [`bulk`] - bulk services recording every committed batch
//! - [`client`] - clients counting connects and closes of their sessions
//! - [`notify`] - notifications that fail a test instead of hanging it
pub mod bulk;
pub mod client;
pub mod notify;
