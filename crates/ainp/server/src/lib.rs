//! AINP broker daemon library.
//!
//! Exposes the server wiring for the `ainpd` binary and for integration
//! tests that drive the full stack against in-memory backends.

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod resolver;
pub mod server;

pub use config::BrokerConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
