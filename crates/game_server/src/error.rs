//! Server error types.

use thiserror::Error;

/// Errors that can stop the server from starting or running.
///
/// Per-connection failures never surface here; they dispose the one
/// connection involved and are logged.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Socket creation, bind or accept failures
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime or invariant failures inside the server
    #[error("Internal error: {0}")]
    Internal(String),
}
