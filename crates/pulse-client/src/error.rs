//! Error types for the pulse client.

use std::path::PathBuf;

use pulse_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while starting or running the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration is missing or invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What is wrong.
        msg: String,
    },

    /// The configured transport directory does not exist.
    #[error("transport directory does not exist: {}", path.display())]
    TransportDirMissing {
        /// The configured path.
        path: PathBuf,
    },

    /// The transport could not be constructed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connect wait was cancelled.
    #[error("connect cancelled")]
    Cancelled,

    /// No session was established within the configured timeout.
    #[error("not connected after {timeout_ms}ms")]
    ConnectTimeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// Config file could not be read.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
