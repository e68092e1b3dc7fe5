//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the artifact store, the
//! remote catalog, the downloader and the runner supervisor.

use std::time::Duration;
use thiserror::Error;

/// Result type for Model Depot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Model Depot operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Artifact absent from the local store
    #[error("Not found: {0}")]
    NotFound(String),

    /// The catalog listed no files that pass the download filter
    #[error("No downloadable files found for {0}")]
    NoDownloadableFiles(String),

    /// Catalog unreachable or returned something unusable
    #[error("Remote manifest error: {0}")]
    RemoteManifest(String),

    /// The remote answered 401 or 403
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// A single file transfer failed
    ///
    /// `preserved_bytes` is the size of the `.part` file left behind for a
    /// later resume, zero when nothing was kept.
    #[error("Transfer of {file} failed: {message}")]
    Transfer {
        /// File name relative to the artifact directory
        file: String,
        /// What went wrong
        message: String,
        /// Bytes kept on disk for resumption
        preserved_bytes: u64,
    },

    /// The worker could not be started (or died before becoming healthy)
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker never answered its health probe with success
    #[error("Worker not healthy after {}ms: {last}", .waited.as_millis())]
    HealthTimeout {
        /// How long the supervisor waited
        waited: Duration,
        /// Last diagnostic captured from a failed probe
        last: String,
    },

    /// The worker refused the load command
    #[error("Worker rejected load (HTTP {status}): {message}")]
    LoadRejected {
        /// HTTP status returned by the worker
        status: u16,
        /// Response body
        message: String,
    },

    /// Error during an established completion stream
    #[error("Backend failure: {0}")]
    BackendFailure(String),

    /// Caller-driven abort
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a transfer error for `file`
    pub fn transfer(file: impl Into<String>, message: impl Into<String>, preserved_bytes: u64) -> Self {
        Error::Transfer {
            file: file.into(),
            message: message.into(),
            preserved_bytes,
        }
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if the operation was cancelled by the caller
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Returns true if the remote asked for credentials
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Error::AuthRequired(_))
    }

    /// Returns true if the error is a health timeout
    pub fn is_health_timeout(&self) -> bool {
        matches!(self, Error::HealthTimeout { .. })
    }

    /// Returns true if a later attempt can pick up where this one stopped
    pub fn is_resumable(&self) -> bool {
        match self {
            Error::Transfer { preserved_bytes, .. } => *preserved_bytes > 0,
            Error::Cancelled(_) => true,
            _ => false,
        }
    }
}
