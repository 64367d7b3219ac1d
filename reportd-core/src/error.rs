//! Error types for reportd-core
//!
//! Each collaborator has its own error type. The collector folds transport,
//! storage and lifecycle failures into a single [`ReportingError`] at its
//! construction and startup boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for configuration and logging setup
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for configuration and logging setup
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// IO error while reading or writing spooled interactions
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A spooled interaction could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The filesystem watcher failed
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Transport misconfiguration
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport does not implement this operation
    #[error("{transport} does not support {operation}")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },

    /// The transport has been shut down or its channel disconnected
    #[error("transport is closed")]
    Closed,

    /// An in-process transport failed to write to its storage
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend is reachable but not usable as configured
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend has been shut down
    #[error("storage is closed")]
    Closed,
}

/// Errors raised while taking the pidfile lock.
#[derive(Error, Debug)]
pub enum PidFileError {
    /// Another process holds the lock
    #[error("pid file {} is locked{}", path.display(), owner.map(|pid| format!(" by pid {pid}")).unwrap_or_default())]
    Locked { path: PathBuf, owner: Option<u32> },

    /// The pid file could not be created, locked or written
    #[error("failed to write pid file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Construction and startup failures of the collector.
#[derive(Error, Debug)]
pub enum ReportingError {
    /// The configured transport could not be created
    #[error("failed to load transport: {0}")]
    Transport(#[source] TransportError),

    /// The transport could not start producing interactions
    #[error("failed to start transport monitor: {0}")]
    Monitor(#[source] TransportError),

    /// The configured storage backend could not be created
    #[error("failed to load storage: {0}")]
    Storage(#[source] StorageError),

    /// The transport writes to storage in-process and cannot feed a collector
    #[error("{transport} cannot be used with the collector, use local_filesystem instead")]
    IncompatibleTransport { transport: String },

    /// Storage validation failed while strict validation is enabled
    #[error("storage backend {storage} failed to validate: {source}")]
    Validation {
        storage: String,
        #[source]
        source: StorageError,
    },

    /// The pidfile lock could not be acquired
    #[error("error writing pid file: {0}")]
    PidFile(#[from] PidFileError),

    /// Detaching from the controlling terminal failed
    #[error("failed to daemonize: {0}")]
    Daemonize(#[source] std::io::Error),

    /// The storage backend could not reopen its handles in the daemon process
    #[error("failed to reopen storage after detaching: {0}")]
    Reopen(#[source] StorageError),

    /// The storage backend failed to release its resources
    #[error("storage shutdown failed: {0}")]
    Shutdown(#[source] StorageError),
}
