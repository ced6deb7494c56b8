//! Error types for the ingestion agent.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tailing and shipping the query log.
#[derive(Error, Debug)]
pub enum Error {
    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (checkpoint file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A schema migration failed; startup must not continue.
    #[error("Migration {version} failed: {message}")]
    Migration {
        /// Version of the failing migration.
        version: u32,
        /// Underlying failure.
        message: String,
    },

    /// The collector is already running.
    #[error("collector is already running")]
    AlreadyRunning,

    /// The collector is not running.
    #[error("collector is not running")]
    NotRunning,

    /// The sink was closed during shutdown.
    #[error("sink is closed")]
    SinkClosed,

    /// Checkpoint store error.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Core crate error (metrics setup).
    #[error(transparent)]
    Core(#[from] dnslog_core::Error),
}
