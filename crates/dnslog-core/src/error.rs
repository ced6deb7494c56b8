//! Error types shared by the dnslog crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the core helpers.
#[derive(Error, Debug)]
pub enum Error {
    /// The Prometheus recorder could not be installed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
