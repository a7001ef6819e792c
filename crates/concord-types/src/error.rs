//! Shared error types for Concord.

use thiserror::Error;

/// Top-level error type for applications embedding the Concord transport.
#[derive(Error, Debug)]
pub enum ConcordError {
    /// A configuration value is missing or out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred outside of an established connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A transport-level failure, carried as text so this crate stays
    /// independent of the wire crate.
    #[error("Wire error: {0}")]
    Wire(String),
}

/// Alias for Result with ConcordError.
pub type ConcordResult<T> = Result<T, ConcordError>;
