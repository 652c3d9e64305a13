//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `pika-rs`.
pub type PikaResult<T> = Result<T, PikaError>;

/// High-level error categories shared by every crate in the workspace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PikaError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client protocol payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(String),

    /// Storage engine or backup engine failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Binlog or replication handshake failure.
    #[error("replication error: {0}")]
    Replication(String),
}

impl PikaError {
    /// Wraps an `std::io::Error` with a short description of the failed action.
    #[must_use]
    pub fn io(action: &str, error: &std::io::Error) -> Self {
        Self::Io(format!("{action} failed: {error}"))
    }
}
