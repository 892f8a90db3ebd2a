//! Error types for key store operations

/// Errors from key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record with the same value already exists.
    #[error("key already present: {0}")]
    Conflict(String),

    #[error("key store I/O error: {0}")]
    Io(String),

    #[error("key store parse error: {0}")]
    Parse(String),
}

/// Result alias for key store operations.
pub type Result<T> = std::result::Result<T, Error>;
