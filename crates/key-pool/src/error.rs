//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No alive key exists.
    #[error("pool exhausted: no alive keys")]
    PoolExhausted,

    /// Every claim attempt lost to a concurrent caller.
    #[error("key pool contention: gave up after {0} conflicting claims")]
    Contention(u32),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Store(#[from] keystore::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
