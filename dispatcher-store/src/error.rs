//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur while reading from or writing to a [`crate::Store`].
///
/// Every variant here is a candidate for `DispatchError::StorageTransient`
/// (or `StorageFatal` at startup) once it crosses into `dispatcher-core`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The embedded database reported an I/O or corruption error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A stored document failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A lookup that is expected to always find a row found none (e.g. a
    /// command record referenced by an id the caller just inserted).
    #[error("expected record not found: {0}")]
    NotFound(String),

    /// A monotonic counter (e.g. the run-number allocator) could not be
    /// advanced, typically because the store is shutting down.
    #[error("counter unavailable: {0}")]
    CounterUnavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
