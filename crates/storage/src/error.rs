//! Errors for the storage engine.

use thiserror::Error;

/// Errors raised by [`crate::ShardStorage`] and the underlying
/// [`crate::substrate::SqlSubstrate`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// `insert` was called with an id that already exists.
    #[error("vector id already exists: {0}")]
    DuplicateId(String),

    /// `update`/`delete`/`get` were called with an id that does not exist.
    #[error("vector id not found: {0}")]
    NotFound(String),

    /// A stored or supplied embedding's byte length didn't decode to a
    /// whole number of `f32`s, or didn't match the shard's dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed for this shard.
        expected: usize,
        /// Dimension implied by the value actually supplied.
        got: usize,
    },

    /// The underlying SQL substrate reported a failure; the transaction
    /// was rolled back and the shard is unchanged.
    #[error("storage transaction failed: {0}")]
    TransactionFailed(String),

    /// A stored blob (metadata, embedding, quantizer state, version
    /// vector) failed to decode.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// The underlying SQL substrate returned an error not covered by a
    /// more specific variant above.
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
