//! Errors for the HNSW index.

use synapse_storage::StorageError;
use thiserror::Error;

/// Errors raised by [`crate::HnswIndex`].
#[derive(Debug, Error)]
pub enum IndexError {
    /// A query or insert embedding didn't match the index's fixed dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed at index creation.
        expected: usize,
        /// Dimension of the value actually supplied.
        got: usize,
    },

    /// The storage engine's transaction failed while flushing or loading
    /// the graph; the in-memory graph was discarded and `built` stays
    /// `false`.
    #[error("index storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The persisted graph references a node or vector that no longer
    /// exists in storage. The caller is advised to rebuild the index.
    #[error("index inconsistent with storage: {0}")]
    Inconsistent(String),
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
