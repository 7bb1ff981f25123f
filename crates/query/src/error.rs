//! Errors for the query engine.

use synapse_core::error::CoreError;
use synapse_index::IndexError;
use synapse_quant::QuantError;
use synapse_storage::StorageError;
use thiserror::Error;

/// Errors raised while evaluating a search.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query embedding's length didn't match the shard's dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed for the shard being queried.
        expected: usize,
        /// Dimension of the embedding actually supplied.
        got: usize,
    },

    /// `Metric::parse` rejected an unrecognized metric name.
    #[error("invalid metric: {0}")]
    InvalidMetric(#[from] CoreError),

    /// The underlying storage scan failed.
    #[error("query storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The HNSW index failed during candidate generation.
    #[error("query index failure: {0}")]
    Index(#[from] IndexError),

    /// The quantizer failed while computing an asymmetric distance.
    #[error("query quantizer failure: {0}")]
    Quant(#[from] QuantError),
}

/// Result alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;
