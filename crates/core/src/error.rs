//! Error primitives shared by every layer.
//!
//! Each crate above this one defines its own `thiserror`-derived error enum
//! scoped to its layer and converts `CoreError` into it with `#[from]`,
//! mirroring the way the teacher threads a shared foundation error up
//! through its per-primitive error types.

use thiserror::Error;

/// Errors that can occur while working with the shared primitives in this
/// crate (ids, metrics, version vectors).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A query or insert embedding did not match the shard's fixed dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed at shard creation.
        expected: usize,
        /// Dimension of the value actually supplied.
        got: usize,
    },

    /// An unrecognised metric name was supplied (e.g. over a config file or
    /// wire message).
    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    /// A malformed id string could not be parsed.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

/// Result alias for operations in this crate.
pub type CoreResult<T> = Result<T, CoreError>;
