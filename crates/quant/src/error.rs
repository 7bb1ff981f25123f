//! Errors for the quantization layer.

use thiserror::Error;

/// Errors raised by a [`crate::Quantizer`].
#[derive(Debug, Error)]
pub enum QuantError {
    /// `train` was called with no samples.
    #[error("cannot train a quantizer on an empty sample")]
    EmptySample,

    /// `encode`/`asymmetric_distance` was called before `train`.
    #[error("quantizer has not been trained")]
    NotTrained,

    /// A vector's length didn't match the dimension fixed at training time.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed at training time.
        expected: usize,
        /// Dimension of the value actually supplied.
        got: usize,
    },

    /// Product quantizer training requires `dimension % subvectors == 0`.
    #[error("dimension {dimension} is not evenly divisible by {subvectors} subvectors")]
    IndivisibleSubvectors {
        /// Embedding dimension.
        dimension: usize,
        /// Requested subvector count `M`.
        subvectors: usize,
    },

    /// A codec state blob failed to parse (bad header, truncated, or
    /// inconsistent with the requested codec kind).
    #[error("corrupt quantizer state: {0}")]
    CorruptState(String),
}

/// Result alias for quantizer operations.
pub type QuantResult<T> = Result<T, QuantError>;
