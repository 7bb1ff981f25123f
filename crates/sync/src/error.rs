//! Errors for the sync engine, delta codec and transports.

use thiserror::Error;

/// Errors raised by [`crate::delta`], [`crate::engine`] and their
/// supporting modules.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The underlying shard storage reported a failure.
    #[error(transparent)]
    Storage(#[from] synapse_storage::StorageError),

    /// A delta's integrity check failed, or its wire-format version is not
    /// one this build understands. The receiver does not attempt a
    /// partial decode.
    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    /// The transport reported a failure sending or receiving a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// A sync request exceeded its configured timeout.
    #[error("sync with {peer} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Peer address the request was addressed to.
        peer: String,
        /// How long the engine waited before giving up.
        elapsed_ms: u64,
    },

    /// A task was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,

    /// Session state persisted in the substrate failed to decode.
    #[error("corrupt sync session state: {0}")]
    CorruptSession(String),
}

/// Result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
