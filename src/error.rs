//! The facade's unified error type.
//!
//! Every layer below has its own `thiserror` enum scoped to that layer;
//! `DbError` is where they all land, each converted with `#[from]` the
//! same way a lower-level error gets folded into the next crate's own
//! enum all the way down the dependency chain.

use thiserror::Error;

/// Errors a [`crate::Database`] call can return.
#[derive(Debug, Error)]
pub enum DbError {
    /// A caller-supplied argument failed validation before anything was
    /// touched (bad dimension, empty id, unknown shard name syntax, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A shard, vector, or sync peer name did not resolve to anything.
    #[error("not found: {0}")]
    NotFound(String),

    /// `create_shard` was called with a name already in use.
    #[error("duplicate shard: {0}")]
    DuplicateShard(String),

    /// A search asked for approximate quantized scoring, or a two-stage
    /// prefilter, against a codec that hasn't been trained yet.
    #[error("not trained: {0}")]
    NotTrained(String),

    /// The database handle was used after [`crate::Database::close`].
    #[error("database is not initialized or has been closed")]
    NotInitialized,

    /// A sync round ended in a conflict the configured strategy could
    /// not resolve automatically (only reachable under
    /// [`synapse_sync::ConflictStrategy::Manual`]).
    #[error("unresolved conflict: {0}")]
    Conflict(String),

    /// Reading, parsing or validating `synapsedb.toml` failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A filesystem operation (config file, data directory) failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] synapse_core::CoreError),

    #[error(transparent)]
    Storage(#[from] synapse_storage::StorageError),

    #[error(transparent)]
    Index(#[from] synapse_index::IndexError),

    #[error(transparent)]
    Quant(#[from] synapse_quant::QuantError),

    #[error(transparent)]
    Query(#[from] synapse_query::QueryError),

    #[error(transparent)]
    Sync(#[from] synapse_sync::SyncError),
}

/// Result alias for facade operations.
pub type DbResult<T> = Result<T, DbError>;
