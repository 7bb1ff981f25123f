//! Embedded vector database for agent long-term memory: per-shard
//! storage, approximate nearest-neighbour search, optional vector
//! quantization, a query-result cache, and peer-to-peer sync, fronted
//! by one [`Database`] handle.
//!
//! # Layout
//!
//! - [`synapse_core`] — ids, the vector record, version vectors, the
//!   changelog entry shape.
//! - [`synapse_storage`] — the embedded SQL substrate and per-shard CRUD.
//! - [`synapse_index`] — the HNSW approximate index.
//! - [`synapse_quant`] — scalar/product/binary vector quantization.
//! - [`synapse_query`] — the search pipeline tying storage, index and
//!   quantizer together.
//! - [`synapse_cache`] — the query-result cache sitting in front of it.
//! - [`synapse_sync`] — changelog-based replication between peers.
//! - this crate — [`Database`] and [`Shard`], the facade wiring all of
//!   the above into one handle per the configuration in
//!   [`DatabaseConfig`].
//!
//! ```no_run
//! use synapsedb::{Database, DatabaseConfig};
//!
//! # fn main() -> synapsedb::DbResult<()> {
//! let db = Database::open(DatabaseConfig::in_memory(768))?;
//! let shard = db.create_shard("memories")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod shard;

pub use config::{CacheSettings, DatabaseConfig, HnswSettings, QuantizerSettings, SyncSettings, CONFIG_FILE_NAME};
pub use database::Database;
pub use error::{DbError, DbResult};
pub use shard::Shard;

// Re-exported so callers can build records, ids and search params without
// depending on the lower crates directly.
pub use synapse_core::{ChangeOp, ChangelogEntry, ShardId, VectorId, VectorRecord, VersionVector};
pub use synapse_query::{Filter, OrderBy, QueryBuilder, SearchHit, SearchParams, SortDirection};
pub use synapse_quant::{AccuracyReport, QuantizerKind};
pub use synapse_storage::ShardStats;
pub use synapse_sync::{CoordinatorStats, PeerInfo, PeerStatus, SyncOutcome};
