//! Embedded persistence for one shard: an append-only vector table, the
//! changelog feeding sync, and the `SqlSubstrate` every other module in
//! this crate funnels its SQL through.
//!
//! Builds on [`synapse_core`] for ids, records, changelog entries and
//! version vectors; nothing above this crate in the dependency order
//! (`synapse-index`, `synapse-query`, ...) issues SQL of its own — they
//! call through [`substrate::SqlSubstrate`] or [`ShardStorage`].

pub mod codec;
pub mod error;
pub mod shard;
pub mod substrate;

pub use error::{StorageError, StorageResult};
pub use shard::{ScanCursor, ShardStats, ShardStorage};
pub use substrate::SqlSubstrate;
