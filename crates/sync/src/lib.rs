//! Cross-node replication: reading a shard's changelog, packaging it into
//! deltas, resolving conflicting concurrent writes, driving the
//! request/response/push sync procedure over a pluggable transport, and
//! scheduling that work across many `(shard, peer)` pairs.
//!
//! Sits above [`synapse_storage`] (for the changelog and applying
//! inbound changes) and below the facade, which owns the actual
//! `(ShardId, peer)` registry and wires a [`transport::SyncTransport`]
//! to a [`engine::SyncEngine`].

pub mod changelog;
pub mod conflict;
pub mod coordinator;
pub mod delta;
pub mod engine;
pub mod error;
pub mod message;
pub mod transport;

pub use changelog::ChangelogReader;
pub use conflict::{Conflict, ConflictStrategy, Resolution};
pub use coordinator::{CoordinatorStats, PeerInfo, PeerStatus, ShardCoordinator};
pub use delta::Compression;
pub use engine::{SyncConfig, SyncEngine, SyncOutcome};
pub use error::{SyncError, SyncResult};
pub use message::{SyncMessage, SyncPush, SyncRequest, SyncResponse};
pub use transport::{SyncTransport, UdpTransport};
