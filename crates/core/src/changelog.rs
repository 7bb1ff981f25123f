//! The changelog entry: the unit of mutation history replicated by the
//! sync engine and replayed to reconstruct shard state.

use crate::ids::{ShardId, VectorId};
use crate::version_vector::VersionVector;
use serde_json::Value as JsonValue;

/// The kind of mutation a changelog entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeOp {
    /// A new vector record was created.
    Insert,
    /// An existing vector record's embedding and/or metadata was replaced.
    Update,
    /// A vector record was removed. Retained as a tombstone so peers can
    /// propagate the deletion.
    Delete,
}

/// One entry in a shard's append-only changelog.
///
/// Invariant: within a shard, `change_id` is strictly increasing and
/// gap-free across the shard's lifetime; replaying the log from any point
/// reconstructs current state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangelogEntry {
    /// Monotonically increasing, per-shard sequence number.
    pub change_id: u64,
    /// Shard this change belongs to.
    pub shard_id: ShardId,
    /// Vector affected by this change.
    pub vector_id: VectorId,
    /// What kind of mutation this was.
    pub op: ChangeOp,
    /// New embedding, present for insert/update.
    pub embedding: Option<Vec<f32>>,
    /// New metadata, present for insert/update when metadata was supplied.
    pub metadata: Option<JsonValue>,
    /// Node that originated this change (this node's name for local
    /// writes, the remote's for changes learned via sync).
    pub source_node: String,
    /// Microseconds since the Unix epoch when the mutation was applied.
    pub timestamp_us: u64,
    /// Version vector as of this change.
    pub version_vector: VersionVector,
}

impl ChangelogEntry {
    /// `true` if this entry is a delete tombstone.
    pub fn is_delete(&self) -> bool {
        matches!(self.op, ChangeOp::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op: ChangeOp, source: &str) -> ChangelogEntry {
        ChangelogEntry {
            change_id: 1,
            shard_id: ShardId::new("s"),
            vector_id: VectorId::from("v"),
            op,
            embedding: None,
            metadata: None,
            source_node: source.to_string(),
            timestamp_us: 0,
            version_vector: VersionVector::single(source, 1),
        }
    }

    #[test]
    fn is_delete_reflects_op() {
        assert!(entry(ChangeOp::Delete, "A").is_delete());
        assert!(!entry(ChangeOp::Insert, "A").is_delete());
    }
}
