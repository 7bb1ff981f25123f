//! Identifier types.
//!
//! Three distinct id spaces are in play and it is a bug to confuse them:
//!
//! - [`VectorId`] is the caller-facing, caller-chosen (or generated) string
//!   id of a vector record. Stable and unique within a shard.
//! - [`ShardId`] names a shard within a database.
//! - [`NodeId`] is the HNSW graph's own internal node identifier, a
//!   monotonically increasing counter local to one shard's index. It is
//!   never reused and is unrelated to `VectorId` except via the index's
//!   node → vector back-reference.

use std::fmt;
use uuid::Uuid;

/// Caller-facing vector identifier. Stable and unique within a shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct VectorId(pub String);

impl VectorId {
    /// Generate a fresh, practically-unique id.
    ///
    /// The specification leaves id generation as an implementation choice
    /// (see Open Questions): the source this is adapted from produced
    /// non-deterministic ids, and nothing in the contract requires
    /// determinism here, so a random UUID is used.
    pub fn generate() -> Self {
        VectorId(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for VectorId {
    fn from(s: String) -> Self {
        VectorId(s)
    }
}

impl From<&str> for VectorId {
    fn from(s: &str) -> Self {
        VectorId(s.to_string())
    }
}

impl fmt::Display for VectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a shard within a database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    /// Build a shard id from any stringlike value.
    pub fn new(name: impl Into<String>) -> Self {
        ShardId(name.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal HNSW node identifier. Monotonically increasing per-shard,
/// never reused, distinct from [`VectorId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Wrap a raw counter value.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// The underlying counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Identifies a sync peer / replica. Also doubles as the key in a
/// [`crate::VersionVector`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeName(pub String);

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        NodeName(s.to_string())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_id_generate_is_unique() {
        let a = VectorId::generate();
        let b = VectorId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn node_id_ordering() {
        let a = NodeId::new(1);
        let b = NodeId::new(2);
        assert!(a < b);
    }

    #[test]
    fn shard_id_display() {
        let s = ShardId::new("memories");
        assert_eq!(s.to_string(), "memories");
    }
}
