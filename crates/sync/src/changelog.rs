//! Exposes a shard's mutation history as a replayable sequence for the
//! sync engine, without the engine needing to know how storage persists
//! it.

use synapse_core::ChangelogEntry;
use synapse_core::VersionVector;
use synapse_storage::ShardStorage;

use crate::error::SyncResult;

/// The changelog surface the sync engine depends on. Implemented by
/// [`synapse_storage::ShardStorage`]; kept as a trait so the engine and
/// its tests can stand in a fake without pulling in the SQL substrate.
pub trait ChangelogReader {
    /// The highest change id appended so far.
    fn latest_change_id(&self) -> u64;

    /// Every change with `change_id > from_change_id_exclusive`, ordered
    /// by `change_id`. Stable for a given `(shard, from)` pair unless new
    /// changes are appended meanwhile.
    fn read_changes(&self, from_change_id_exclusive: u64) -> SyncResult<Vec<ChangelogEntry>>;

    /// The shard's current version vector.
    fn version_vector(&self) -> VersionVector;

    /// Apply an entry learned from a peer to local storage.
    fn apply_remote_change(&self, entry: &ChangelogEntry) -> SyncResult<()>;
}

impl ChangelogReader for ShardStorage {
    fn latest_change_id(&self) -> u64 {
        ShardStorage::latest_change_id(self)
    }

    fn read_changes(&self, from_change_id_exclusive: u64) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(ShardStorage::read_changes(self, from_change_id_exclusive)?)
    }

    fn version_vector(&self) -> VersionVector {
        ShardStorage::version_vector(self)
    }

    fn apply_remote_change(&self, entry: &ChangelogEntry) -> SyncResult<()> {
        Ok(ShardStorage::apply_remote_change(self, entry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use synapse_core::{ChangeOp, ShardId, VectorId, VectorRecord};
    use synapse_storage::SqlSubstrate;

    fn storage() -> ShardStorage {
        let substrate = Arc::new(SqlSubstrate::open(None).unwrap());
        ShardStorage::open(substrate, ShardId::new("s"), 2, "node-a").unwrap()
    }

    #[test]
    fn reader_trait_delegates_to_shard_storage() {
        let s = storage();
        s.insert(VectorRecord::new(VectorId::from(""), vec![1.0, 2.0], None))
            .unwrap();

        let reader: &dyn ChangelogReader = &s;
        assert_eq!(reader.latest_change_id(), 1);
        let changes = reader.read_changes(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, ChangeOp::Insert);
        assert_eq!(reader.version_vector().get("node-a"), 1);
    }
}
