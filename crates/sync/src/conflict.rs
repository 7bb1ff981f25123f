//! Resolves concurrent writes to the same vector id learned from two
//! different changelogs.

use std::collections::HashMap;
use synapse_core::{ChangeOp, ChangelogEntry, VectorId, VersionOrdering};

/// Which strategy a shard uses to settle a concurrent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// The larger `timestamp_us` wins; ties broken by the lexicographically
    /// larger `source_node`.
    LastWriteWins,
    /// The smaller `timestamp_us` wins.
    FirstWriteWins,
    /// Deletes always win; otherwise metadata is shallow-merged (local
    /// takes precedence on key collisions), embeddings are averaged
    /// element-wise, the version vector is the per-key maximum, and the
    /// timestamp is the larger of the two.
    Merge,
    /// No automatic resolution: the local entry applies provisionally and
    /// the pair is recorded as an unresolved [`Conflict`].
    Manual,
}

/// An unresolved conflict recorded for operator review (under
/// [`ConflictStrategy::Manual`]), or any conflict resolved by a
/// strategy that still wants a record kept.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Vector id both entries disagree about.
    pub vector_id: VectorId,
    /// The entry this node already had.
    pub local: ChangelogEntry,
    /// The entry learned from the peer.
    pub remote: ChangelogEntry,
}

/// The outcome of resolving one local/remote changelog pair, or an
/// unpaired change that passes through untouched.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// One entry, possibly synthesized by a merge, that should be applied.
    Winner(ChangelogEntry),
    /// No conflict to resolve — the entry passed through as-is (an
    /// unpaired local or remote change, or one that already causally
    /// dominates the other).
    Passthrough(ChangelogEntry),
}

impl Resolution {
    /// The entry to apply, regardless of which variant this is.
    pub fn entry(&self) -> &ChangelogEntry {
        match self {
            Resolution::Winner(e) => e,
            Resolution::Passthrough(e) => e,
        }
    }
}

/// Resolve every local/remote changelog entry pair for shared vector ids,
/// pairing by `vector_id`; entries with no counterpart on the other side
/// pass through as winners untouched.
///
/// Returns `(winners, conflicts)`. Under [`ConflictStrategy::Manual`],
/// every genuine conflict is both returned as a (provisional) winner *and*
/// recorded in `conflicts`.
pub fn resolve_all(
    strategy: ConflictStrategy,
    local_changes: Vec<ChangelogEntry>,
    remote_changes: Vec<ChangelogEntry>,
) -> (Vec<Resolution>, Vec<Conflict>) {
    let mut by_id: HashMap<VectorId, (Option<ChangelogEntry>, Option<ChangelogEntry>)> =
        HashMap::new();

    for entry in local_changes {
        by_id.entry(entry.vector_id.clone()).or_default().0 = Some(entry);
    }
    for entry in remote_changes {
        by_id.entry(entry.vector_id.clone()).or_default().1 = Some(entry);
    }

    let mut winners = Vec::new();
    let mut conflicts = Vec::new();

    for (_, (local, remote)) in by_id {
        match (local, remote) {
            (Some(l), None) => winners.push(Resolution::Passthrough(l)),
            (None, Some(r)) => winners.push(Resolution::Passthrough(r)),
            (Some(l), Some(r)) => {
                match l.version_vector.compare(&r.version_vector) {
                    VersionOrdering::Greater | VersionOrdering::Equal => {
                        winners.push(Resolution::Passthrough(l))
                    }
                    VersionOrdering::Less => winners.push(Resolution::Passthrough(r)),
                    VersionOrdering::Concurrent => {
                        let winner = resolve_pair(strategy, &l, &r);
                        if strategy == ConflictStrategy::Manual {
                            conflicts.push(Conflict {
                                vector_id: winner.vector_id.clone(),
                                local: l,
                                remote: r,
                            });
                        }
                        winners.push(Resolution::Winner(winner));
                    }
                }
            }
            (None, None) => unreachable!("every entry in by_id came from one side or the other"),
        }
    }

    (winners, conflicts)
}

fn resolve_pair(
    strategy: ConflictStrategy,
    local: &ChangelogEntry,
    remote: &ChangelogEntry,
) -> ChangelogEntry {
    match strategy {
        ConflictStrategy::LastWriteWins => {
            if local.timestamp_us != remote.timestamp_us {
                if local.timestamp_us > remote.timestamp_us {
                    local.clone()
                } else {
                    remote.clone()
                }
            } else if local.source_node >= remote.source_node {
                local.clone()
            } else {
                remote.clone()
            }
        }
        ConflictStrategy::FirstWriteWins => {
            if local.timestamp_us <= remote.timestamp_us {
                local.clone()
            } else {
                remote.clone()
            }
        }
        ConflictStrategy::Merge => merge_pair(local, remote),
        // The local entry applies provisionally until an operator
        // resolves the conflict out of band.
        ConflictStrategy::Manual => local.clone(),
    }
}

fn merge_pair(local: &ChangelogEntry, remote: &ChangelogEntry) -> ChangelogEntry {
    if local.is_delete() || remote.is_delete() {
        return if local.is_delete() {
            local.clone()
        } else {
            remote.clone()
        };
    }

    let metadata = match (&local.metadata, &remote.metadata) {
        (Some(l), Some(r)) => {
            let mut merged = r.clone();
            if let (Some(merged_obj), Some(l_obj)) = (merged.as_object_mut(), l.as_object()) {
                for (k, v) in l_obj {
                    merged_obj.insert(k.clone(), v.clone());
                }
            }
            Some(merged)
        }
        (Some(l), None) => Some(l.clone()),
        (None, Some(r)) => Some(r.clone()),
        (None, None) => None,
    };

    let embedding = match (&local.embedding, &remote.embedding) {
        (Some(l), Some(r)) if l.len() == r.len() => Some(
            l.iter()
                .zip(r.iter())
                .map(|(a, b)| (a + b) / 2.0)
                .collect(),
        ),
        (Some(l), _) => Some(l.clone()),
        (None, Some(r)) => Some(r.clone()),
        (None, None) => None,
    };

    ChangelogEntry {
        change_id: local.change_id.max(remote.change_id),
        shard_id: local.shard_id.clone(),
        vector_id: local.vector_id.clone(),
        op: ChangeOp::Update,
        embedding,
        metadata,
        source_node: local.source_node.clone(),
        timestamp_us: local.timestamp_us.max(remote.timestamp_us),
        version_vector: local.version_vector.merge(&remote.version_vector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::{ShardId, VersionVector};

    fn entry(id: &str, node: &str, ts: u64, vv: VersionVector) -> ChangelogEntry {
        ChangelogEntry {
            change_id: 1,
            shard_id: ShardId::new("s"),
            vector_id: VectorId::from(id),
            op: ChangeOp::Update,
            embedding: Some(vec![1.0, 2.0]),
            metadata: None,
            source_node: node.to_string(),
            timestamp_us: ts,
            version_vector: vv,
        }
    }

    #[test]
    fn dominating_entry_needs_no_strategy() {
        let local = entry("v", "A", 10, VersionVector::single("A", 5));
        let remote = entry("v", "B", 5, VersionVector::single("A", 3));
        let (winners, conflicts) =
            resolve_all(ConflictStrategy::LastWriteWins, vec![local.clone()], vec![remote]);
        assert!(conflicts.is_empty());
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].entry().source_node, local.source_node);
    }

    #[test]
    fn concurrent_last_write_wins_picks_larger_timestamp() {
        let local = entry("v", "A", 5, VersionVector::single("A", 5));
        let remote = entry("v", "B", 10, VersionVector::single("B", 5));
        let (winners, conflicts) =
            resolve_all(ConflictStrategy::LastWriteWins, vec![local], vec![remote.clone()]);
        assert!(conflicts.is_empty());
        assert_eq!(winners[0].entry().source_node, remote.source_node);
    }

    #[test]
    fn concurrent_manual_applies_local_and_records_conflict() {
        let local = entry("v", "A", 5, VersionVector::single("A", 5));
        let remote = entry("v", "B", 10, VersionVector::single("B", 5));
        let (winners, conflicts) =
            resolve_all(ConflictStrategy::Manual, vec![local.clone()], vec![remote]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(winners[0].entry().source_node, local.source_node);
    }

    #[test]
    fn merge_averages_embeddings_and_prefers_local_metadata_keys() {
        use serde_json::json;
        let mut local = entry("v", "A", 5, VersionVector::single("A", 5));
        local.embedding = Some(vec![2.0, 4.0]);
        local.metadata = Some(json!({"tag": "local"}));
        let mut remote = entry("v", "B", 10, VersionVector::single("B", 5));
        remote.embedding = Some(vec![4.0, 8.0]);
        remote.metadata = Some(json!({"tag": "remote", "extra": 1}));

        let (winners, _) = resolve_all(ConflictStrategy::Merge, vec![local], vec![remote]);
        let winner = winners[0].entry();
        assert_eq!(winner.embedding, Some(vec![3.0, 6.0]));
        assert_eq!(winner.metadata.as_ref().unwrap()["tag"], "local");
        assert_eq!(winner.metadata.as_ref().unwrap()["extra"], 1);
    }

    #[test]
    fn merge_delete_always_wins() {
        let mut local = entry("v", "A", 5, VersionVector::single("A", 5));
        local.op = ChangeOp::Delete;
        local.embedding = None;
        let remote = entry("v", "B", 10, VersionVector::single("B", 5));

        let (winners, _) = resolve_all(ConflictStrategy::Merge, vec![local], vec![remote]);
        assert_eq!(winners[0].entry().op, ChangeOp::Delete);
    }

    #[test]
    fn unpaired_changes_pass_through() {
        let local = entry("only-local", "A", 1, VersionVector::single("A", 1));
        let (winners, conflicts) = resolve_all(ConflictStrategy::LastWriteWins, vec![local], vec![]);
        assert_eq!(winners.len(), 1);
        assert!(conflicts.is_empty());
        assert!(matches!(winners[0], Resolution::Passthrough(_)));
    }
}
