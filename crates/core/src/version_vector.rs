//! Version vectors: the causal-ordering primitive the sync engine's
//! conflict resolver is built on.

use std::collections::BTreeMap;

/// Result of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    /// Every entry of `self` is `<=` the other's, and at least one is `<`.
    Less,
    /// The mirror image of [`VersionOrdering::Less`].
    Greater,
    /// Identical on every key.
    Equal,
    /// Neither dominates: some entry is greater, some is lesser.
    Concurrent,
}

/// A mapping from node identifier to the last change id applied from that
/// node. Used to causally order two changelog entries for the same vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionVector(pub BTreeMap<String, u64>);

impl VersionVector {
    /// The empty vector (dominated by everything but itself).
    pub fn new() -> Self {
        VersionVector(BTreeMap::new())
    }

    /// Build a single-entry vector, the common case for a locally
    /// originated change.
    pub fn single(node: impl Into<String>, change_id: u64) -> Self {
        let mut m = BTreeMap::new();
        m.insert(node.into(), change_id);
        VersionVector(m)
    }

    /// Record an observation from `node` at `change_id`, keeping the
    /// larger value if one is already present.
    pub fn observe(&mut self, node: impl Into<String>, change_id: u64) {
        let entry = self.0.entry(node.into()).or_insert(0);
        if change_id > *entry {
            *entry = change_id;
        }
    }

    /// Last change id recorded for `node`, or 0 if never observed.
    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Causally compare `self` against `other`.
    ///
    /// `A < B` iff every coordinate of A is `<=` the corresponding
    /// coordinate of B (missing coordinates count as 0) and at least one
    /// is strictly less. Symmetric for `>`. Otherwise, if not equal, the
    /// vectors are concurrent.
    pub fn compare(&self, other: &VersionVector) -> VersionOrdering {
        let mut self_lesser = false;
        let mut self_greater = false;

        let mut keys: std::collections::BTreeSet<&String> = self.0.keys().collect();
        keys.extend(other.0.keys());

        for k in keys {
            let a = self.0.get(k).copied().unwrap_or(0);
            let b = other.0.get(k).copied().unwrap_or(0);
            match a.cmp(&b) {
                std::cmp::Ordering::Less => self_lesser = true,
                std::cmp::Ordering::Greater => self_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (self_lesser, self_greater) {
            (false, false) => VersionOrdering::Equal,
            (true, false) => VersionOrdering::Less,
            (false, true) => VersionOrdering::Greater,
            (true, true) => VersionOrdering::Concurrent,
        }
    }

    /// `self >= other` under the causal partial order (dominates or equal).
    pub fn dominates_or_equal(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VersionOrdering::Greater | VersionOrdering::Equal
        )
    }

    /// Per-key maximum of two vectors — used by the `merge` conflict
    /// strategy to fold two concurrent version vectors into one that
    /// dominates both inputs.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        for (k, v) in &other.0 {
            out.observe(k.clone(), *v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_vectors_compare_equal() {
        let a = VersionVector::single("A", 5);
        let b = VersionVector::single("A", 5);
        assert_eq!(a.compare(&b), VersionOrdering::Equal);
    }

    #[test]
    fn strictly_dominating_vector_is_greater() {
        let a = VersionVector::single("A", 5);
        let b = VersionVector::single("A", 3);
        assert_eq!(a.compare(&b), VersionOrdering::Greater);
        assert_eq!(b.compare(&a), VersionOrdering::Less);
    }

    #[test]
    fn disjoint_nodes_are_concurrent() {
        // A writes {A: 5}, B writes {B: 7} — the textbook concurrent case.
        let a = VersionVector::single("A", 5);
        let b = VersionVector::single("B", 7);
        assert_eq!(a.compare(&b), VersionOrdering::Concurrent);
    }

    #[test]
    fn merge_dominates_both_inputs() {
        let a = VersionVector::single("A", 5);
        let b = VersionVector::single("B", 7);
        let merged = a.merge(&b);
        assert!(merged.dominates_or_equal(&a));
        assert!(merged.dominates_or_equal(&b));
        assert_eq!(merged.get("A"), 5);
        assert_eq!(merged.get("B"), 7);
    }

    #[test]
    fn missing_coordinate_counts_as_zero() {
        let mut a = VersionVector::new();
        a.observe("A", 1);
        let b = VersionVector::new();
        assert_eq!(a.compare(&b), VersionOrdering::Greater);
    }
}
