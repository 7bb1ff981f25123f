//! HNSW build/search parameters.

/// Tunables for [`crate::HnswIndex`]. Defaults match the values the query
/// engine and storage layer are calibrated against.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Neighbours kept per node at layers above 0.
    pub m: usize,
    /// Neighbours kept per node at layer 0.
    pub m0: usize,
    /// Beam width used while building the graph.
    pub ef_construction: usize,
    /// Beam width used while searching, absent an explicit per-query `ef`.
    pub ef_search: usize,
    /// Shard size below which the query engine prefers a brute-force scan.
    pub min_vectors_for_index: usize,
    /// Hard cap on the level a node may be sampled into, regardless of
    /// `m_l` — keeps a single unlucky RNG draw from growing the graph to
    /// an unbounded number of layers.
    pub max_level_cap: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        HnswConfig {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            min_vectors_for_index: 1_000,
            max_level_cap: 16,
        }
    }
}

impl HnswConfig {
    /// `m_L = 1 / ln(M)`, the level-assignment parameter from the paper.
    pub fn m_l(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Neighbour cap for `level`: `m0` at layer 0, `m` above it.
    pub fn cap_for_level(&self, level: usize) -> usize {
        if level == 0 {
            self.m0
        } else {
            self.m
        }
    }
}
