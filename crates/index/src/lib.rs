//! Approximate nearest-neighbour search via HNSW, plus its batched
//! on-disk persistence.
//!
//! Builds on [`synapse_storage`] for the `hnsw_nodes`/`hnsw_edges`/
//! `hnsw_metadata` tables; [`synapse_query`] is the only crate that talks
//! to [`HnswIndex`] directly — everything else goes through the shard
//! facade.

pub mod config;
pub mod error;
pub mod graph;
pub mod persist;

use synapse_core::{NodeId, ShardId, VectorId};
use synapse_storage::SqlSubstrate;

pub use config::HnswConfig;
pub use error::{IndexError, IndexResult};
pub use graph::IndexState;

/// A shard's HNSW index: the live in-memory graph plus the means to
/// durably snapshot and restore it.
///
/// `insert`/`delete`/`search` operate purely in memory; [`Self::flush`]
/// and [`Self::load`] are the only operations that touch storage.
pub struct HnswIndex {
    graph: graph::HnswGraph,
    shard_id: ShardId,
    seed: u64,
}

impl HnswIndex {
    /// A fresh, empty index for `shard_id`, with embeddings of `dimension`.
    /// `seed` fixes the RNG used for level sampling, so rebuilding from the
    /// same insertion order reproduces the same graph.
    pub fn new(shard_id: ShardId, config: HnswConfig, dimension: usize, seed: u64) -> Self {
        HnswIndex {
            graph: graph::HnswGraph::new(config, dimension, seed),
            shard_id,
            seed,
        }
    }

    /// Load a previously flushed index for `shard_id`, or a fresh empty
    /// one if nothing has ever been persisted.
    pub fn load(substrate: &SqlSubstrate, shard_id: ShardId, config: HnswConfig, dimension: usize, seed: u64) -> IndexResult<Self> {
        let graph = persist::load_from_storage(substrate, &shard_id, config, dimension, seed)?;
        Ok(HnswIndex { graph, shard_id, seed })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        self.graph.state()
    }

    /// Whether this index has ever been flushed and marked built.
    pub fn is_ready(&self) -> bool {
        self.graph.state() == IndexState::Ready
    }

    /// The build/search tunables this index was constructed with.
    pub fn config(&self) -> HnswConfig {
        self.graph.config()
    }

    /// Number of vectors currently in the graph.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the graph currently holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Insert a vector. Legal any time after the index leaves `Empty`;
    /// the very first insert makes that transition automatically.
    pub fn insert(&mut self, vector_id: VectorId, embedding: Vec<f32>) -> IndexResult<NodeId> {
        self.graph.insert(vector_id, embedding)
    }

    /// Approximate k-nearest-neighbour search, euclidean distance,
    /// ascending (closest first).
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<(VectorId, f32)>> {
        self.graph.search(query, k)
    }

    /// Remove a vector and its incident edges. Returns `true` if it was
    /// present.
    pub fn delete(&mut self, vector_id: &VectorId) -> bool {
        self.graph.delete(vector_id)
    }

    /// Discard the in-memory graph, returning the index to `Empty`. Used
    /// before a full rebuild.
    pub fn clear(&mut self) {
        self.graph.clear();
    }

    /// Persist the full graph to storage in one transaction. On failure
    /// the in-memory graph is discarded (per the failure semantics of a
    /// partial flush) and the caller must rebuild from the vector table.
    pub fn flush(&mut self, substrate: &SqlSubstrate) -> IndexResult<()> {
        persist::flush_to_storage(&mut self.graph, substrate, &self.shard_id)
    }

    /// Rebuild the graph from scratch by replaying `vectors` in order,
    /// then flush it. Used when a shard crosses `min_vectors_for_index`
    /// or after a failed flush left the index empty.
    pub fn build_optimized(&mut self, vectors: impl IntoIterator<Item = (VectorId, Vec<f32>)>) -> IndexResult<()> {
        let dimension = self.graph.dimension();
        self.graph = graph::HnswGraph::new(self.graph.config(), dimension, self.seed);
        for (id, embedding) in vectors {
            self.graph.insert(id, embedding)?;
        }
        Ok(())
    }
}
