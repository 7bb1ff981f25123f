//! The in-memory HNSW graph: level sampling, greedy descent, beam search
//! and the insert/delete mutations that keep edges bidirectional.
//!
//! Grounded on the teacher's `HnswGraph` (`crates/engine/src/primitives/
//! vector/hnsw.rs`): a `BTreeMap<id, node>` for deterministic iteration,
//! a candidates/results heap pair for `search_layer`, and greedy descent
//! through the upper layers before a single beam search at layer 0. Two
//! differences from the teacher: this graph operates on HNSW's mandated
//! euclidean distance (smaller is better, not the teacher's similarity-
//! is-better convention), and delete is a full removal with edge pruning
//! rather than the teacher's soft-delete tombstone (see Open Questions in
//! DESIGN.md — the teacher's deletion path was left incomplete).

use crate::config::HnswConfig;
use crate::error::{IndexError, IndexResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use synapse_core::metric::{compute_score, Metric};
use synapse_core::{NodeId, VectorId};

/// Lifecycle state of an [`HnswIndex`], per §4.3 of the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No nodes have ever been inserted.
    Empty,
    /// The in-memory graph has nodes but has never been flushed.
    Building,
    /// The graph has been written to storage via `flush_to_storage`.
    Persisted,
    /// `hnsw_metadata.built = true` has been durably recorded.
    Ready,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    vector_id: VectorId,
    level: usize,
    embedding: Vec<f32>,
    /// Neighbours per layer, indexed `0..=level`, each mapping neighbour
    /// id to the euclidean distance at insertion time.
    neighbors: Vec<BTreeMap<NodeId, f32>>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    node: NodeId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.node == other.node
    }
}
impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Ascending by distance (so a plain `BinaryHeap<Candidate>` is a
    /// max-heap over distance — useful as the "worst result so far" heap
    /// in `search_layer`). Ties broken by node id, per the "tie-break by
    /// node_id" search_layer invariant.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// The in-memory HNSW graph plus its lifecycle state.
///
/// Incremental inserts are accepted once the graph has left [`IndexState::Empty`] —
/// not only during an explicit `build()` call. A persisted/ready index keeps
/// its full graph resident in memory (it is the working structure, not
/// merely a build-time cache), so a shard that grows past
/// `min_vectors_for_index` after its initial build can keep inserting one
/// vector at a time without a full rebuild. This is a deliberate
/// broadening of "insert is only legal while building": see DESIGN.md.
pub struct HnswGraph {
    config: HnswConfig,
    dimension: usize,
    state: IndexState,
    nodes: BTreeMap<NodeId, NodeRecord>,
    vector_to_node: HashMap<VectorId, NodeId>,
    entry_point: Option<NodeId>,
    max_level: usize,
    next_node_id: u64,
    rng: ChaCha8Rng,
}

impl HnswGraph {
    /// A fresh, empty graph for embeddings of `dimension`, seeded
    /// deterministically so that repeated builds over the same data and
    /// insertion order reproduce the same graph (build is only idempotent
    /// up to the RNG sequence, per §4.3's failure semantics).
    pub fn new(config: HnswConfig, dimension: usize, seed: u64) -> Self {
        HnswGraph {
            config,
            dimension,
            state: IndexState::Empty,
            nodes: BTreeMap::new(),
            vector_to_node: HashMap::new(),
            entry_point: None,
            max_level: 0,
            next_node_id: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Embedding dimension fixed for this index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The build/search tunables this graph was constructed with.
    pub fn config(&self) -> HnswConfig {
        self.config
    }

    /// Number of live nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph currently has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entry point node id, if any.
    pub fn entry_point(&self) -> Option<NodeId> {
        self.entry_point
    }

    /// Highest level present in the graph.
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    fn sample_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let level = (-uniform.ln() * self.config.m_l()).floor() as usize;
        level.min(self.config.max_level_cap)
    }

    fn alloc_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Insert a new vector into the graph. Legal once the graph has left
    /// [`IndexState::Empty`] (entering `Building` automatically on the
    /// very first call, per the `empty -> building` transition).
    pub fn insert(&mut self, vector_id: VectorId, embedding: Vec<f32>) -> IndexResult<NodeId> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }
        if self.state == IndexState::Empty {
            self.state = IndexState::Building;
        }

        let level = self.sample_level();
        let node_id = self.alloc_node_id();
        self.nodes.insert(
            node_id,
            NodeRecord {
                vector_id: vector_id.clone(),
                level,
                embedding: embedding.clone(),
                neighbors: vec![BTreeMap::new(); level + 1],
            },
        );
        self.vector_to_node.insert(vector_id, node_id);

        let entry = match self.entry_point {
            None => {
                self.entry_point = Some(node_id);
                self.max_level = level;
                return Ok(node_id);
            }
            Some(e) => e,
        };

        let mut current = entry;
        if self.max_level > level {
            current = self.greedy_descend(&embedding, entry, self.max_level, level + 1);
        }

        let start_layer = level.min(self.max_level);
        for lc in (0..=start_layer).rev() {
            let candidates = self.search_layer(&embedding, &[current], self.config.ef_construction, lc);
            let cap = self.config.cap_for_level(lc);
            let selected: Vec<(NodeId, f32)> = candidates.iter().take(cap).copied().collect();

            for &(neighbor, distance) in &selected {
                self.add_edge(node_id, neighbor, lc, distance);
            }
            for &(neighbor, _) in &selected {
                let degree = self.nodes[&neighbor].neighbors[lc].len();
                if degree > cap {
                    self.prune_neighbors(neighbor, lc, cap);
                }
            }
            if let Some(&(closest, _)) = candidates.first() {
                current = closest;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(node_id);
            self.max_level = level;
        }

        Ok(node_id)
    }

    fn add_edge(&mut self, a: NodeId, b: NodeId, level: usize, distance: f32) {
        if let Some(node) = self.nodes.get_mut(&a) {
            if level < node.neighbors.len() {
                node.neighbors[level].insert(b, distance);
            }
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            if level < node.neighbors.len() {
                node.neighbors[level].insert(a, distance);
            }
        }
    }

    /// Recompute `id`'s neighbours at `level` from the union of its
    /// current neighbours, re-evaluating euclidean distance from stored
    /// embeddings, keeping only the top `cap`. Dropped edges are removed
    /// from both sides.
    fn prune_neighbors(&mut self, id: NodeId, level: usize, cap: usize) {
        let embedding = match self.nodes.get(&id) {
            Some(n) => n.embedding.clone(),
            None => return,
        };
        let current: Vec<NodeId> = match self.nodes.get(&id) {
            Some(n) if level < n.neighbors.len() => n.neighbors[level].keys().copied().collect(),
            _ => return,
        };

        let mut scored: Vec<Candidate> = current
            .iter()
            .filter_map(|&nb| {
                self.nodes.get(&nb).map(|n| Candidate {
                    distance: compute_score(&embedding, &n.embedding, Metric::Euclidean),
                    node: nb,
                })
            })
            .collect();
        scored.sort();

        let keep: BTreeMap<NodeId, f32> = scored.into_iter().take(cap).map(|c| (c.node, c.distance)).collect();
        let dropped: Vec<NodeId> = current.into_iter().filter(|nb| !keep.contains_key(nb)).collect();

        if let Some(n) = self.nodes.get_mut(&id) {
            n.neighbors[level] = keep;
        }
        for nb in dropped {
            if let Some(n) = self.nodes.get_mut(&nb) {
                if level < n.neighbors.len() {
                    n.neighbors[level].remove(&id);
                }
            }
        }
    }

    /// Beam search at a single layer: a min-heap of candidates to expand
    /// and a max-heap of up to `ef` results, halting expansion once the
    /// best remaining candidate is farther than the current worst result.
    fn search_layer(&self, query: &[f32], entry_points: &[NodeId], ef: usize, level: usize) -> Vec<(NodeId, f32)> {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            if let Some(node) = self.nodes.get(&ep) {
                let d = compute_score(query, &node.embedding, Metric::Euclidean);
                candidates.push(Reverse(Candidate { distance: d, node: ep }));
                results.push(Candidate { distance: d, node: ep });
            }
        }

        while let Some(Reverse(nearest)) = candidates.pop() {
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if nearest.distance > worst && results.len() >= ef {
                break;
            }

            let neighbors: Vec<(NodeId, ())> = match self.nodes.get(&nearest.node) {
                Some(node) if level < node.neighbors.len() => {
                    node.neighbors[level].keys().map(|&id| (id, ())).collect()
                }
                _ => continue,
            };

            for (neighbor_id, ()) in neighbors {
                if !visited.insert(neighbor_id) {
                    continue;
                }
                let neighbor_embedding = match self.nodes.get(&neighbor_id) {
                    Some(n) => &n.embedding,
                    None => continue,
                };
                let d = compute_score(query, neighbor_embedding, Metric::Euclidean);
                let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);

                if results.len() < ef || d < worst {
                    candidates.push(Reverse(Candidate { distance: d, node: neighbor_id }));
                    results.push(Candidate { distance: d, node: neighbor_id });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(NodeId, f32)> = results.into_iter().map(|c| (c.node, c.distance)).collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }

    /// Repeatedly move to the globally closest neighbour at each layer
    /// from `from_layer` down to `to_layer`, inclusive.
    fn greedy_descend(&self, query: &[f32], entry: NodeId, from_layer: usize, to_layer: usize) -> NodeId {
        let mut current = entry;
        if to_layer > from_layer {
            return current;
        }
        for layer in (to_layer..=from_layer).rev() {
            loop {
                let current_embedding = match self.nodes.get(&current) {
                    Some(n) => &n.embedding,
                    None => break,
                };
                let current_distance = compute_score(query, current_embedding, Metric::Euclidean);
                let mut best = (current, current_distance);

                if let Some(node) = self.nodes.get(&current) {
                    if layer < node.neighbors.len() {
                        for &nb in node.neighbors[layer].keys() {
                            if let Some(nb_node) = self.nodes.get(&nb) {
                                let d = compute_score(query, &nb_node.embedding, Metric::Euclidean);
                                if d < best.1 || (d == best.1 && nb < best.0) {
                                    best = (nb, d);
                                }
                            }
                        }
                    }
                }

                if best.0 == current {
                    break;
                }
                current = best.0;
            }
        }
        current
    }

    /// Approximate k-NN search. Empty if the graph has no nodes yet.
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<(VectorId, f32)>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let entry = match self.entry_point {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut current = entry;
        if self.max_level > 0 {
            current = self.greedy_descend(query, entry, self.max_level, 1);
        }
        let ef = self.config.ef_search.max(k);
        let candidates = self.search_layer(query, &[current], ef, 0);

        Ok(candidates
            .into_iter()
            .take(k)
            .filter_map(|(id, d)| self.nodes.get(&id).map(|n| (n.vector_id.clone(), d)))
            .collect())
    }

    /// Remove `vector_id` and all its incident edges. Returns `true` if it
    /// was present. If the removed node was the entry point, the highest-
    /// level remaining node is promoted; if the graph is now empty, the
    /// entry point and max level are cleared.
    pub fn delete(&mut self, vector_id: &VectorId) -> bool {
        let node_id = match self.vector_to_node.remove(vector_id) {
            Some(id) => id,
            None => return false,
        };
        let node = match self.nodes.remove(&node_id) {
            Some(n) => n,
            None => return false,
        };

        for (level, neighbors) in node.neighbors.iter().enumerate() {
            for &nb in neighbors.keys() {
                if let Some(n) = self.nodes.get_mut(&nb) {
                    if level < n.neighbors.len() {
                        n.neighbors[level].remove(&node_id);
                    }
                }
            }
        }

        if self.entry_point == Some(node_id) {
            let promoted = self.nodes.iter().max_by_key(|(_, n)| n.level).map(|(&id, n)| (id, n.level));
            match promoted {
                Some((id, level)) => {
                    self.entry_point = Some(id);
                    self.max_level = level;
                }
                None => {
                    self.entry_point = None;
                    self.max_level = 0;
                }
            }
        }

        true
    }

    /// Clear all nodes and edges, returning the graph to [`IndexState::Empty`].
    /// Used by a rebuild before re-inserting from scratch.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.vector_to_node.clear();
        self.entry_point = None;
        self.max_level = 0;
        self.next_node_id = 0;
        self.state = IndexState::Empty;
    }

    pub(crate) fn set_state(&mut self, state: IndexState) {
        self.state = state;
    }

    /// Iterate every node as `(node_id, vector_id, level, embedding)`, in
    /// node-id order, for persistence.
    pub(crate) fn iter_nodes(&self) -> impl Iterator<Item = (NodeId, &VectorId, usize, &[f32])> {
        self.nodes
            .iter()
            .map(|(&id, n)| (id, &n.vector_id, n.level, n.embedding.as_slice()))
    }

    /// Iterate every unique undirected edge `(a, b, level, distance)` with
    /// `a < b`, for persistence.
    pub(crate) fn iter_edges(&self) -> impl Iterator<Item = (NodeId, NodeId, usize, f32)> + '_ {
        self.nodes.iter().flat_map(|(&a, node)| {
            node.neighbors.iter().enumerate().flat_map(move |(level, neighbors)| {
                neighbors
                    .iter()
                    .filter(move |&(&b, _)| a < b)
                    .map(move |(&b, &distance)| (a, b, level, distance))
            })
        })
    }

    pub(crate) fn next_node_id_counter(&self) -> u64 {
        self.next_node_id
    }

    /// Rebuild from persisted rows: nodes first, then edges added
    /// bidirectionally, then entry point/level/counter restored.
    pub(crate) fn restore(
        config: HnswConfig,
        dimension: usize,
        seed: u64,
        nodes: Vec<(NodeId, VectorId, usize, Vec<f32>)>,
        edges: Vec<(NodeId, NodeId, usize, f32)>,
        entry_point: Option<NodeId>,
        max_level: usize,
        next_node_id: u64,
    ) -> Self {
        let mut graph = HnswGraph::new(config, dimension, seed);
        for (id, vector_id, level, embedding) in nodes {
            graph.vector_to_node.insert(vector_id.clone(), id);
            graph.nodes.insert(
                id,
                NodeRecord {
                    vector_id,
                    level,
                    embedding,
                    neighbors: vec![BTreeMap::new(); level + 1],
                },
            );
        }
        for (a, b, level, distance) in edges {
            graph.add_edge(a, b, level, distance);
        }
        graph.entry_point = entry_point;
        graph.max_level = max_level;
        graph.next_node_id = next_node_id;
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(dim: usize) -> HnswGraph {
        HnswGraph::new(HnswConfig::default(), dim, 7)
    }

    #[test]
    fn first_insert_becomes_entry_point() {
        let mut g = graph(2);
        let id = g.insert(VectorId::from("a"), vec![1.0, 0.0]).unwrap();
        assert_eq!(g.entry_point(), Some(id));
        assert_eq!(g.state(), IndexState::Building);
    }

    #[test]
    fn search_returns_nearest_first() {
        let mut g = graph(2);
        g.insert(VectorId::from("a"), vec![1.0, 0.0]).unwrap();
        g.insert(VectorId::from("b"), vec![0.0, 1.0]).unwrap();
        g.insert(VectorId::from("c"), vec![0.9, 0.1]).unwrap();

        let results = g.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, VectorId::from("a"));
    }

    #[test]
    fn edges_are_always_bidirectional() {
        let mut g = graph(2);
        for i in 0..20 {
            g.insert(VectorId::from(i.to_string().as_str()), vec![i as f32, (20 - i) as f32])
                .unwrap();
        }
        for (&a, node) in &g.nodes {
            for (level, neighbors) in node.neighbors.iter().enumerate() {
                for &b in neighbors.keys() {
                    assert_ne!(a, b, "self-loop at level {level}");
                    let back = g.nodes.get(&b).expect("neighbor node exists");
                    assert!(
                        level < back.neighbors.len() && back.neighbors[level].contains_key(&a),
                        "edge ({a:?},{b:?},{level}) has no reverse edge"
                    );
                }
            }
        }
    }

    #[test]
    fn delete_removes_node_and_incident_edges() {
        let mut g = graph(2);
        let ids: Vec<VectorId> = (0..10)
            .map(|i| VectorId::from(i.to_string().as_str()))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            g.insert(id.clone(), vec![i as f32, -(i as f32)]).unwrap();
        }

        assert!(g.delete(&ids[3]));
        assert!(!g.delete(&ids[3]));
        assert_eq!(g.len(), 9);

        for (_, node) in &g.nodes {
            for neighbors in &node.neighbors {
                assert!(neighbors.keys().all(|&n| g.nodes.contains_key(&n)));
            }
        }
    }

    #[test]
    fn deleting_entry_point_promotes_highest_level_node() {
        let mut g = graph(2);
        let a = g.insert(VectorId::from("a"), vec![0.0, 0.0]).unwrap();
        for i in 1..30 {
            g.insert(VectorId::from(i.to_string().as_str()), vec![i as f32, 0.0])
                .unwrap();
        }
        let entry_before = g.entry_point().unwrap();
        if entry_before == a {
            g.delete(&VectorId::from("a"));
            assert!(g.entry_point().is_some() || g.is_empty());
        }
    }

    #[test]
    fn deleting_last_node_clears_entry_point() {
        let mut g = graph(2);
        g.insert(VectorId::from("a"), vec![1.0, 1.0]).unwrap();
        g.delete(&VectorId::from("a"));
        assert_eq!(g.entry_point(), None);
        assert_eq!(g.max_level(), 0);
        assert!(g.is_empty());
    }

    #[test]
    fn search_on_empty_graph_is_empty() {
        let g = graph(2);
        assert_eq!(g.search(&[0.0, 0.0], 5).unwrap(), Vec::new());
    }

    #[test]
    fn k_zero_returns_empty() {
        let mut g = graph(2);
        g.insert(VectorId::from("a"), vec![1.0, 1.0]).unwrap();
        assert_eq!(g.search(&[1.0, 1.0], 0).unwrap(), Vec::new());
    }

    #[test]
    fn dimension_mismatch_on_search_is_an_error() {
        let mut g = graph(3);
        g.insert(VectorId::from("a"), vec![1.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            g.search(&[1.0, 1.0], 1),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn recall_is_reasonable_on_a_random_benchmark() {
        use rand::{Rng, SeedableRng};
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let dim = 32;
        let n = 2000;
        let vectors: Vec<Vec<f32>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        let mut g = HnswGraph::new(HnswConfig::default(), dim, 3);
        for (i, v) in vectors.iter().enumerate() {
            g.insert(VectorId::from(i.to_string().as_str()), v.clone()).unwrap();
        }

        let queries = 30;
        let mut hits = 0usize;
        let mut total = 0usize;
        for qi in 0..queries {
            let query = &vectors[qi];
            let mut exact: Vec<(usize, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(j, v)| (j, compute_score(query, v, Metric::Euclidean)))
                .collect();
            exact.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let exact_top: HashSet<usize> = exact.iter().take(10).map(|(j, _)| *j).collect();

            let approx = g.search(query, 10).unwrap();
            let approx_top: HashSet<usize> = approx
                .iter()
                .filter_map(|(id, _)| id.as_str().parse::<usize>().ok())
                .collect();

            hits += exact_top.intersection(&approx_top).count();
            total += exact_top.len();
        }

        let recall = hits as f32 / total as f32;
        assert!(recall >= 0.7, "recall too low: {recall}");
    }
}
