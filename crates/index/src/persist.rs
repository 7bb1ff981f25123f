//! Flushing the in-memory graph to the `hnsw_nodes`/`hnsw_edges`/
//! `hnsw_metadata` tables, and reconstructing it on load.
//!
//! Grounded on `synapse_storage::ShardStorage`'s transaction discipline:
//! every write goes through `SqlSubstrate::transaction`, so a failure
//! partway through a flush rolls back cleanly and leaves the previously
//! persisted graph (if any) untouched — per §4.3's failure semantics, the
//! in-memory graph itself is then discarded by the caller and `built`
//! stays `false`.

use crate::config::HnswConfig;
use crate::error::{IndexError, IndexResult};
use crate::graph::{HnswGraph, IndexState};
use rusqlite::params;
use synapse_core::{NodeId, ShardId, VectorId};
use synapse_storage::codec::{decode_embedding, encode_embedding};
use synapse_storage::SqlSubstrate;

const KEY_ENTRY_POINT: &str = "entry_point";
const KEY_MAX_LEVEL: &str = "max_level";
const KEY_BUILT: &str = "built";
const KEY_NEXT_NODE_ID: &str = "next_node_id";

/// Write the full graph for `shard_id` to storage in one transaction,
/// replacing whatever was previously persisted for this shard.
pub fn flush_to_storage(graph: &mut HnswGraph, substrate: &SqlSubstrate, shard_id: &ShardId) -> IndexResult<()> {
    let shard = shard_id.as_str().to_string();
    let nodes: Vec<(NodeId, VectorId, usize, Vec<f32>)> = graph
        .iter_nodes()
        .map(|(id, vid, level, emb)| (id, vid.clone(), level, emb.to_vec()))
        .collect();
    let edges: Vec<(NodeId, NodeId, usize, f32)> = graph.iter_edges().collect();
    let entry_point = graph.entry_point();
    let max_level = graph.max_level();
    let next_node_id = graph.next_node_id_counter();

    let result = substrate.transaction(|s| {
        s.with_connection(|conn| {
            conn.execute("DELETE FROM hnsw_nodes WHERE shard_id = ?1", [&shard])?;
            conn.execute("DELETE FROM hnsw_edges WHERE shard_id = ?1", [&shard])?;
            conn.execute("DELETE FROM hnsw_metadata WHERE shard_id = ?1", [&shard])?;
            Ok(())
        })?;

        s.with_connection(|conn| {
            {
                let mut stmt = conn.prepare(
                    "INSERT INTO hnsw_nodes (shard_id, node_id, vector_id, level, embedding_bytes) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (id, vector_id, level, embedding) in &nodes {
                    stmt.execute(params![
                        shard,
                        id.as_u64() as i64,
                        vector_id.as_str(),
                        *level as i64,
                        encode_embedding(embedding),
                    ])?;
                }
            }
            {
                let mut stmt = conn.prepare(
                    "INSERT INTO hnsw_edges (shard_id, from_id, to_id, level, distance) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (a, b, level, distance) in &edges {
                    stmt.execute(params![
                        shard,
                        a.as_u64() as i64,
                        b.as_u64() as i64,
                        *level as i64,
                        *distance as f64,
                    ])?;
                }
            }
            {
                let mut stmt = conn.prepare(
                    "INSERT INTO hnsw_metadata (shard_id, key, value) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![
                    shard,
                    KEY_ENTRY_POINT,
                    entry_point.map(|e| e.as_u64().to_string()).unwrap_or_default(),
                ])?;
                stmt.execute(params![shard, KEY_MAX_LEVEL, max_level.to_string()])?;
                stmt.execute(params![shard, KEY_NEXT_NODE_ID, next_node_id.to_string()])?;
                stmt.execute(params![shard, KEY_BUILT, "true"])?;
            }
            Ok(())
        })
    });

    match result {
        Ok(()) => {
            graph.set_state(IndexState::Ready);
            Ok(())
        }
        Err(e) => {
            graph.clear();
            Err(IndexError::Storage(e))
        }
    }
}

/// Reconstruct the live graph for `shard_id` from storage. Returns a
/// fresh empty graph (state `Empty`) if nothing has ever been persisted
/// for this shard.
pub fn load_from_storage(
    substrate: &SqlSubstrate,
    shard_id: &ShardId,
    config: HnswConfig,
    dimension: usize,
    seed: u64,
) -> IndexResult<HnswGraph> {
    let shard = shard_id.as_str().to_string();

    let metadata: Vec<(String, String)> = substrate.with_connection(|conn| {
        let mut stmt =
            conn.prepare("SELECT key, value FROM hnsw_metadata WHERE shard_id = ?1")?;
        let rows = stmt.query_map(params![shard], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    })?;

    if metadata.is_empty() {
        return Ok(HnswGraph::new(config, dimension, seed));
    }

    let built = metadata
        .iter()
        .find(|(k, _)| k == KEY_BUILT)
        .map(|(_, v)| v == "true")
        .unwrap_or(false);
    if !built {
        return Ok(HnswGraph::new(config, dimension, seed));
    }

    let entry_point = metadata
        .iter()
        .find(|(k, _)| k == KEY_ENTRY_POINT)
        .and_then(|(_, v)| v.parse::<u64>().ok())
        .map(NodeId::new);
    let max_level = metadata
        .iter()
        .find(|(k, _)| k == KEY_MAX_LEVEL)
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let next_node_id = metadata
        .iter()
        .find(|(k, _)| k == KEY_NEXT_NODE_ID)
        .and_then(|(_, v)| v.parse::<u64>().ok())
        .unwrap_or(0);

    let node_rows: Vec<(i64, String, i64, Vec<u8>)> = substrate.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT node_id, vector_id, level, embedding_bytes FROM hnsw_nodes WHERE shard_id = ?1",
        )?;
        let rows = stmt.query_map(params![shard], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect()
    })?;

    let mut nodes = Vec::with_capacity(node_rows.len());
    for (node_id, vector_id, level, embedding_bytes) in node_rows {
        let embedding = decode_embedding(&embedding_bytes, dimension)
            .map_err(|e| IndexError::Inconsistent(e.to_string()))?;
        nodes.push((NodeId::new(node_id as u64), VectorId::from(vector_id.as_str()), level as usize, embedding));
    }

    let edge_rows: Vec<(i64, i64, i64, f64)> = substrate.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, level, distance FROM hnsw_edges WHERE shard_id = ?1",
        )?;
        let rows = stmt.query_map(params![shard], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect()
    })?;
    let edges: Vec<(NodeId, NodeId, usize, f32)> = edge_rows
        .into_iter()
        .map(|(a, b, level, distance)| (NodeId::new(a as u64), NodeId::new(b as u64), level as usize, distance as f32))
        .collect();

    let mut graph = HnswGraph::restore(config, dimension, seed, nodes, edges, entry_point, max_level, next_node_id);
    graph.set_state(IndexState::Ready);
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswConfig;

    fn substrate() -> SqlSubstrate {
        SqlSubstrate::open(None).unwrap()
    }

    #[test]
    fn flush_then_load_round_trips_the_graph() {
        let s = substrate();
        let shard = ShardId::new("s1");
        let mut graph = HnswGraph::new(HnswConfig::default(), 3, 1);
        for i in 0..25 {
            graph
                .insert(VectorId::from(i.to_string().as_str()), vec![i as f32, 0.0, 1.0])
                .unwrap();
        }
        let expected_len = graph.len();
        let expected_entry = graph.entry_point();

        flush_to_storage(&mut graph, &s, &shard).unwrap();
        assert_eq!(graph.state(), IndexState::Ready);

        let restored = load_from_storage(&s, &shard, HnswConfig::default(), 3, 1).unwrap();
        assert_eq!(restored.len(), expected_len);
        assert_eq!(restored.entry_point(), expected_entry);
        assert_eq!(restored.state(), IndexState::Ready);

        let results = restored.search(&[5.0, 0.0, 1.0], 3).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn load_with_nothing_persisted_is_an_empty_graph() {
        let s = substrate();
        let shard = ShardId::new("empty-shard");
        let restored = load_from_storage(&s, &shard, HnswConfig::default(), 4, 1).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.state(), IndexState::Empty);
    }
}
