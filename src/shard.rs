//! A single shard: storage plus its cache and optional HNSW index and
//! quantizer, behind the one mutex the concurrency model describes.

use parking_lot::RwLock;
use rusqlite::OptionalExtension;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use synapse_cache::{CacheKey, QueryCache};
use synapse_core::{ChangeOp, ChangelogEntry, ShardId, VectorId, VectorRecord, VersionVector};
use synapse_index::HnswIndex;
use synapse_quant::{Quantizer, QuantizerKind};
use synapse_query::{QueryContext, QueryEngine, SearchHit, SearchParams};
use synapse_storage::{ShardStats, ShardStorage, SqlSubstrate};
use synapse_sync::ChangelogReader;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};

/// The mutable parts of a shard that a build or retrain swaps out
/// wholesale — guarded by one `RwLock` per the concurrency model.
struct ShardState {
    index: Option<HnswIndex>,
    quantizer: Option<Quantizer>,
}

/// One shard: durable vector storage, its query-result cache, and the
/// optional HNSW index / quantizer codec the query engine consults.
///
/// Mutating operations (`insert`/`update`/`delete`) serialize through
/// [`ShardStorage`]'s own lock for the row data and take this shard's
/// `state` lock only long enough to keep the index in step; `search`
/// takes `state` for a shared read. The cache has its own internal lock,
/// independent of both.
pub struct Shard {
    id: ShardId,
    storage: Arc<ShardStorage>,
    cache: QueryCache,
    state: RwLock<ShardState>,
    substrate: Arc<SqlSubstrate>,
    auto_rebuild: bool,
}

fn seed_from_shard_id(id: &ShardId) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.as_str().hash(&mut hasher);
    hasher.finish()
}

impl Shard {
    /// Open (or create) a shard, restoring its storage, HNSW index and
    /// quantizer from whatever has already been persisted.
    pub fn open(
        substrate: Arc<SqlSubstrate>,
        id: ShardId,
        config: &DatabaseConfig,
        local_node: impl Into<String>,
    ) -> DbResult<Self> {
        let dimension = config.dimension as usize;
        let storage = Arc::new(ShardStorage::open(substrate.clone(), id.clone(), dimension, local_node)?);
        let cache = QueryCache::new(config.cache.max_size, config.cache.ttl_ms, config.cache.enabled);

        let seed = seed_from_shard_id(&id);
        let index = if config.hnsw.enabled {
            Some(HnswIndex::load(&substrate, id.clone(), config.hnsw.to_hnsw_config(), dimension, seed)?)
        } else {
            None
        };

        let quantizer = load_quantizer(&substrate, &id, config.quantizer.kind, dimension, &config.quantizer)?;

        Ok(Shard {
            id,
            storage,
            cache,
            state: RwLock::new(ShardState { index, quantizer }),
            substrate,
            auto_rebuild: config.hnsw.auto_rebuild,
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Direct access to the underlying storage, e.g. for wiring a
    /// [`ChangelogReader`] outside of `Shard` itself.
    pub fn storage(&self) -> &Arc<ShardStorage> {
        &self.storage
    }

    pub fn insert(&self, record: VectorRecord) -> DbResult<VectorId> {
        let embedding = record.embedding.clone();
        let id = self.storage.insert(record)?;
        {
            let mut state = self.state.write();
            if let Some(index) = state.index.as_mut() {
                if let Err(e) = index.insert(id.clone(), embedding) {
                    warn!(error = %e, shard = %self.id, "failed to insert into HNSW index; index may need a rebuild");
                }
            }
        }
        self.cache.invalidate();
        self.maybe_auto_rebuild()?;
        Ok(id)
    }

    pub fn get(&self, id: &VectorId) -> DbResult<Option<VectorRecord>> {
        Ok(self.storage.get(id)?)
    }

    /// `embedding = None` leaves the embedding unchanged. `metadata =
    /// None` leaves metadata unchanged; `Some(None)` clears it;
    /// `Some(Some(v))` replaces it.
    pub fn update(
        &self,
        id: &VectorId,
        embedding: Option<Vec<f32>>,
        metadata: Option<Option<serde_json::Value>>,
    ) -> DbResult<()> {
        self.storage.update(id, embedding.clone(), metadata)?;
        if let Some(embedding) = embedding {
            let mut state = self.state.write();
            if let Some(index) = state.index.as_mut() {
                index.delete(id);
                if let Err(e) = index.insert(id.clone(), embedding) {
                    warn!(error = %e, shard = %self.id, "failed to re-insert into HNSW index after update");
                }
            }
        }
        self.cache.invalidate();
        Ok(())
    }

    pub fn delete(&self, id: &VectorId) -> DbResult<bool> {
        let existed = self.storage.delete(id)?;
        if existed {
            self.state.write().index.as_mut().map(|idx| idx.delete(id));
            self.cache.invalidate();
        }
        Ok(existed)
    }

    /// Run a search, consulting the cache first and filling it on a miss.
    pub fn search(&self, params: SearchParams) -> DbResult<Vec<SearchHit>> {
        let key = CacheKey::from_params(&params);
        if let Some(hits) = self.cache.get(&key) {
            return Ok(hits);
        }

        let state = self.state.read();
        let ctx = QueryContext {
            storage: &self.storage,
            index: state.index.as_ref(),
            quantizer: state.quantizer.as_ref(),
        };
        let hits = QueryEngine::search(&ctx, &params)?;
        self.cache.put(key, hits.clone());
        Ok(hits)
    }

    /// Aggregate counters for this shard.
    pub fn stats(&self) -> DbResult<ShardStats> {
        Ok(self.storage.stats()?)
    }

    /// Rebuild the HNSW index from scratch by replaying the current
    /// storage contents, then flush it. Used explicitly, or by
    /// [`Self::maybe_auto_rebuild`] once the shard crosses
    /// `min_vectors_for_index`.
    pub fn rebuild_index(&self) -> DbResult<()> {
        let mut state = self.state.write();
        let Some(index) = state.index.as_mut() else {
            return Err(DbError::InvalidArgument(
                "shard has HNSW disabled; enable it in the database config to build an index".to_string(),
            ));
        };

        let mut vectors = Vec::new();
        for record in self.storage.scan() {
            let record = record?;
            vectors.push((record.id, record.embedding));
        }
        index.build_optimized(vectors)?;
        index.flush(&self.substrate)?;
        debug!(shard = %self.id, len = index.len(), "rebuilt HNSW index");
        drop(state);
        self.cache.invalidate();
        Ok(())
    }

    /// Persist the current in-memory HNSW graph as-is, without rebuilding
    /// it. A no-op if the shard has no index or the index has never been
    /// built. Used on database shutdown to flush whatever has already
    /// been built without paying for a full rebuild.
    pub fn flush_index(&self) -> DbResult<()> {
        let mut state = self.state.write();
        if let Some(index) = state.index.as_mut() {
            if index.is_ready() {
                index.flush(&self.substrate)?;
            }
        }
        Ok(())
    }

    fn maybe_auto_rebuild(&self) -> DbResult<()> {
        if !self.auto_rebuild {
            return Ok(());
        }
        let ready_to_build = {
            let state = self.state.read();
            match state.index.as_ref() {
                Some(index) if !index.is_ready() => {
                    let threshold = index.config().min_vectors_for_index;
                    self.storage.stats()?.count as usize >= threshold
                }
                _ => false,
            }
        };
        if ready_to_build {
            self.rebuild_index()?;
        }
        Ok(())
    }

    /// Train this shard's quantizer on `samples` and persist the trained
    /// state. A no-op (returning `Ok`) if the shard has no quantizer
    /// configured.
    pub fn train_quantizer(&self, samples: &[Vec<f32>], seed: u64) -> DbResult<()> {
        let mut state = self.state.write();
        let Some(quantizer) = state.quantizer.as_mut() else {
            return Ok(());
        };
        quantizer.train(samples, seed)?;
        save_quantizer(&self.substrate, &self.id, quantizer)?;
        drop(state);
        self.cache.invalidate();
        Ok(())
    }

    /// Evaluate the trained quantizer's reconstruction error and
    /// recall@10 against a held-out sample. `None` if no quantizer is
    /// configured.
    pub fn quantizer_accuracy(&self, test_set: &[Vec<f32>]) -> DbResult<Option<synapse_quant::AccuracyReport>> {
        let state = self.state.read();
        Ok(match state.quantizer.as_ref() {
            Some(q) if q.is_trained() => Some(q.evaluate_accuracy(test_set)?),
            _ => None,
        })
    }
}

impl ChangelogReader for Shard {
    fn latest_change_id(&self) -> u64 {
        self.storage.latest_change_id()
    }

    fn read_changes(&self, from_change_id_exclusive: u64) -> synapse_sync::SyncResult<Vec<ChangelogEntry>> {
        Ok(self.storage.read_changes(from_change_id_exclusive)?)
    }

    fn version_vector(&self) -> VersionVector {
        self.storage.version_vector()
    }

    /// Apply a remote change learned via sync, then keep the in-memory
    /// index and query cache in step the same way a local mutation would.
    fn apply_remote_change(&self, entry: &ChangelogEntry) -> synapse_sync::SyncResult<()> {
        self.storage.apply_remote_change(entry)?;
        {
            let mut state = self.state.write();
            if let Some(index) = state.index.as_mut() {
                match entry.op {
                    ChangeOp::Delete => {
                        index.delete(&entry.vector_id);
                    }
                    ChangeOp::Insert | ChangeOp::Update => {
                        if let Some(embedding) = &entry.embedding {
                            index.delete(&entry.vector_id);
                            if let Err(e) = index.insert(entry.vector_id.clone(), embedding.clone()) {
                                warn!(error = %e, shard = %self.id, "failed to apply remote change to HNSW index");
                            }
                        }
                    }
                }
            }
        }
        self.cache.invalidate();
        Ok(())
    }
}

fn load_quantizer(
    substrate: &SqlSubstrate,
    shard_id: &ShardId,
    kind: QuantizerKind,
    dimension: usize,
    settings: &crate::config::QuantizerSettings,
) -> DbResult<Option<Quantizer>> {
    if kind == QuantizerKind::None {
        return Ok(None);
    }
    let persisted: Option<Vec<u8>> = substrate.with_connection(|conn| {
        conn.query_row(
            "SELECT state_blob FROM quantizer_state WHERE shard_id = ?1 AND codec_name = ?2",
            rusqlite::params![shard_id.as_str(), codec_name(kind)],
            |row| row.get(0),
        )
        .optional()
    })?;

    let quantizer = match persisted {
        Some(bytes) => Quantizer::load_state(&bytes)?,
        None => Quantizer::new(kind, dimension, settings.subvectors, settings.bits)?,
    };
    Ok(Some(quantizer))
}

fn save_quantizer(substrate: &SqlSubstrate, shard_id: &ShardId, quantizer: &Quantizer) -> DbResult<()> {
    let blob = quantizer.serialize_state();
    substrate.with_connection(|conn| {
        conn.execute(
            "INSERT INTO quantizer_state (shard_id, codec_name, state_blob) VALUES (?1, ?2, ?3) \
             ON CONFLICT (shard_id, codec_name) DO UPDATE SET state_blob = excluded.state_blob",
            rusqlite::params![shard_id.as_str(), codec_name(quantizer.kind()), blob],
        )
    })?;
    Ok(())
}

fn codec_name(kind: QuantizerKind) -> &'static str {
    match kind {
        QuantizerKind::None => "none",
        QuantizerKind::Scalar => "scalar",
        QuantizerKind::Product => "product",
        QuantizerKind::Binary => "binary",
    }
}
