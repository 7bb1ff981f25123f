//! The top-level handle: a registry of shards over one SQL substrate,
//! plus (once [`Database::enable_sync`] is called) the transport, engine
//! and coordinator that reconcile those shards with remote peers.
//!
//! Deliberately not a path-keyed global singleton: two opens of the same
//! directory in one process hand back two independent handles, each with
//! its own substrate connection. The caller owns the `Arc` and its
//! lifetime; nothing here tracks "all open databases" on their behalf.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use synapse_core::ShardId;
use synapse_storage::SqlSubstrate;
use synapse_sync::{
    CoordinatorStats, PeerInfo, ShardCoordinator, SyncConfig, SyncEngine, SyncOutcome, SyncTransport,
    UdpTransport,
};
use tracing::{info, warn};

use crate::config::{DatabaseConfig, CONFIG_FILE_NAME};
use crate::error::{DbError, DbResult};
use crate::shard::Shard;

/// Background sync machinery, present only once [`Database::enable_sync`]
/// has bound a transport.
struct SyncRuntime {
    transport: Arc<UdpTransport>,
    engine: Arc<SyncEngine<UdpTransport>>,
    coordinator: Arc<ShardCoordinator<UdpTransport>>,
}

/// An embedded vector database: a set of named shards sharing one SQL
/// substrate and configuration, opened in-process.
pub struct Database {
    substrate: Arc<SqlSubstrate>,
    config: DatabaseConfig,
    config_path: Option<PathBuf>,
    local_node: String,
    shards: DashMap<ShardId, Arc<Shard>>,
    sync: parking_lot::RwLock<Option<SyncRuntime>>,
    closed: AtomicBool,
}

impl Database {
    /// Open or create a database for `config`.
    ///
    /// If `config.path` is set, this is where `synapsedb.toml` lives: an
    /// existing file there takes precedence over the `config` argument
    /// (edit the file and reopen to change settings); if none exists yet,
    /// `config` itself is written out as the new default. An in-memory
    /// database (`config.path = None`) never touches the filesystem.
    pub fn open(config: DatabaseConfig) -> DbResult<Arc<Database>> {
        Self::open_as(config, format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]))
    }

    /// As [`Self::open`], but with an explicit, caller-chosen node
    /// identity instead of a randomly generated one. The identity is
    /// stamped on every locally originated change and used by sync to
    /// recognize (and skip re-applying) its own reflected writes, so
    /// peers in a cluster must each use a stable, distinct value.
    pub fn open_as(config: DatabaseConfig, local_node: impl Into<String>) -> DbResult<Arc<Database>> {
        let local_node = local_node.into();

        let (resolved_config, config_path) = match &config.path {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let config_path = dir.join(CONFIG_FILE_NAME);
                let resolved = if config_path.exists() {
                    DatabaseConfig::from_file(&config_path)?
                } else {
                    config.write_to_file(&config_path)?;
                    config.clone()
                };
                (resolved, Some(config_path))
            }
            None => (config, None),
        };

        let substrate_path = resolved_config.path.as_ref().map(|dir| dir.join("synapsedb.sqlite3"));
        let substrate = Arc::new(SqlSubstrate::open(substrate_path.as_deref())?);

        info!(
            dimension = resolved_config.dimension,
            in_memory = resolved_config.in_memory,
            node = %local_node,
            "database opened"
        );

        Ok(Arc::new(Database {
            substrate,
            config: resolved_config,
            config_path,
            local_node,
            shards: DashMap::new(),
            sync: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::NotInitialized);
        }
        Ok(())
    }

    /// This database's resolved configuration (after loading
    /// `synapsedb.toml`, if any).
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The node identity this handle syncs under.
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Create a new, empty shard named `name`.
    pub fn create_shard(&self, name: impl Into<String>) -> DbResult<Arc<Shard>> {
        self.check_open()?;
        let id = ShardId::new(name);
        if self.shards.contains_key(&id) {
            return Err(DbError::DuplicateShard(id.as_str().to_string()));
        }
        let shard = Arc::new(Shard::open(self.substrate.clone(), id.clone(), &self.config, self.local_node.clone())?);
        self.shards.insert(id, shard.clone());
        Ok(shard)
    }

    /// Look up an already-created shard, opening it from persisted state
    /// on first access within this process.
    pub fn shard(&self, name: &str) -> DbResult<Arc<Shard>> {
        self.check_open()?;
        let id = ShardId::new(name);
        if let Some(existing) = self.shards.get(&id) {
            return Ok(existing.clone());
        }
        Err(DbError::NotFound(format!("shard '{name}'")))
    }

    /// Look up a shard, opening it from persisted state if it exists in
    /// the substrate but has not yet been touched in this process.
    /// Unlike [`Self::shard`], this recognizes shards created by an
    /// earlier process against the same substrate.
    pub fn open_shard(&self, name: &str) -> DbResult<Arc<Shard>> {
        self.check_open()?;
        let id = ShardId::new(name);
        if let Some(existing) = self.shards.get(&id) {
            return Ok(existing.clone());
        }
        if !self.shard_exists_in_substrate(&id)? {
            return Err(DbError::NotFound(format!("shard '{name}'")));
        }
        let shard = Arc::new(Shard::open(self.substrate.clone(), id.clone(), &self.config, self.local_node.clone())?);
        self.shards.insert(id, shard.clone());
        Ok(shard)
    }

    fn shard_exists_in_substrate(&self, id: &ShardId) -> DbResult<bool> {
        let exists: bool = self.substrate.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM changelog WHERE shard_id = ?1) \
                 OR EXISTS(SELECT 1 FROM vectors WHERE shard_id = ?1)",
                [id.as_str()],
                |row| row.get(0),
            )
        })?;
        Ok(exists)
    }

    /// Names of every shard registered in this process.
    pub fn list_shards(&self) -> Vec<ShardId> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove a shard and every row it persisted (vectors, HNSW graph,
    /// quantizer state, changelog, sync watermarks). Irreversible.
    pub fn drop_shard(&self, name: &str) -> DbResult<()> {
        self.check_open()?;
        let id = ShardId::new(name);
        let Some((_, shard)) = self.shards.remove(&id) else {
            return Err(DbError::NotFound(format!("shard '{name}'")));
        };
        drop(shard);

        self.substrate.transaction(|s| {
            for table in [
                "vectors",
                "hnsw_nodes",
                "hnsw_edges",
                "hnsw_metadata",
                "quantizer_state",
                "changelog",
            ] {
                s.with_connection(|conn| {
                    conn.execute(&format!("DELETE FROM {table} WHERE shard_id = ?1"), [id.as_str()])
                })?;
            }
            s.with_connection(|conn| {
                conn.execute("DELETE FROM sync_session WHERE key LIKE ?1", [format!("sync_session:{}:%", id.as_str())])
            })?;
            Ok(())
        })?;
        Ok(())
    }

    /// Bind a UDP transport and spin up the sync engine/coordinator for
    /// this database. Idempotent: a later call replaces the previous
    /// runtime (existing auto-sync timers are cancelled first).
    pub async fn enable_sync(&self, bind_addr: &str) -> DbResult<()> {
        self.check_open()?;
        let transport = UdpTransport::bind(bind_addr).await?;
        let sync_config = SyncConfig {
            node_id: self.local_node.clone(),
            batch_size: self.config.sync.batch_size,
            conflict_strategy: self.config.sync.conflict_strategy()?,
            request_timeout: std::time::Duration::from_secs(10),
            sync_interval_ms: self.config.sync.sync_interval_ms,
        };
        let engine = Arc::new(SyncEngine::new(transport.clone(), self.substrate.clone(), sync_config));
        let coordinator = Arc::new(ShardCoordinator::with_retry_policy(
            engine.clone(),
            4,
            self.config.sync.max_retries,
            self.config.sync.retry_backoff(),
        ));

        if let Some(previous) = self.sync.write().replace(SyncRuntime { transport, engine, coordinator }) {
            previous.engine.shutdown();
            previous.transport.close().await;
        }
        Ok(())
    }

    fn sync_runtime(&self) -> DbResult<(Arc<SyncEngine<UdpTransport>>, Arc<ShardCoordinator<UdpTransport>>)> {
        let guard = self.sync.read();
        let runtime = guard
            .as_ref()
            .ok_or_else(|| DbError::InvalidArgument("sync is not enabled; call enable_sync first".to_string()))?;
        Ok((runtime.engine.clone(), runtime.coordinator.clone()))
    }

    fn shard_lookup(&self) -> impl Fn(&ShardId) -> Option<Arc<Shard>> + '_ {
        move |id: &ShardId| self.shards.get(id).map(|e| e.value().clone())
    }

    /// Reconcile one shard with one peer immediately, outside the
    /// priority queue.
    pub async fn sync_shard_with_peer(&self, shard_name: &str, peer_address: &str) -> DbResult<SyncOutcome> {
        self.check_open()?;
        let (engine, _) = self.sync_runtime()?;
        let shard = self.shard(shard_name)?;
        let id = shard.id().clone();
        Ok(engine.sync(shard.as_ref(), &id, peer_address).await)
    }

    /// Queue and drain a sync round for every registered shard against
    /// `peer_address`, via the coordinator's priority queue and retry
    /// policy.
    pub async fn sync_all_with_peer(&self, peer_address: &str) -> DbResult<()> {
        self.check_open()?;
        let (_, coordinator) = self.sync_runtime()?;
        let shard_ids = self.list_shards();
        coordinator.sync_with_peer(peer_address.to_string(), shard_ids, self.shard_lookup()).await;
        Ok(())
    }

    /// Start the coordinator's periodic auto-sync timer against every
    /// `(shard, peer)` pair in `targets`. A no-op if
    /// `sync.sync_interval_ms` is `0`. Stops when [`Self::close`] is
    /// called, or a subsequent [`Self::enable_sync`] replaces the runtime.
    pub fn start_auto_sync(self: &Arc<Self>, targets: Vec<(ShardId, String)>) -> DbResult<()> {
        self.check_open()?;
        let guard = self.sync.read();
        let runtime = guard
            .as_ref()
            .ok_or_else(|| DbError::InvalidArgument("sync is not enabled; call enable_sync first".to_string()))?;
        let db = Arc::clone(self);
        runtime
            .engine
            .start_auto_sync(targets, move |id: &ShardId| db.shards.get(id).map(|e| e.value().clone()));
        Ok(())
    }

    /// Last known online/offline status of every peer touched by a
    /// health check or sync round so far.
    pub fn peer_statuses(&self) -> DbResult<std::collections::HashMap<String, PeerInfo>> {
        let (_, coordinator) = self.sync_runtime()?;
        Ok(coordinator.peer_statuses())
    }

    /// Aggregate sync statistics (counts, EWMA duration, conflicts).
    pub fn sync_stats(&self) -> DbResult<CoordinatorStats> {
        let (_, coordinator) = self.sync_runtime()?;
        Ok(coordinator.stats())
    }

    /// Cancel any running auto-sync timer, flush every shard's in-flight
    /// HNSW index state, and mark this handle closed. Idempotent; further
    /// calls on shard handles obtained before `close` return
    /// [`DbError::NotInitialized`] only through `Database` methods — the
    /// `Arc<Shard>` itself stays usable since its lifetime is independent.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(runtime) = self.sync.write().take() {
            runtime.engine.shutdown();
        }
        for entry in self.shards.iter() {
            if let Err(e) = entry.value().flush_index() {
                warn!(shard = %entry.key(), error = %e, "failed to flush shard on close");
            }
        }
        info!(node = %self.local_node, "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::{VectorId, VectorRecord};

    #[test]
    fn create_shard_then_duplicate_name_fails() {
        let db = Database::open(DatabaseConfig::in_memory(3)).unwrap();
        db.create_shard("memories").unwrap();
        let err = db.create_shard("memories").unwrap_err();
        assert!(matches!(err, DbError::DuplicateShard(_)));
    }

    #[test]
    fn shard_round_trips_a_vector() {
        let db = Database::open(DatabaseConfig::in_memory(3)).unwrap();
        let shard = db.create_shard("memories").unwrap();
        let id = shard
            .insert(VectorRecord::new(VectorId::from("a"), vec![1.0, 2.0, 3.0], None))
            .unwrap();
        assert!(shard.get(&id).unwrap().is_some());
    }

    #[test]
    fn drop_shard_removes_it_from_the_registry() {
        let db = Database::open(DatabaseConfig::in_memory(3)).unwrap();
        db.create_shard("memories").unwrap();
        db.drop_shard("memories").unwrap();
        assert!(db.shard("memories").is_err());
        assert!(db.list_shards().is_empty());
    }

    #[test]
    fn shard_not_found_for_unknown_name() {
        let db = Database::open(DatabaseConfig::in_memory(3)).unwrap();
        assert!(matches!(db.shard("nope").unwrap_err(), DbError::NotFound(_)));
    }

    #[test]
    fn open_writes_default_config_file_on_first_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig::at_path(dir.path(), 8);
        let db = Database::open(config).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(db.config().dimension, 8);
    }

    #[test]
    fn reopening_an_existing_directory_reloads_its_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = Database::open(DatabaseConfig::at_path(dir.path(), 8)).unwrap();
            db.close().unwrap();
        }
        // A later open with a different requested dimension is overridden
        // by the file written on first run.
        let db = Database::open(DatabaseConfig::at_path(dir.path(), 99)).unwrap();
        assert_eq!(db.config().dimension, 8);
    }

    #[tokio::test]
    async fn sync_operations_fail_clearly_before_enable_sync() {
        let db = Database::open(DatabaseConfig::in_memory(3)).unwrap();
        let err = db.sync_all_with_peer("127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }
}
