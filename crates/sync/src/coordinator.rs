//! Schedules and throttles sync tasks across many `(shard, peer)` pairs.
//!
//! The priority queue follows the same higher-priority-first,
//! older-first-on-tie ordering the teacher's background task scheduler
//! uses for its `BinaryHeap<TaskEnvelope>`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use synapse_core::ShardId;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::changelog::ChangelogReader;
use crate::engine::{SyncConfig, SyncEngine, SyncOutcome};
use crate::transport::SyncTransport;

/// Online/offline status tracked per peer by [`ShardCoordinator::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
}

/// A peer's last known status and contact time.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub status: PeerStatus,
    pub last_contact: Option<Instant>,
}

/// A pending sync task: a `(shard, peer)` pair with a priority and retry
/// count.
#[derive(Debug, Clone)]
struct SyncTask {
    shard_id: ShardId,
    peer_address: String,
    priority: i32,
    sequence: u64,
    retries: u32,
}

impl SyncTask {
    fn key(&self) -> String {
        task_key(&self.shard_id, &self.peer_address)
    }
}

fn task_key(shard_id: &ShardId, peer: &str) -> String {
    format!("{}||{}", shard_id.as_str(), peer)
}

impl Eq for SyncTask {}

impl PartialEq for SyncTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first; among equal priorities, older (lower sequence) first.
impl Ord for SyncTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for SyncTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed priorities used by the bulk scheduling helpers.
pub const PRIORITY_SYNC_ALL: i32 = 1;
pub const PRIORITY_SYNC_WITH_PEER: i32 = 2;
pub const PRIORITY_SYNC_SHARD: i32 = 5;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Aggregate statistics the coordinator exposes for observability.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub total_shards: usize,
    pub active_syncs: usize,
    pub total_syncs: u64,
    pub total_conflicts: u64,
    /// Exponentially weighted moving average of sync duration (α = 0.3).
    pub avg_duration_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct Inner {
    queue: Mutex<BinaryHeap<SyncTask>>,
    in_flight: Mutex<HashSet<String>>,
    peers: Mutex<HashMap<String, PeerInfo>>,
    sequence: AtomicU64,
    stats: Mutex<CoordinatorStats>,
    seen_shards: Mutex<HashSet<ShardId>>,
}

const EWMA_ALPHA: f64 = 0.3;

/// Throttles and schedules sync work across every registered shard/peer
/// pair, bounded by `max_concurrent_syncs` concurrent in-flight tasks.
pub struct ShardCoordinator<T: SyncTransport> {
    engine: Arc<SyncEngine<T>>,
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<T: SyncTransport + 'static> ShardCoordinator<T> {
    pub fn new(engine: Arc<SyncEngine<T>>, max_concurrent_syncs: usize) -> Self {
        Self::with_retry_policy(
            engine,
            max_concurrent_syncs,
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(0),
        )
    }

    /// Like [`Self::new`], but with a caller-chosen retry budget and
    /// per-attempt backoff instead of the defaults (3 retries, no
    /// backoff), per `sync.max_retries`/`sync.retry_backoff_ms` in the
    /// facade's configuration.
    pub fn with_retry_policy(
        engine: Arc<SyncEngine<T>>,
        max_concurrent_syncs: usize,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        ShardCoordinator {
            engine,
            inner: Arc::new(Inner {
                queue: Mutex::new(BinaryHeap::new()),
                in_flight: Mutex::new(HashSet::new()),
                peers: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                stats: Mutex::new(CoordinatorStats::default()),
                seen_shards: Mutex::new(HashSet::new()),
            }),
            semaphore: Arc::new(Semaphore::new(max_concurrent_syncs.max(1))),
            max_retries,
            retry_backoff,
        }
    }

    /// Enqueue `(shard, peer)` at `priority`; higher values run first.
    pub fn schedule(&self, shard_id: ShardId, peer_address: impl Into<String>, priority: i32) {
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner.seen_shards.lock().insert(shard_id.clone());
        self.inner.queue.lock().push(SyncTask {
            shard_id,
            peer_address: peer_address.into(),
            priority,
            sequence,
            retries: 0,
        });
    }

    /// Enqueue every shard/peer pair in `pairs` at the fixed priority used
    /// by the corresponding bulk helper (`sync_all` = 1, `sync_shard` = 5,
    /// `sync_with_peer` = 2), then drain the queue.
    pub async fn sync_all<F, S>(&self, pairs: Vec<(ShardId, String)>, shard_lookup: F)
    where
        F: Fn(&ShardId) -> Option<Arc<S>>,
        S: ChangelogReader + Send + Sync + 'static,
    {
        for (shard_id, peer) in pairs {
            self.schedule(shard_id, peer, PRIORITY_SYNC_ALL);
        }
        self.execute_all(shard_lookup).await;
    }

    /// Schedule and drain every peer pair for one shard.
    pub async fn sync_shard<F, S>(&self, shard_id: ShardId, peers: Vec<String>, shard_lookup: F)
    where
        F: Fn(&ShardId) -> Option<Arc<S>>,
        S: ChangelogReader + Send + Sync + 'static,
    {
        for peer in peers {
            self.schedule(shard_id.clone(), peer, PRIORITY_SYNC_SHARD);
        }
        self.execute_all(shard_lookup).await;
    }

    /// Schedule and drain every shard against one peer.
    pub async fn sync_with_peer<F, S>(&self, peer_address: String, shard_ids: Vec<ShardId>, shard_lookup: F)
    where
        F: Fn(&ShardId) -> Option<Arc<S>>,
        S: ChangelogReader + Send + Sync + 'static,
    {
        for shard_id in shard_ids {
            self.schedule(shard_id, peer_address.clone(), PRIORITY_SYNC_WITH_PEER);
        }
        self.execute_all(shard_lookup).await;
    }

    /// Repeatedly pop the highest-priority task not already in flight and
    /// run it, up to the concurrency cap, until the queue (including
    /// retries re-enqueued on failure) is empty.
    pub async fn execute_all<F, S>(&self, shard_lookup: F)
    where
        F: Fn(&ShardId) -> Option<Arc<S>>,
        S: ChangelogReader + Send + Sync + 'static,
    {
        loop {
            let task = {
                let mut queue = self.inner.queue.lock();
                let mut in_flight = self.inner.in_flight.lock();
                let mut deferred = Vec::new();
                let mut picked = None;
                while let Some(task) = queue.pop() {
                    if in_flight.contains(&task.key()) {
                        deferred.push(task);
                        continue;
                    }
                    in_flight.insert(task.key());
                    picked = Some(task);
                    break;
                }
                for task in deferred {
                    queue.push(task);
                }
                picked
            };

            let Some(task) = task else { break };

            let Some(shard) = shard_lookup(&task.shard_id) else {
                self.inner.in_flight.lock().remove(&task.key());
                warn!(shard = %task.shard_id, "coordinator could not resolve shard for scheduled sync");
                continue;
            };

            let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
            self.inner.stats.lock().active_syncs += 1;

            let outcome = self
                .engine
                .sync(shard.as_ref(), &task.shard_id, &task.peer_address)
                .await;

            self.inner.in_flight.lock().remove(&task.key());
            self.record_outcome(&outcome);

            if !outcome.success && task.retries < self.max_retries {
                if !self.retry_backoff.is_zero() {
                    tokio::time::sleep(self.retry_backoff * (task.retries + 1)).await;
                }
                let mut retried = task.clone();
                retried.retries += 1;
                retried.priority -= 1;
                retried.sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::SeqCst);
                self.inner.queue.lock().push(retried);
            }
        }
    }

    fn record_outcome(&self, outcome: &SyncOutcome) {
        let total_shards = self.inner.seen_shards.lock().len();
        let mut stats = self.inner.stats.lock();
        stats.active_syncs = stats.active_syncs.saturating_sub(1);
        stats.total_syncs += 1;
        stats.total_conflicts += outcome.conflicts_detected as u64;
        stats.total_shards = total_shards;
        stats.bytes_sent += outcome.bytes_sent;
        stats.bytes_received += outcome.bytes_received;
        if stats.total_syncs == 1 {
            stats.avg_duration_ms = outcome.duration_ms as f64;
        } else {
            stats.avg_duration_ms = EWMA_ALPHA * outcome.duration_ms as f64
                + (1.0 - EWMA_ALPHA) * stats.avg_duration_ms;
        }
    }

    /// Attempt a lightweight sync of the first shard registered for each
    /// peer, updating that peer's status and `last_contact`.
    pub async fn health_check<F, S>(&self, peers: &HashMap<String, ShardId>, shard_lookup: F)
    where
        F: Fn(&ShardId) -> Option<Arc<S>>,
        S: ChangelogReader + Send + Sync + 'static,
    {
        for (peer, shard_id) in peers {
            let status = match shard_lookup(shard_id) {
                Some(shard) => {
                    let outcome = self.engine.sync(shard.as_ref(), shard_id, peer).await;
                    if outcome.success {
                        PeerStatus::Online
                    } else {
                        PeerStatus::Offline
                    }
                }
                None => PeerStatus::Offline,
            };
            self.inner.peers.lock().insert(
                peer.clone(),
                PeerInfo {
                    status,
                    last_contact: Some(Instant::now()),
                },
            );
        }
    }

    /// The last known status of every peer that has been health-checked.
    pub fn peer_statuses(&self) -> HashMap<String, PeerInfo> {
        self.inner.peers.lock().clone()
    }

    /// A snapshot of the coordinator's aggregate statistics.
    pub fn stats(&self) -> CoordinatorStats {
        self.inner.stats.lock().clone()
    }

    /// Queue depth, for tests and diagnostics.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }
}
