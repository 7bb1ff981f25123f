//! The query-result cache: an LRU of recent search results keyed by a
//! bit-exact fingerprint of the query, with TTL expiry on read.
//!
//! Builds on [`synapse_query`] for the result and parameter shapes the
//! cache memoizes; nothing above this crate (only [`synapse_sync`] and
//! the facade) needs to know the cache exists at all — every mutation
//! just calls [`QueryCache::invalidate`].
//!
//! Cache contents are a performance hint only: every response this crate
//! returns must equal what [`synapse_query::QueryEngine::search`] would
//! have produced on a miss. There is no partial invalidation — any
//! mutation on a shard (insert, update, delete, quantizer retrain, index
//! rebuild) clears the whole cache for that shard.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use synapse_query::{Filter, SearchHit, SearchParams};
use tracing::trace;

/// A fingerprint of everything that determines a search's result:
/// the query embedding compared bit-exact (not within some epsilon — a
/// perturbed embedding is a different query), `k`, metric, threshold and
/// the metadata filter spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    embedding_bits: Vec<u32>,
    k: usize,
    metric: u8,
    threshold_bits: u32,
    // `Filter`/`serde_json::Value` aren't `Hash`, so the filter spec is
    // fingerprinted via its `Debug` rendering — deterministic for a given
    // structure and cheap relative to a search itself.
    filter_repr: String,
}

impl CacheKey {
    /// Build a fingerprint from a fully resolved set of search parameters.
    pub fn from_params(params: &SearchParams) -> Self {
        CacheKey {
            embedding_bits: params.query.iter().map(|x| x.to_bits()).collect(),
            k: params.k,
            metric: metric_tag(params.metric),
            threshold_bits: params.threshold.to_bits(),
            filter_repr: format_filter(params.filter.as_ref()),
        }
    }
}

fn metric_tag(metric: synapse_core::metric::Metric) -> u8 {
    use synapse_core::metric::Metric;
    match metric {
        Metric::Cosine => 0,
        Metric::Euclidean => 1,
        Metric::Dot => 2,
    }
}

fn format_filter(filter: Option<&Filter>) -> String {
    match filter {
        Some(f) => format!("{f:?}"),
        None => String::new(),
    }
}

struct Entry {
    hits: Vec<SearchHit>,
    expires_at: Instant,
}

/// A per-shard query-result cache. `max_size` bounds entry count (LRU
/// eviction on insert when full); `ttl` bounds entry age (checked on
/// read, not proactively swept).
pub struct QueryCache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    ttl: Duration,
    enabled: bool,
}

impl QueryCache {
    /// Construct a cache holding at most `max_size` entries (clamped to
    /// at least 1 when `enabled`), each valid for `ttl_ms` milliseconds.
    /// `enabled = false` makes every operation a no-op, so callers can
    /// leave the cache wired in and configure it off.
    pub fn new(max_size: usize, ttl_ms: u64, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        QueryCache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_millis(ttl_ms),
            enabled,
        }
    }

    /// Look up `key`, returning `None` on a miss or an expired entry.
    /// An expired entry is evicted as a side effect of the read.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<SearchHit>> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.hits.clone()),
            Some(_) => {
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    /// Record `hits` for `key`, evicting the least-recently-used entry if
    /// the cache is already at `max_size`.
    pub fn put(&self, key: CacheKey, hits: Vec<SearchHit>) {
        if !self.enabled {
            return;
        }
        let entry = Entry {
            hits,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.lock().put(key, entry);
    }

    /// Clear every entry. Called by the shard on any mutation — the
    /// cache's only consistency discipline.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        let had = inner.len();
        inner.clear();
        if had > 0 {
            trace!(evicted = had, "query cache invalidated");
        }
    }

    /// Current entry count, for stats reporting.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use synapse_core::metric::Metric;
    use synapse_core::VectorId;

    fn params(query: Vec<f32>) -> SearchParams {
        SearchParams {
            query,
            k: 5,
            metric: Metric::Cosine,
            ..Default::default()
        }
    }

    fn hit(id: &str) -> SearchHit {
        SearchHit {
            id: VectorId::from(id),
            score: 1.0,
            metadata: None,
            embedding: None,
        }
    }

    #[test]
    fn miss_then_hit_after_put() {
        let cache = QueryCache::new(16, 60_000, true);
        let key = CacheKey::from_params(&params(vec![1.0, 0.0]));
        assert!(cache.get(&key).is_none());

        cache.put(key.clone(), vec![hit("a")]);
        assert_eq!(cache.get(&key).unwrap()[0].id, VectorId::from("a"));
    }

    #[test]
    fn bit_exact_perturbation_is_a_different_key() {
        let a = CacheKey::from_params(&params(vec![1.0, 0.0]));
        let b = CacheKey::from_params(&params(vec![1.0 + f32::EPSILON, 0.0]));
        assert_ne!(a, b);
    }

    #[test]
    fn invalidate_clears_every_entry() {
        let cache = QueryCache::new(16, 60_000, true);
        let key = CacheKey::from_params(&params(vec![1.0, 0.0]));
        cache.put(key.clone(), vec![hit("a")]);
        assert_eq!(cache.len(), 1);

        cache.invalidate();
        assert!(cache.is_empty());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn ttl_expiry_on_read() {
        let cache = QueryCache::new(16, 1, true);
        let key = CacheKey::from_params(&params(vec![1.0, 0.0]));
        cache.put(key.clone(), vec![hit("a")]);
        sleep(Duration::from_millis(20));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn lru_eviction_when_full() {
        let cache = QueryCache::new(2, 60_000, true);
        let k1 = CacheKey::from_params(&params(vec![1.0]));
        let k2 = CacheKey::from_params(&params(vec![2.0]));
        let k3 = CacheKey::from_params(&params(vec![3.0]));

        cache.put(k1.clone(), vec![hit("a")]);
        cache.put(k2.clone(), vec![hit("b")]);
        cache.get(&k1); // touch k1 so k2 is the least-recently-used
        cache.put(k3.clone(), vec![hit("c")]);

        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn disabled_cache_is_always_a_miss() {
        let cache = QueryCache::new(16, 60_000, false);
        let key = CacheKey::from_params(&params(vec![1.0]));
        cache.put(key.clone(), vec![hit("a")]);
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }
}
