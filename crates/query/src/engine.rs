//! Candidate generation, rerank, filter, order and paginate — the six
//! steps of §4.2 of the specification, run in that order.

use crate::error::{QueryError, QueryResult};
use crate::filter::Filter;
use crate::query_builder::{OrderBy, SortDirection};
use serde_json::Value as JsonValue;
use synapse_core::metric::{compute_score, Metric};
use synapse_core::{VectorId, VectorRecord};
use synapse_index::HnswIndex;
use synapse_quant::Quantizer;
use synapse_storage::ShardStorage;
use tracing::{debug, trace};

/// How many Hamming-nearest candidates a two-stage search keeps from the
/// binary-quantizer coarse pass before exact reranking.
const DEFAULT_OVER_FETCH: usize = 200;

/// The read-only handles a single search needs. Borrowed for the
/// duration of one call; the facade is responsible for holding the
/// shard's lock while this runs.
pub struct QueryContext<'a> {
    pub storage: &'a ShardStorage,
    pub index: Option<&'a HnswIndex>,
    pub quantizer: Option<&'a Quantizer>,
}

/// Fully resolved parameters for one search, produced either directly or
/// via [`crate::query_builder::QueryBuilder`].
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: Vec<f32>,
    pub k: usize,
    pub metric: Metric,
    /// Minimum-cutoff threshold in the direction [`Metric::meets_threshold`] expects.
    pub threshold: f32,
    pub filter: Option<Filter>,
    pub order: OrderBy,
    pub offset: usize,
    /// `None` means "no further limit beyond `k`" after filtering.
    pub limit: Option<usize>,
    /// Whether to rerank using the quantizer's asymmetric distance
    /// instead of the exact metric kernel, when a trained quantizer is
    /// available. Only meaningful under [`Metric::Euclidean`] — every
    /// codec's asymmetric distance is euclidean-shaped.
    pub approximate: bool,
    /// Coarse-filter through the binary quantizer before exact rerank.
    pub two_stage: bool,
    /// Candidates kept by the two-stage coarse pass.
    pub over_fetch: usize,
    pub include_metadata: bool,
    pub include_embedding: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            query: Vec::new(),
            k: 10,
            metric: Metric::Cosine,
            threshold: match Metric::Cosine {
                Metric::Cosine | Metric::Dot => f32::NEG_INFINITY,
                Metric::Euclidean => f32::INFINITY,
            },
            filter: None,
            order: OrderBy::Similarity(SortDirection::Descending),
            offset: 0,
            limit: None,
            approximate: false,
            two_stage: false,
            over_fetch: DEFAULT_OVER_FETCH,
            include_metadata: true,
            include_embedding: false,
        }
    }
}

/// One result row: a candidate's id, its score under the query's metric,
/// and whatever projection of metadata/embedding the caller asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: VectorId,
    pub score: f32,
    pub metadata: Option<JsonValue>,
    pub embedding: Option<Vec<f32>>,
}

struct Candidate {
    record: VectorRecord,
    score: f32,
}

/// Stateless driver for the search algorithm; all state lives in the
/// [`QueryContext`] and [`SearchParams`] passed to [`Self::search`].
pub struct QueryEngine;

impl QueryEngine {
    /// Run one k-NN search to completion.
    pub fn search(ctx: &QueryContext<'_>, params: &SearchParams) -> QueryResult<Vec<SearchHit>> {
        let dimension = ctx.storage.dimension();
        if params.query.len() != dimension {
            return Err(QueryError::DimensionMismatch {
                expected: dimension,
                got: params.query.len(),
            });
        }
        if params.k == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = Self::generate_candidates(ctx, params)?;
        trace!(count = candidates.len(), "generated candidates");

        if params.two_stage {
            candidates = Self::two_stage_prefilter(ctx, params, candidates)?;
        }

        Self::rerank(ctx, params, &mut candidates)?;

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|c| params.metric.meets_threshold(c.score, params.threshold))
            .filter(|c| {
                params
                    .filter
                    .as_ref()
                    .map(|f| f.evaluate(c.record.metadata.as_ref()))
                    .unwrap_or(true)
            })
            .map(|c| SearchHit {
                id: c.record.id.clone(),
                score: c.score,
                metadata: if params.include_metadata { c.record.metadata } else { None },
                embedding: if params.include_embedding { Some(c.record.embedding) } else { None },
            })
            .collect();

        Self::order(params, &mut hits);
        let paginated = Self::paginate(params, hits);
        debug!(returned = paginated.len(), "search complete");
        Ok(paginated)
    }

    /// Step 1: HNSW if built and the shard is large enough, else a full
    /// scan through the metric kernel.
    fn generate_candidates(ctx: &QueryContext<'_>, params: &SearchParams) -> QueryResult<Vec<Candidate>> {
        let use_index = ctx
            .index
            .map(|idx| idx.is_ready() && idx.len() >= idx.config().min_vectors_for_index)
            .unwrap_or(false);

        if use_index {
            let index = ctx.index.expect("checked above");
            let ef = params.k.max(index.config().ef_search);
            let approx = index.search(&params.query, ef)?;

            let mut candidates = Vec::with_capacity(approx.len());
            for (vector_id, _euclidean_distance) in approx {
                if let Some(record) = ctx.storage.get(&vector_id)? {
                    candidates.push(Candidate { record, score: 0.0 });
                }
            }
            Ok(candidates)
        } else {
            let mut candidates = Vec::new();
            for record in ctx.storage.scan() {
                candidates.push(Candidate { record: record?, score: 0.0 });
            }
            Ok(candidates)
        }
    }

    /// Step 2 (optional): coarse Hamming-nearest filter through a trained
    /// binary quantizer.
    fn two_stage_prefilter(
        ctx: &QueryContext<'_>,
        params: &SearchParams,
        candidates: Vec<Candidate>,
    ) -> QueryResult<Vec<Candidate>> {
        let binary = match ctx.quantizer {
            Some(Quantizer::Binary(binary)) if binary.is_trained() => binary,
            _ => return Ok(candidates),
        };

        let query_code = binary.encode(&params.query)?;
        let mut scored: Vec<(u32, Candidate)> = candidates
            .into_iter()
            .map(|c| {
                let code = binary.encode(&c.record.embedding).unwrap_or_default();
                let distance = synapse_quant::binary::BinaryQuantizer::hamming_distance(&query_code, &code);
                (distance, c)
            })
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.record.id.cmp(&b.1.record.id)));
        scored.truncate(params.over_fetch);
        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Step 3: compute the exact metric for each candidate, or the
    /// quantizer's asymmetric distance when approximate scoring was
    /// requested against a trained codec under euclidean.
    fn rerank(ctx: &QueryContext<'_>, params: &SearchParams, candidates: &mut [Candidate]) -> QueryResult<()> {
        let asymmetric_quantizer = if params.approximate && params.metric == Metric::Euclidean {
            ctx.quantizer.filter(|q| q.is_trained())
        } else {
            None
        };

        for c in candidates.iter_mut() {
            c.score = match asymmetric_quantizer {
                Some(q) => {
                    let code = q.encode(&c.record.embedding)?;
                    q.asymmetric_distance(&params.query, &code)?
                }
                None => compute_score(&params.query, &c.record.embedding, params.metric),
            };
        }
        Ok(())
    }

    /// Step 5: sort by similarity (best-first under the query's metric)
    /// or by a metadata path, ties broken by id.
    fn order(params: &SearchParams, hits: &mut [SearchHit]) {
        match &params.order {
            OrderBy::Similarity(direction) => {
                hits.sort_by(|a, b| {
                    let ordering = a
                        .score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal);
                    let metric_first = if params.metric.is_better(a.score, b.score) {
                        std::cmp::Ordering::Less
                    } else if params.metric.is_better(b.score, a.score) {
                        std::cmp::Ordering::Greater
                    } else {
                        ordering
                    };
                    let directed = match direction {
                        SortDirection::Descending => metric_first,
                        SortDirection::Ascending => metric_first.reverse(),
                    };
                    directed.then_with(|| a.id.cmp(&b.id))
                });
            }
            OrderBy::MetadataPath(path, direction) => {
                hits.sort_by(|a, b| {
                    let av = resolve_path(a.metadata.as_ref(), path);
                    let bv = resolve_path(b.metadata.as_ref(), path);
                    let ordering = compare_json(av, bv);
                    let directed = match direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    directed.then_with(|| a.id.cmp(&b.id))
                });
            }
        }
    }

    /// Step 6: offset then limit, capped at `k`.
    fn paginate(params: &SearchParams, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let capped = params.limit.map(|l| l.min(params.k)).unwrap_or(params.k);
        hits.into_iter().skip(params.offset).take(capped).collect()
    }
}

fn resolve_path<'a>(metadata: Option<&'a JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut current = metadata?;
    for segment in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Order two optional JSON values: missing sorts before present, numbers
/// compare numerically, everything else falls back to string comparison.
fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use synapse_core::{ShardId, VectorRecord};
    use synapse_storage::SqlSubstrate;

    fn new_storage(dimension: usize) -> ShardStorage {
        let substrate = Arc::new(SqlSubstrate::open(None).unwrap());
        ShardStorage::open(substrate, ShardId::new("s1"), dimension, "node-a").unwrap()
    }

    fn insert(storage: &ShardStorage, id: &str, embedding: Vec<f32>, tag: &str) -> VectorId {
        let record = VectorRecord::new(
            VectorId::from(id),
            embedding,
            Some(serde_json::json!({"tag": tag})),
        );
        storage.insert(record).unwrap()
    }

    #[test]
    fn basic_search_orders_by_cosine_similarity() {
        let storage = new_storage(2);
        insert(&storage, "a", vec![1.0, 0.0], "a");
        insert(&storage, "b", vec![0.0, 1.0], "b");
        insert(&storage, "c", vec![-1.0, 0.0], "c");

        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams {
            query: vec![1.0, 0.0],
            k: 2,
            metric: Metric::Cosine,
            ..Default::default()
        };
        let hits = QueryEngine::search(&ctx, &params).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, VectorId::from("a"));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn k_zero_returns_empty() {
        let storage = new_storage(2);
        insert(&storage, "a", vec![1.0, 0.0], "a");
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams { query: vec![1.0, 0.0], k: 0, ..Default::default() };
        assert!(QueryEngine::search(&ctx, &params).unwrap().is_empty());
    }

    #[test]
    fn k_larger_than_shard_returns_all() {
        let storage = new_storage(1);
        insert(&storage, "a", vec![1.0], "a");
        insert(&storage, "b", vec![2.0], "b");
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams { query: vec![1.0], k: 100, metric: Metric::Euclidean, ..Default::default() };
        assert_eq!(QueryEngine::search(&ctx, &params).unwrap().len(), 2);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let storage = new_storage(3);
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams { query: vec![1.0, 0.0], ..Default::default() };
        assert!(matches!(
            QueryEngine::search(&ctx, &params),
            Err(QueryError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn metadata_filter_restricts_results() {
        let storage = new_storage(1);
        insert(&storage, "a", vec![1.0], "keep");
        insert(&storage, "b", vec![1.1], "drop");

        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams {
            query: vec![1.0],
            k: 10,
            metric: Metric::Euclidean,
            filter: Some(Filter::Eq("tag".into(), serde_json::json!("keep"))),
            ..Default::default()
        };
        let hits = QueryEngine::search(&ctx, &params).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, VectorId::from("a"));
    }

    #[test]
    fn ties_break_by_id_lexicographic_order() {
        let storage = new_storage(1);
        insert(&storage, "z", vec![1.0], "z");
        insert(&storage, "a", vec![1.0], "a");

        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams { query: vec![1.0], k: 10, metric: Metric::Euclidean, ..Default::default() };
        let hits = QueryEngine::search(&ctx, &params).unwrap();
        assert_eq!(hits[0].id, VectorId::from("a"));
        assert_eq!(hits[1].id, VectorId::from("z"));
    }

    #[test]
    fn pagination_applies_offset_then_limit() {
        let storage = new_storage(1);
        for i in 0..5 {
            insert(&storage, &format!("v{i}"), vec![i as f32], "t");
        }
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };
        let params = SearchParams {
            query: vec![0.0],
            k: 10,
            metric: Metric::Euclidean,
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let hits = QueryEngine::search(&ctx, &params).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, VectorId::from("v1"));
        assert_eq!(hits[1].id, VectorId::from("v2"));
    }
}
