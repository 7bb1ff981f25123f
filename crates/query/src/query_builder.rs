//! A fluent query builder producing the same results as
//! [`crate::engine::QueryEngine::search`] — metadata filters, ordering,
//! pagination and a metadata projection, chained onto a query embedding.

use crate::engine::{QueryContext, QueryEngine, SearchHit, SearchParams};
use crate::error::QueryResult;
use crate::filter::Filter;
use serde_json::Value as JsonValue;
use synapse_core::metric::Metric;

/// Direction of a sort, either on similarity or on a metadata path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "asc" | "ascending" => SortDirection::Ascending,
            _ => SortDirection::Descending,
        }
    }
}

/// What to sort results by.
#[derive(Debug, Clone)]
pub enum OrderBy {
    /// By the query's similarity score, best-first when `Descending`.
    Similarity(SortDirection),
    /// By a metadata path, missing values sorting first.
    MetadataPath(String, SortDirection),
}

/// Fluent k-NN query builder. Accumulates a [`SearchParams`] and executes
/// it against a [`QueryContext`] with [`Self::execute`].
///
/// ```ignore
/// QueryBuilder::similar_to(v)
///     .metric(Metric::Cosine)
///     .where_between("year", json!(2020), json!(2022))
///     .order_by_similarity("desc")
///     .limit(5)
///     .execute(&ctx)?;
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    params: SearchParams,
    filters: Vec<Filter>,
}

impl QueryBuilder {
    /// Start a builder for `query_embedding`, with every other parameter
    /// at its [`SearchParams::default`].
    pub fn similar_to(query_embedding: Vec<f32>) -> Self {
        QueryBuilder {
            params: SearchParams {
                query: query_embedding,
                ..Default::default()
            },
            filters: Vec::new(),
        }
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.params.metric = metric;
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.params.k = k;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.params.threshold = threshold;
        self
    }

    pub fn approximate(mut self, approximate: bool) -> Self {
        self.params.approximate = approximate;
        self
    }

    pub fn two_stage(mut self, over_fetch: usize) -> Self {
        self.params.two_stage = true;
        self.params.over_fetch = over_fetch;
        self
    }

    pub fn include_embedding(mut self, include: bool) -> Self {
        self.params.include_embedding = include;
        self
    }

    pub fn include_metadata(mut self, include: bool) -> Self {
        self.params.include_metadata = include;
        self
    }

    pub fn where_eq(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Eq(path.into(), value));
        self
    }

    pub fn where_ne(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Ne(path.into(), value));
        self
    }

    pub fn where_lt(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Lt(path.into(), value));
        self
    }

    pub fn where_le(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Le(path.into(), value));
        self
    }

    pub fn where_gt(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Gt(path.into(), value));
        self
    }

    pub fn where_ge(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.filters.push(Filter::Ge(path.into(), value));
        self
    }

    pub fn where_in(mut self, path: impl Into<String>, values: Vec<JsonValue>) -> Self {
        self.filters.push(Filter::In(path.into(), values));
        self
    }

    pub fn where_between(mut self, path: impl Into<String>, low: JsonValue, high: JsonValue) -> Self {
        self.filters.push(Filter::Between(path.into(), low, high));
        self
    }

    pub fn where_like(mut self, path: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filters.push(Filter::Like(path.into(), pattern.into()));
        self
    }

    /// Sort by similarity, `"asc"` or `"desc"` (anything else defaults
    /// to `"desc"`, the best-first convention).
    pub fn order_by_similarity(mut self, direction: &str) -> Self {
        self.params.order = OrderBy::Similarity(SortDirection::parse(direction));
        self
    }

    /// Sort by a metadata path instead of similarity.
    pub fn order_by(mut self, path: impl Into<String>, direction: &str) -> Self {
        self.params.order = OrderBy::MetadataPath(path.into(), SortDirection::parse(direction));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.params.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.params.limit = Some(limit);
        self
    }

    /// Collapse accumulated `where_*` calls into one filter (an implicit
    /// `AND`) and run the search.
    pub fn execute(mut self, ctx: &QueryContext<'_>) -> QueryResult<Vec<SearchHit>> {
        if !self.filters.is_empty() {
            self.params.filter = Some(Filter::And(self.filters.clone()));
        }
        QueryEngine::search(ctx, &self.params)
    }

    /// The accumulated parameters, for callers that want to inspect or
    /// reuse them without executing (e.g. the query-result cache's
    /// fingerprint).
    pub fn params(&self) -> SearchParams {
        let mut params = self.params.clone();
        if !self.filters.is_empty() {
            params.filter = Some(Filter::And(self.filters.clone()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use synapse_core::{ShardId, VectorId, VectorRecord};
    use synapse_storage::{ShardStorage, SqlSubstrate};

    fn shard_with_years(n: usize) -> ShardStorage {
        let substrate = Arc::new(SqlSubstrate::open(None).unwrap());
        let storage = ShardStorage::open(substrate, ShardId::new("s"), 4, "node-a").unwrap();
        for i in 0..n {
            let year = 2019 + (i % 6);
            let embedding = vec![(i as f32) / n as f32; 4];
            let record = VectorRecord::new(
                VectorId::from(format!("v{i}")),
                embedding,
                Some(json!({"year": year})),
            );
            storage.insert(record).unwrap();
        }
        storage
    }

    #[test]
    fn filtered_search_respects_between_and_limit() {
        let storage = shard_with_years(100);
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };

        let hits = QueryBuilder::similar_to(vec![0.5; 4])
            .metric(Metric::Cosine)
            .where_between("year", json!(2020), json!(2022))
            .order_by_similarity("desc")
            .limit(5)
            .execute(&ctx)
            .unwrap();

        assert!(hits.len() <= 5);
        for hit in &hits {
            let year = hit.metadata.as_ref().unwrap()["year"].as_i64().unwrap();
            assert!((2020..=2022).contains(&year));
        }
    }

    #[test]
    fn order_by_metadata_path_sorts_ascending() {
        let storage = shard_with_years(12);
        let ctx = QueryContext { storage: &storage, index: None, quantizer: None };

        let hits = QueryBuilder::similar_to(vec![0.0; 4])
            .metric(Metric::Euclidean)
            .k(12)
            .order_by("year", "asc")
            .execute(&ctx)
            .unwrap();

        let years: Vec<i64> = hits
            .iter()
            .map(|h| h.metadata.as_ref().unwrap()["year"].as_i64().unwrap())
            .collect();
        let mut sorted = years.clone();
        sorted.sort();
        assert_eq!(years, sorted);
    }
}
