//! The k-NN query pipeline: candidate generation (HNSW or brute-force
//! scan), optional two-stage binary-quantizer prefilter, exact rerank,
//! metadata filtering, ordering and pagination.
//!
//! Builds on [`synapse_storage`] for scan/get, [`synapse_index`] for
//! approximate candidate generation, and [`synapse_quant`] for the
//! asymmetric distance used when reranking quantized embeddings. Only
//! [`synapse_cache`] and the facade sit above this crate in the
//! dependency order.

pub mod engine;
pub mod error;
pub mod filter;
pub mod query_builder;

pub use engine::{QueryContext, QueryEngine, SearchHit, SearchParams};
pub use error::{QueryError, QueryResult};
pub use filter::Filter;
pub use query_builder::{OrderBy, QueryBuilder, SortDirection};
