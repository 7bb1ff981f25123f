//! Metadata filter expressions evaluated against a candidate's stored
//! metadata value.
//!
//! A filter path (`"tags.0"`, `"user.name"`) is resolved by walking a JSON
//! object/array tree; a path that doesn't resolve evaluates to `undefined`,
//! and every comparison against `undefined` is false except `!=` against a
//! defined target — this mirrors how a missing field behaves in a
//! duck-typed metadata store without requiring a schema.

use serde_json::Value as JsonValue;

/// A single metadata filter predicate, or a boolean combination of them.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, JsonValue),
    Ne(String, JsonValue),
    Lt(String, JsonValue),
    Le(String, JsonValue),
    Gt(String, JsonValue),
    Ge(String, JsonValue),
    In(String, Vec<JsonValue>),
    Between(String, JsonValue, JsonValue),
    /// SQL-wildcard (`%`, `_`) case-insensitive string match.
    Like(String, String),
    And(Vec<Filter>),
    Or(Filter2),
    Not(Box<Filter>),
}

/// Boxed pair used by [`Filter::Or`] to avoid an unbounded enum size.
pub type Filter2 = Vec<Filter>;

fn resolve_path<'a>(metadata: Option<&'a JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut current = metadata?;
    for segment in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(arr) => {
                let index: usize = segment.parse().ok()?;
                arr.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn as_f64(v: &JsonValue) -> Option<f64> {
    v.as_f64()
}

fn numeric_cmp(found: &JsonValue, target: &JsonValue) -> Option<std::cmp::Ordering> {
    let (a, b) = (as_f64(found)?, as_f64(target)?);
    a.partial_cmp(&b)
}

/// Match `value` against a SQL `LIKE` pattern (`%` = any run, `_` = any
/// single char), case-insensitively, via a small recursive matcher — no
/// need to pull in a regex engine for two wildcard characters.
fn like_matches(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    like_match_from(&value, &pattern)
}

fn like_match_from(value: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => value.is_empty(),
        Some('%') => {
            like_match_from(value, &pattern[1..])
                || (!value.is_empty() && like_match_from(&value[1..], pattern))
        }
        Some('_') => !value.is_empty() && like_match_from(&value[1..], &pattern[1..]),
        Some(c) => value.first() == Some(c) && like_match_from(&value[1..], &pattern[1..]),
    }
}

impl Filter {
    /// Evaluate this filter against a candidate's metadata, treating a
    /// missing path as `undefined` per the module's documented semantics.
    pub fn evaluate(&self, metadata: Option<&JsonValue>) -> bool {
        match self {
            Filter::Eq(path, target) => resolve_path(metadata, path).map(|v| v == target).unwrap_or(false),
            Filter::Ne(path, target) => resolve_path(metadata, path).map(|v| v != target).unwrap_or(true),
            Filter::Lt(path, target) => resolve_path(metadata, path)
                .and_then(|v| numeric_cmp(v, target))
                .map(|o| o.is_lt())
                .unwrap_or(false),
            Filter::Le(path, target) => resolve_path(metadata, path)
                .and_then(|v| numeric_cmp(v, target))
                .map(|o| o.is_le())
                .unwrap_or(false),
            Filter::Gt(path, target) => resolve_path(metadata, path)
                .and_then(|v| numeric_cmp(v, target))
                .map(|o| o.is_gt())
                .unwrap_or(false),
            Filter::Ge(path, target) => resolve_path(metadata, path)
                .and_then(|v| numeric_cmp(v, target))
                .map(|o| o.is_ge())
                .unwrap_or(false),
            Filter::In(path, values) => resolve_path(metadata, path)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Filter::Between(path, low, high) => resolve_path(metadata, path)
                .and_then(|v| Some((numeric_cmp(v, low)?, numeric_cmp(v, high)?)))
                .map(|(lo, hi)| lo.is_ge() && hi.is_le())
                .unwrap_or(false),
            Filter::Like(path, pattern) => resolve_path(metadata, path)
                .and_then(|v| v.as_str())
                .map(|s| like_matches(s, pattern))
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.evaluate(metadata)),
            Filter::Or(filters) => filters.iter().any(|f| f.evaluate(metadata)),
            Filter::Not(inner) => !inner.evaluate(metadata),
        }
    }
}
