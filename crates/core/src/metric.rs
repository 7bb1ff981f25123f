//! Distance metrics and the shared score kernel.
//!
//! `search` always sorts best-first; which direction "best" points in
//! depends on the metric, so callers compare with [`Metric::is_better`]
//! rather than assuming descending order.

use crate::error::CoreError;

/// Similarity/distance metric requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    /// `dot(a,b) / (||a|| * ||b||)`. Range `[-1, 1]`, best-first descending.
    #[default]
    Cosine,
    /// L2 distance. Range `[0, inf)`, best-first ascending.
    Euclidean,
    /// Raw inner product. Unbounded, best-first descending.
    Dot,
}

impl Metric {
    /// Parse a metric name case-insensitively, accepting the aliases the
    /// query builder and wire config both use.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "dot" | "dot_product" | "inner_product" => Ok(Metric::Dot),
            other => Err(CoreError::InvalidMetric(other.to_string())),
        }
    }

    /// `true` if a beats b under this metric's ordering.
    pub fn is_better(self, a: f32, b: f32) -> bool {
        match self {
            Metric::Cosine | Metric::Dot => a > b,
            Metric::Euclidean => a < b,
        }
    }

    /// Whether a score clears a minimum-cutoff threshold as defined by the
    /// query contract: for ascending metrics (euclidean) the threshold is a
    /// maximum, for descending metrics it's a minimum.
    pub fn meets_threshold(self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::Cosine | Metric::Dot => score >= threshold,
            Metric::Euclidean => score <= threshold,
        }
    }
}

/// Compute the score between two equal-length vectors under `metric`.
///
/// Scores are *not* normalized to a common "higher is better" direction —
/// callers use [`Metric::is_better`] for comparisons. Vectors are used
/// as-is; no implicit normalization is performed.
pub fn compute_score(a: &[f32], b: &[f32], metric: Metric) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dimension mismatch in compute_score");
    match metric {
        Metric::Cosine => cosine(a, b),
        Metric::Euclidean => euclidean_distance(a, b),
        Metric::Dot => dot(a, b),
    }
}

/// Cosine similarity. Returns `NaN` if either vector has zero norm — the
/// source this is adapted from left zero-vector normalization undefined;
/// this implementation surfaces it rather than silently substituting 0,
/// so callers who need a score can clamp it themselves (see Open
/// Questions in DESIGN.md).
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = dot(a, b);
    let na = l2_norm(a);
    let nb = l2_norm(b);
    d / (na * nb)
}

/// Squared-then-rooted L2 distance.
fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Raw dot product.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((compute_score(&v, &v, Metric::Cosine) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(compute_score(&a, &b, Metric::Cosine).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite_is_minus_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((compute_score(&a, &b, Metric::Cosine) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn euclidean_identical_is_zero() {
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(compute_score(&v, &v, Metric::Euclidean), 0.0);
    }

    #[test]
    fn dot_self_is_squared_norm() {
        let v = vec![3.0, 4.0];
        assert!((compute_score(&v, &v, Metric::Dot) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn metric_direction() {
        assert!(Metric::Cosine.is_better(0.9, 0.1));
        assert!(Metric::Dot.is_better(5.0, 1.0));
        assert!(Metric::Euclidean.is_better(0.1, 5.0));
    }

    #[test]
    fn metric_parse_aliases() {
        assert_eq!(Metric::parse("COSINE").unwrap(), Metric::Cosine);
        assert_eq!(Metric::parse("l2").unwrap(), Metric::Euclidean);
        assert_eq!(Metric::parse("dot").unwrap(), Metric::Dot);
        assert_eq!(Metric::parse("inner_product").unwrap(), Metric::Dot);
        assert!(Metric::parse("manhattan").is_err());
    }

    #[test]
    fn threshold_direction_matches_metric() {
        assert!(Metric::Cosine.meets_threshold(0.8, 0.5));
        assert!(!Metric::Cosine.meets_threshold(0.3, 0.5));
        assert!(Metric::Euclidean.meets_threshold(0.2, 0.5));
        assert!(!Metric::Euclidean.meets_threshold(0.8, 0.5));
    }
}
