//! Shared accuracy-evaluation helper used by every codec's
//! `evaluate_accuracy`.

use synapse_core::metric::{compute_score, Metric};

/// Result of running a trained codec against a held-out test set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyReport {
    /// Mean absolute per-dimension error between `x` and `decode(encode(x))`.
    pub avg_error: f32,
    /// Fraction of test vectors whose true top-10 (by exact euclidean
    /// distance within the test set) overlaps at least one element with
    /// the top-10 found via the quantizer's asymmetric distance.
    pub recall_at_10: f32,
}

/// Mean absolute per-dimension error across a decoded sample, compared to
/// the corresponding original vectors. Shared by all three codecs so the
/// metric is computed identically regardless of which one is evaluating.
pub fn mean_abs_error(originals: &[Vec<f32>], decoded: &[Vec<f32>]) -> f32 {
    if originals.is_empty() {
        return 0.0;
    }
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (orig, dec) in originals.iter().zip(decoded.iter()) {
        for (a, b) in orig.iter().zip(dec.iter()) {
            total += (a - b).abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

/// Brute-force recall@10 of an asymmetric-distance ranking against the
/// exact euclidean ranking, both computed over `test_set`.
pub fn recall_at_10<F>(test_set: &[Vec<f32>], approx_distance: F) -> f32
where
    F: Fn(&[f32], &[f32]) -> f32,
{
    if test_set.len() < 2 {
        return 1.0;
    }
    let mut hits = 0usize;
    let mut total = 0usize;

    for (qi, query) in test_set.iter().enumerate() {
        let mut exact: Vec<(usize, f32)> = test_set
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != qi)
            .map(|(j, v)| (j, compute_score(query, v, Metric::Euclidean)))
            .collect();
        exact.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let exact_top: std::collections::HashSet<usize> =
            exact.iter().take(10).map(|(j, _)| *j).collect();

        let mut approx: Vec<(usize, f32)> = test_set
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != qi)
            .map(|(j, v)| (j, approx_distance(query, v)))
            .collect();
        approx.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let approx_top: std::collections::HashSet<usize> =
            approx.iter().take(10).map(|(j, _)| *j).collect();

        hits += exact_top.intersection(&approx_top).count();
        total += exact_top.len().min(10);
    }

    if total == 0 {
        1.0
    } else {
        hits as f32 / total as f32
    }
}
