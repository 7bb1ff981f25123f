//! Product quantization: split an embedding into `M` contiguous
//! subvectors, cluster each subspace independently into `2^bits`
//! centroids with k-means, and encode each subvector as its nearest
//! centroid's index.

use crate::error::{QuantError, QuantResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::{Rng, SeedableRng};
use std::io::Cursor;

const MAX_KMEANS_ITERATIONS: usize = 25;
const CENTROID_SHIFT_EPSILON: f32 = 1e-4;

/// Product quantizer state.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    subvectors: usize,
    bits: u8,
    dimension: usize,
    subdim: usize,
    /// `centroids[m][c]` is the `subdim`-length centroid `c` of subspace `m`.
    centroids: Vec<Vec<Vec<f32>>>,
    trained: bool,
}

impl ProductQuantizer {
    /// Create an untrained codec. `dimension` must be evenly divisible by
    /// `subvectors`; `bits` selects `2^bits` centroids per subspace.
    pub fn new(dimension: usize, subvectors: usize, bits: u8) -> QuantResult<Self> {
        if subvectors == 0 || dimension % subvectors != 0 {
            return Err(QuantError::IndivisibleSubvectors {
                dimension,
                subvectors,
            });
        }
        Ok(ProductQuantizer {
            subvectors,
            bits,
            dimension,
            subdim: dimension / subvectors,
            centroids: Vec::new(),
            trained: false,
        })
    }

    fn k(&self) -> usize {
        1usize << self.bits
    }

    /// Whether `train` has completed.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn subvector<'a>(&self, v: &'a [f32], m: usize) -> &'a [f32] {
        &v[m * self.subdim..(m + 1) * self.subdim]
    }

    /// Run independent k-means over each subspace, seeded deterministically
    /// from `seed` so retraining on the same sample is reproducible.
    pub fn train(&mut self, samples: &[Vec<f32>], seed: u64) -> QuantResult<()> {
        if samples.is_empty() {
            return Err(QuantError::EmptySample);
        }
        for s in samples {
            if s.len() != self.dimension {
                return Err(QuantError::DimensionMismatch {
                    expected: self.dimension,
                    got: s.len(),
                });
            }
        }

        let k = self.k();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let mut centroids = Vec::with_capacity(self.subvectors);

        for m in 0..self.subvectors {
            let subspace: Vec<&[f32]> = samples.iter().map(|s| self.subvector(s, m)).collect();
            centroids.push(kmeans(&subspace, k.min(subspace.len()), self.subdim, &mut rng));
        }

        self.centroids = centroids;
        self.trained = true;
        Ok(())
    }

    /// Encode a vector as one centroid index per subspace (one byte per
    /// subspace; supports up to 256 centroids).
    pub fn encode(&self, vector: &[f32]) -> QuantResult<Vec<u8>> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        if vector.len() != self.dimension {
            return Err(QuantError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        let mut out = Vec::with_capacity(self.subvectors);
        for m in 0..self.subvectors {
            let sub = self.subvector(vector, m);
            let idx = nearest_centroid(sub, &self.centroids[m]);
            out.write_u8(idx as u8).expect("vec write");
        }
        Ok(out)
    }

    /// Reconstruct an approximate vector by concatenating each subspace's
    /// assigned centroid.
    pub fn decode(&self, code: &[u8]) -> QuantResult<Vec<f32>> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        if code.len() != self.subvectors {
            return Err(QuantError::CorruptState(format!(
                "expected {} code bytes, got {}",
                self.subvectors,
                code.len()
            )));
        }

        let mut out = Vec::with_capacity(self.dimension);
        for (m, &idx) in code.iter().enumerate() {
            let centroid = self
                .centroids
                .get(m)
                .and_then(|c| c.get(idx as usize))
                .ok_or_else(|| {
                    QuantError::CorruptState(format!(
                        "centroid index {idx} out of range for subspace {m}"
                    ))
                })?;
            out.extend_from_slice(centroid);
        }
        Ok(out)
    }

    /// Asymmetric distance via a precomputed `(M, k)` table of squared
    /// distances from the query's own subvectors to every centroid,
    /// summed across subspaces against the stored code.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8]) -> QuantResult<f32> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        if query.len() != self.dimension {
            return Err(QuantError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if code.len() != self.subvectors {
            return Err(QuantError::CorruptState(format!(
                "expected {} code bytes, got {}",
                self.subvectors,
                code.len()
            )));
        }

        let mut total = 0.0f32;
        for m in 0..self.subvectors {
            let sub = self.subvector(query, m);
            let idx = code[m] as usize;
            let centroid = self
                .centroids
                .get(m)
                .and_then(|c| c.get(idx))
                .ok_or_else(|| {
                    QuantError::CorruptState(format!(
                        "centroid index {idx} out of range for subspace {m}"
                    ))
                })?;
            total += squared_distance(sub, centroid);
        }
        Ok(total.sqrt())
    }

    /// Precompute the `(M, k)` distance table used by
    /// [`Self::asymmetric_distance`], for callers that want to reuse it
    /// across many codes for the same query (e.g. a full shard scan).
    pub fn distance_table(&self, query: &[f32]) -> QuantResult<Vec<Vec<f32>>> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        if query.len() != self.dimension {
            return Err(QuantError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        Ok((0..self.subvectors)
            .map(|m| {
                let sub = self.subvector(query, m);
                self.centroids[m]
                    .iter()
                    .map(|c| squared_distance(sub, c))
                    .collect()
            })
            .collect())
    }

    /// Distance using a table from [`Self::distance_table`] instead of
    /// recomputing subspace distances from scratch.
    pub fn distance_from_table(table: &[Vec<f32>], code: &[u8]) -> f32 {
        let total: f32 = code
            .iter()
            .enumerate()
            .map(|(m, &idx)| table[m][idx as usize])
            .sum();
        total.sqrt()
    }

    /// Serialize trained state.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u8(self.subvectors as u8).unwrap();
        out.write_u8(self.bits).unwrap();
        out.write_u32::<LittleEndian>(self.dimension as u32).unwrap();
        out.write_u8(self.trained as u8).unwrap();
        out.write_u32::<LittleEndian>(self.centroids.len() as u32)
            .unwrap();
        for subspace in &self.centroids {
            out.write_u32::<LittleEndian>(subspace.len() as u32).unwrap();
            for centroid in subspace {
                for &x in centroid {
                    out.write_f32::<LittleEndian>(x).unwrap();
                }
            }
        }
        out
    }

    /// Restore state previously produced by [`Self::serialize_state`].
    pub fn load_state(bytes: &[u8]) -> QuantResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let err = |e: std::io::Error| QuantError::CorruptState(e.to_string());

        let subvectors = cursor.read_u8().map_err(err)? as usize;
        let bits = cursor.read_u8().map_err(err)?;
        let dimension = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
        let trained = cursor.read_u8().map_err(err)? != 0;
        let num_subspaces = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;

        if subvectors == 0 || dimension % subvectors.max(1) != 0 {
            return Err(QuantError::IndivisibleSubvectors {
                dimension,
                subvectors,
            });
        }
        let subdim = dimension / subvectors;

        let mut centroids = Vec::with_capacity(num_subspaces);
        for _ in 0..num_subspaces {
            let num_centroids = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
            let mut subspace = Vec::with_capacity(num_centroids);
            for _ in 0..num_centroids {
                let mut centroid = Vec::with_capacity(subdim);
                for _ in 0..subdim {
                    centroid.push(cursor.read_f32::<LittleEndian>().map_err(err)?);
                }
                subspace.push(centroid);
            }
            centroids.push(subspace);
        }

        Ok(ProductQuantizer {
            subvectors,
            bits,
            dimension,
            subdim,
            centroids,
            trained,
        })
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_centroid(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(v, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Lloyd's-algorithm k-means, capped at [`MAX_KMEANS_ITERATIONS`] or until
/// the largest centroid shift drops below [`CENTROID_SHIFT_EPSILON`].
/// Centroids are seeded by sampling `k` distinct points (k-means++ is not
/// needed at this scale — uniform seeding is plenty stable for subspaces
/// of a few dimensions).
fn kmeans(
    points: &[&[f32]],
    k: usize,
    dim: usize,
    rng: &mut rand_chacha::ChaCha8Rng,
) -> Vec<Vec<f32>> {
    if k == 0 || points.is_empty() {
        return Vec::new();
    }

    let mut centroids: Vec<Vec<f32>> = {
        let mut indices: Vec<usize> = (0..points.len()).collect();
        for i in (1..indices.len()).rev() {
            let j = rng.gen_range(0..=i);
            indices.swap(i, j);
        }
        indices.iter().take(k).map(|&i| points[i].to_vec()).collect()
    };

    let mut assignments = vec![0usize; points.len()];
    for _ in 0..MAX_KMEANS_ITERATIONS {
        for (i, p) in points.iter().enumerate() {
            assignments[i] = nearest_centroid(p, &centroids);
        }

        let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (p, &a) in points.iter().zip(assignments.iter()) {
            for (d, &x) in p.iter().enumerate() {
                sums[a][d] += x;
            }
            counts[a] += 1;
        }

        let mut max_shift = 0.0f32;
        for c in 0..centroids.len() {
            if counts[c] == 0 {
                continue;
            }
            let mut new_centroid = vec![0.0f32; dim];
            for d in 0..dim {
                new_centroid[d] = sums[c][d] / counts[c] as f32;
            }
            let shift = squared_distance(&centroids[c], &new_centroid).sqrt();
            max_shift = max_shift.max(shift);
            centroids[c] = new_centroid;
        }

        if max_shift < CENTROID_SHIFT_EPSILON {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_samples(dim: usize) -> Vec<Vec<f32>> {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(99);
        let centers = [0.0f32, 10.0, -10.0, 20.0];
        (0..400)
            .map(|i| {
                let center = centers[i % centers.len()];
                (0..dim).map(|_| center + rng.gen_range(-0.5..0.5)).collect()
            })
            .collect()
    }

    #[test]
    fn rejects_indivisible_subvector_count() {
        assert!(matches!(
            ProductQuantizer::new(10, 3, 4),
            Err(QuantError::IndivisibleSubvectors { .. })
        ));
    }

    #[test]
    fn train_on_empty_sample_fails() {
        let mut pq = ProductQuantizer::new(8, 2, 4).unwrap();
        assert!(matches!(pq.train(&[], 0), Err(QuantError::EmptySample)));
    }

    #[test]
    fn clustered_data_reconstructs_close_to_original() {
        let samples = clustered_samples(8);
        let mut pq = ProductQuantizer::new(8, 2, 4).unwrap();
        pq.train(&samples, 1).unwrap();

        for x in samples.iter().take(20) {
            let code = pq.encode(x).unwrap();
            let decoded = pq.decode(&code).unwrap();
            let err = squared_distance(x, &decoded).sqrt();
            assert!(err < 2.0, "reconstruction error too large: {err}");
        }
    }

    #[test]
    fn distance_table_matches_direct_computation() {
        let samples = clustered_samples(8);
        let mut pq = ProductQuantizer::new(8, 2, 4).unwrap();
        pq.train(&samples, 2).unwrap();

        let query = &samples[0];
        let code = pq.encode(&samples[5]).unwrap();
        let direct = pq.asymmetric_distance(query, &code).unwrap();
        let table = pq.distance_table(query).unwrap();
        let via_table = ProductQuantizer::distance_from_table(&table, &code);
        assert!((direct - via_table).abs() < 1e-4);
    }

    #[test]
    fn serialize_round_trips() {
        let samples = clustered_samples(8);
        let mut pq = ProductQuantizer::new(8, 2, 4).unwrap();
        pq.train(&samples, 3).unwrap();

        let bytes = pq.serialize_state();
        let restored = ProductQuantizer::load_state(&bytes).unwrap();

        let code_a = pq.encode(&samples[0]).unwrap();
        let code_b = restored.encode(&samples[0]).unwrap();
        assert_eq!(code_a, code_b);
    }
}
