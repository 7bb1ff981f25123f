//! Binary quantization: one bit per dimension, thresholded against a
//! trained per-dimension cutoff. Codes compare via Hamming distance,
//! making this the cheapest codec and the natural first-stage filter for
//! a two-stage search.

use crate::error::{QuantError, QuantResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Binary quantizer state.
#[derive(Debug, Clone)]
pub struct BinaryQuantizer {
    dimension: usize,
    thresholds: Vec<f32>,
    trained: bool,
}

impl BinaryQuantizer {
    /// Create an untrained codec for embeddings of `dimension`.
    pub fn new(dimension: usize) -> Self {
        BinaryQuantizer {
            dimension,
            thresholds: Vec::new(),
            trained: false,
        }
    }

    /// Whether `train` has completed.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn bytes_per_code(&self) -> usize {
        (self.dimension + 7) / 8
    }

    /// Set each dimension's threshold to the median value observed across
    /// `samples` in that dimension.
    pub fn train(&mut self, samples: &[Vec<f32>]) -> QuantResult<()> {
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

        let mut thresholds = Vec::with_capacity(self.dimension);
        for d in 0..self.dimension {
            let mut column: Vec<f32> = samples.iter().map(|s| s[d]).collect();
            column.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mid = column.len() / 2;
            let median = if column.len() % 2 == 0 && mid > 0 {
                (column[mid - 1] + column[mid]) / 2.0
            } else {
                column[mid]
            };
            thresholds.push(median);
        }

        self.thresholds = thresholds;
        self.trained = true;
        Ok(())
    }

    /// Encode into `ceil(dimension / 8)` packed bits: bit `d` is 1 iff
    /// `vector[d] > thresholds[d]`.
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

        let mut out = vec![0u8; self.bytes_per_code()];
        for (d, &x) in vector.iter().enumerate() {
            if x > self.thresholds[d] {
                out[d / 8] |= 1 << (d % 8);
            }
        }
        Ok(out)
    }

    /// Reconstruct an approximation: each dimension becomes its trained
    /// threshold, nudged by half a bit's worth in the indicated direction.
    /// This is a lossy, low-fidelity decode — binary quantization is meant
    /// for coarse first-stage filtering, not reconstruction.
    pub fn decode(&self, code: &[u8]) -> QuantResult<Vec<f32>> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        if code.len() != self.bytes_per_code() {
            return Err(QuantError::CorruptState(format!(
                "expected {} code bytes, got {}",
                self.bytes_per_code(),
                code.len()
            )));
        }

        let mut out = Vec::with_capacity(self.dimension);
        for d in 0..self.dimension {
            let bit = (code[d / 8] >> (d % 8)) & 1;
            out.push(if bit == 1 {
                self.thresholds[d]
            } else {
                self.thresholds[d] - 1.0
            });
        }
        Ok(out)
    }

    /// Hamming distance between two codes via popcount on their XOR.
    pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    /// Asymmetric distance: threshold `query` against the trained cutoffs
    /// and take the Hamming distance to `code`.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8]) -> QuantResult<f32> {
        let query_code = self.encode(query)?;
        if code.len() != query_code.len() {
            return Err(QuantError::CorruptState(format!(
                "expected {} code bytes, got {}",
                query_code.len(),
                code.len()
            )));
        }
        Ok(Self::hamming_distance(&query_code, code) as f32)
    }

    /// Serialize trained state.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.dimension as u32).unwrap();
        out.write_u8(self.trained as u8).unwrap();
        for &t in &self.thresholds {
            out.write_f32::<LittleEndian>(t).unwrap();
        }
        out
    }

    /// Restore state previously produced by [`Self::serialize_state`].
    pub fn load_state(bytes: &[u8]) -> QuantResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let err = |e: std::io::Error| QuantError::CorruptState(e.to_string());

        let dimension = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
        let trained = cursor.read_u8().map_err(err)? != 0;

        let mut thresholds = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            thresholds.push(cursor.read_f32::<LittleEndian>().map_err(err)?);
        }

        Ok(BinaryQuantizer {
            dimension,
            thresholds,
            trained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Vec<f32>> {
        vec![
            vec![-1.0, 2.0, 0.5],
            vec![1.0, -2.0, 0.6],
            vec![0.0, 0.0, 0.4],
            vec![2.0, 3.0, 0.9],
        ]
    }

    #[test]
    fn train_on_empty_sample_fails() {
        let mut bq = BinaryQuantizer::new(3);
        assert!(matches!(bq.train(&[]), Err(QuantError::EmptySample)));
    }

    #[test]
    fn identical_vectors_have_zero_hamming_distance() {
        let mut bq = BinaryQuantizer::new(3);
        bq.train(&samples()).unwrap();

        let code = bq.encode(&samples()[0]).unwrap();
        assert_eq!(BinaryQuantizer::hamming_distance(&code, &code), 0);
    }

    #[test]
    fn opposite_signs_increase_hamming_distance() {
        let mut bq = BinaryQuantizer::new(3);
        bq.train(&samples()).unwrap();

        let code_a = bq.encode(&[-5.0, 5.0, -5.0]).unwrap();
        let code_b = bq.encode(&[5.0, -5.0, 5.0]).unwrap();
        assert!(BinaryQuantizer::hamming_distance(&code_a, &code_b) > 0);
    }

    #[test]
    fn packed_code_length_matches_ceil_div_8() {
        let mut bq = BinaryQuantizer::new(17);
        let samples: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32; 17]).collect();
        bq.train(&samples).unwrap();
        let code = bq.encode(&samples[0]).unwrap();
        assert_eq!(code.len(), 3);
    }

    #[test]
    fn serialize_round_trips() {
        let mut bq = BinaryQuantizer::new(3);
        bq.train(&samples()).unwrap();

        let bytes = bq.serialize_state();
        let restored = BinaryQuantizer::load_state(&bytes).unwrap();

        let x = &samples()[0];
        assert_eq!(bq.encode(x).unwrap(), restored.encode(x).unwrap());
    }
}
