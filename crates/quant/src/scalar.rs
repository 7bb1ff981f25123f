//! Per-dimension scalar quantization — the recommended default codec.
//!
//! Each dimension `d` is independently rescaled from its trained
//! `[min_d, max_d]` range onto a `bits`-wide integer grid. Simple, cheap to
//! train, and the error bound is easy to reason about:
//! `|x - decode(encode(x))| <= (max_d - min_d) / (2^bits - 1)`.

use crate::error::{QuantError, QuantResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Bit widths the scalar codec supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarBits {
    /// 16 values per dimension.
    Four,
    /// 256 values per dimension (default).
    Eight,
    /// 65536 values per dimension.
    Sixteen,
}

impl ScalarBits {
    fn bits(self) -> u32 {
        match self {
            ScalarBits::Four => 4,
            ScalarBits::Eight => 8,
            ScalarBits::Sixteen => 16,
        }
    }

    fn levels(self) -> u32 {
        (1u32 << self.bits()) - 1
    }

    fn bytes_per_code(self) -> usize {
        match self {
            ScalarBits::Four | ScalarBits::Eight => 1,
            ScalarBits::Sixteen => 2,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            ScalarBits::Four => 4,
            ScalarBits::Eight => 8,
            ScalarBits::Sixteen => 16,
        }
    }

    fn from_byte(b: u8) -> QuantResult<Self> {
        match b {
            4 => Ok(ScalarBits::Four),
            8 => Ok(ScalarBits::Eight),
            16 => Ok(ScalarBits::Sixteen),
            other => Err(QuantError::CorruptState(format!(
                "unsupported scalar bit width byte {other}"
            ))),
        }
    }
}

impl Default for ScalarBits {
    fn default() -> Self {
        ScalarBits::Eight
    }
}

/// Scalar quantizer state. Untrained until [`ScalarQuantizer::train`] is
/// called; training is one-shot — retraining produces a fresh codec rather
/// than mutating an existing one in place (callers construct a new
/// `ScalarQuantizer` and call `train` on it).
#[derive(Debug, Clone)]
pub struct ScalarQuantizer {
    bits: ScalarBits,
    dimension: usize,
    ranges: Vec<(f32, f32)>,
    trained: bool,
}

impl ScalarQuantizer {
    /// Create an untrained quantizer for embeddings of `dimension` at the
    /// given bit width.
    pub fn new(dimension: usize, bits: ScalarBits) -> Self {
        ScalarQuantizer {
            bits,
            dimension,
            ranges: Vec::new(),
            trained: false,
        }
    }

    /// Whether `train` has been called.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Compute per-dimension `(min, max)` over `samples` and fix them as
    /// the codec's parameters. Fails on an empty sample.
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

        let mut ranges = vec![(f32::INFINITY, f32::NEG_INFINITY); self.dimension];
        for s in samples {
            for (d, &x) in s.iter().enumerate() {
                let (min, max) = &mut ranges[d];
                if x < *min {
                    *min = x;
                }
                if x > *max {
                    *max = x;
                }
            }
        }
        // A dimension that is constant across the sample would otherwise
        // divide by zero in encode/decode; widen it to a degenerate but
        // safe range.
        for (min, max) in ranges.iter_mut() {
            if (*max - *min).abs() < f32::EPSILON {
                *max = *min + 1.0;
            }
        }

        self.ranges = ranges;
        self.trained = true;
        Ok(())
    }

    /// Encode a vector into `ceil(bits/8) * dimension` bytes of packed
    /// per-dimension integer codes.
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

        let levels = self.bits.levels() as f32;
        let mut out = Vec::with_capacity(self.dimension * self.bits.bytes_per_code());
        for (d, &x) in vector.iter().enumerate() {
            let (min, max) = self.ranges[d];
            let normalized = ((x - min) / (max - min) * levels).round();
            let code = normalized.clamp(0.0, levels) as u32;
            match self.bits {
                ScalarBits::Four | ScalarBits::Eight => out.push(code as u8),
                ScalarBits::Sixteen => {
                    out.write_u16::<LittleEndian>(code as u16).expect("vec write");
                }
            }
        }
        Ok(out)
    }

    /// Reconstruct an approximate vector from a code.
    pub fn decode(&self, code: &[u8]) -> QuantResult<Vec<f32>> {
        if !self.trained {
            return Err(QuantError::NotTrained);
        }
        let bytes_per = self.bits.bytes_per_code();
        if code.len() != self.dimension * bytes_per {
            return Err(QuantError::CorruptState(format!(
                "expected {} code bytes, got {}",
                self.dimension * bytes_per,
                code.len()
            )));
        }

        let levels = self.bits.levels() as f32;
        let mut cursor = Cursor::new(code);
        let mut out = Vec::with_capacity(self.dimension);
        for d in 0..self.dimension {
            let raw = match self.bits {
                ScalarBits::Four | ScalarBits::Eight => cursor.read_u8().unwrap() as u32,
                ScalarBits::Sixteen => cursor.read_u16::<LittleEndian>().unwrap() as u32,
            };
            let (min, max) = self.ranges[d];
            out.push(min + (raw as f32 / levels) * (max - min));
        }
        Ok(out)
    }

    /// Euclidean distance between the unquantized `query` and the
    /// reconstruction of `code` — the "asymmetric" part is that only one
    /// side of the comparison has been through quantization.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8]) -> QuantResult<f32> {
        let decoded = self.decode(code)?;
        Ok(synapse_core::metric::compute_score(
            query,
            &decoded,
            synapse_core::metric::Metric::Euclidean,
        ))
    }

    /// Maximum possible per-dimension reconstruction error given the
    /// trained ranges: `(max - min) / (2^bits - 1)`, maximized over
    /// dimensions.
    pub fn max_error_bound(&self) -> f32 {
        self.ranges
            .iter()
            .map(|(min, max)| (max - min) / self.bits.levels() as f32)
            .fold(0.0f32, f32::max)
    }

    /// Serialize trained state to a self-describing byte blob.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u8(self.bits.to_byte()).unwrap();
        out.write_u32::<LittleEndian>(self.dimension as u32).unwrap();
        out.write_u8(self.trained as u8).unwrap();
        for (min, max) in &self.ranges {
            out.write_f32::<LittleEndian>(*min).unwrap();
            out.write_f32::<LittleEndian>(*max).unwrap();
        }
        out
    }

    /// Restore state previously produced by [`Self::serialize_state`].
    pub fn load_state(bytes: &[u8]) -> QuantResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let bits = ScalarBits::from_byte(
            cursor
                .read_u8()
                .map_err(|e| QuantError::CorruptState(e.to_string()))?,
        )?;
        let dimension = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| QuantError::CorruptState(e.to_string()))? as usize;
        let trained = cursor
            .read_u8()
            .map_err(|e| QuantError::CorruptState(e.to_string()))?
            != 0;

        let mut ranges = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            let min = cursor
                .read_f32::<LittleEndian>()
                .map_err(|e| QuantError::CorruptState(e.to_string()))?;
            let max = cursor
                .read_f32::<LittleEndian>()
                .map_err(|e| QuantError::CorruptState(e.to_string()))?;
            ranges.push((min, max));
        }
        let mut remainder = Vec::new();
        let _ = cursor.read_to_end(&mut remainder);
        if !remainder.is_empty() {
            return Err(QuantError::CorruptState(
                "trailing bytes after scalar quantizer state".to_string(),
            ));
        }

        Ok(ScalarQuantizer {
            bits,
            dimension,
            ranges,
            trained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_samples(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn train_on_empty_sample_fails() {
        let mut q = ScalarQuantizer::new(4, ScalarBits::Eight);
        assert!(matches!(q.train(&[]), Err(QuantError::EmptySample)));
    }

    #[test]
    fn encode_before_train_fails() {
        let q = ScalarQuantizer::new(4, ScalarBits::Eight);
        assert!(matches!(
            q.encode(&[0.0, 0.0, 0.0, 0.0]),
            Err(QuantError::NotTrained)
        ));
    }

    #[test]
    fn decode_of_encode_is_within_error_bound() {
        let samples = uniform_samples(1000, 128, 42);
        let mut q = ScalarQuantizer::new(128, ScalarBits::Eight);
        q.train(&samples).unwrap();
        let bound = q.max_error_bound();

        for x in uniform_samples(100, 128, 7) {
            let code = q.encode(&x).unwrap();
            let decoded = q.decode(&code).unwrap();
            for (a, b) in x.iter().zip(decoded.iter()) {
                assert!((a - b).abs() <= bound + 1e-4);
            }
        }
    }

    #[test]
    fn serialize_round_trips() {
        let samples = uniform_samples(50, 8, 1);
        let mut q = ScalarQuantizer::new(8, ScalarBits::Four);
        q.train(&samples).unwrap();

        let bytes = q.serialize_state();
        let restored = ScalarQuantizer::load_state(&bytes).unwrap();

        let x = &samples[0];
        assert_eq!(q.encode(x).unwrap(), restored.encode(x).unwrap());
    }

    #[test]
    fn dimension_mismatch_on_encode() {
        let mut q = ScalarQuantizer::new(4, ScalarBits::Eight);
        q.train(&[vec![0.0, 1.0, 2.0, 3.0]]).unwrap();
        assert!(matches!(
            q.encode(&[0.0, 1.0]),
            Err(QuantError::DimensionMismatch { expected: 4, got: 2 })
        ));
    }
}
