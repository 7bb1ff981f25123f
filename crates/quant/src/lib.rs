//! Vector quantization codecs: scalar, product and binary.
//!
//! A shard picks one codec kind at creation time; [`Quantizer`] wraps
//! whichever one it picked as a closed tagged variant rather than a
//! trait object, so callers match on kind where they need to and the
//! storage layer can serialize/restore any variant uniformly.

pub mod accuracy;
pub mod binary;
pub mod error;
pub mod product;
pub mod scalar;

pub use accuracy::AccuracyReport;
pub use binary::BinaryQuantizer;
pub use error::{QuantError, QuantResult};
pub use product::ProductQuantizer;
pub use scalar::{ScalarBits, ScalarQuantizer};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Which codec a shard is configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QuantizerKind {
    /// No quantization — vectors are stored and compared at full precision.
    None,
    /// Per-dimension scalar quantization.
    Scalar,
    /// Product quantization over `M` subvector codebooks.
    Product,
    /// Per-dimension binary thresholding, compared by Hamming distance.
    Binary,
}

impl QuantizerKind {
    fn to_byte(self) -> u8 {
        match self {
            QuantizerKind::None => 0,
            QuantizerKind::Scalar => 1,
            QuantizerKind::Product => 2,
            QuantizerKind::Binary => 3,
        }
    }

    fn from_byte(b: u8) -> QuantResult<Self> {
        match b {
            0 => Ok(QuantizerKind::None),
            1 => Ok(QuantizerKind::Scalar),
            2 => Ok(QuantizerKind::Product),
            3 => Ok(QuantizerKind::Binary),
            other => Err(QuantError::CorruptState(format!(
                "unknown quantizer kind byte {other}"
            ))),
        }
    }
}

/// A shard's active quantization codec, held as a closed tagged variant.
///
/// Every shard constructs exactly one of these (possibly `NoOp`) and
/// drives it through the same `train`/`encode`/`decode`/`asymmetric_distance`
/// surface regardless of which codec is underneath — callers that need
/// codec-specific behavior (e.g. the query engine's two-stage search
/// picking binary for the coarse pass) match on [`QuantizerKind`]
/// explicitly instead of going through a trait object.
#[derive(Debug, Clone)]
pub enum Quantizer {
    /// Pass-through: vectors round-trip exactly, at full storage cost.
    NoOp { dimension: usize },
    Scalar(ScalarQuantizer),
    Product(ProductQuantizer),
    Binary(BinaryQuantizer),
}

impl Quantizer {
    /// Construct an untrained codec of `kind` for embeddings of `dimension`.
    /// `subvectors`/`bits` configure the product codec and are ignored by
    /// the others; `bits` also selects the scalar codec's width when `kind`
    /// is [`QuantizerKind::Scalar`] (4, 8 or 16).
    pub fn new(
        kind: QuantizerKind,
        dimension: usize,
        subvectors: usize,
        bits: u8,
    ) -> QuantResult<Self> {
        Ok(match kind {
            QuantizerKind::None => Quantizer::NoOp { dimension },
            QuantizerKind::Scalar => {
                let width = match bits {
                    4 => ScalarBits::Four,
                    16 => ScalarBits::Sixteen,
                    _ => ScalarBits::Eight,
                };
                Quantizer::Scalar(ScalarQuantizer::new(dimension, width))
            }
            QuantizerKind::Product => {
                Quantizer::Product(ProductQuantizer::new(dimension, subvectors, bits)?)
            }
            QuantizerKind::Binary => Quantizer::Binary(BinaryQuantizer::new(dimension)),
        })
    }

    /// The tag identifying which variant this is.
    pub fn kind(&self) -> QuantizerKind {
        match self {
            Quantizer::NoOp { .. } => QuantizerKind::None,
            Quantizer::Scalar(_) => QuantizerKind::Scalar,
            Quantizer::Product(_) => QuantizerKind::Product,
            Quantizer::Binary(_) => QuantizerKind::Binary,
        }
    }

    /// Whether this codec is ready to encode/decode. `NoOp` is always
    /// trained; the others require [`Self::train`] first.
    pub fn is_trained(&self) -> bool {
        match self {
            Quantizer::NoOp { .. } => true,
            Quantizer::Scalar(q) => q.is_trained(),
            Quantizer::Product(q) => q.is_trained(),
            Quantizer::Binary(q) => q.is_trained(),
        }
    }

    /// Train on a representative sample. `seed` only affects the product
    /// codec's k-means initialization; other variants ignore it.
    pub fn train(&mut self, samples: &[Vec<f32>], seed: u64) -> QuantResult<()> {
        match self {
            Quantizer::NoOp { .. } => Ok(()),
            Quantizer::Scalar(q) => q.train(samples),
            Quantizer::Product(q) => q.train(samples, seed),
            Quantizer::Binary(q) => q.train(samples),
        }
    }

    /// Encode a vector into its stored representation.
    pub fn encode(&self, vector: &[f32]) -> QuantResult<Vec<u8>> {
        match self {
            Quantizer::NoOp { dimension } => {
                if vector.len() != *dimension {
                    return Err(QuantError::DimensionMismatch {
                        expected: *dimension,
                        got: vector.len(),
                    });
                }
                let mut out = Vec::with_capacity(vector.len() * 4);
                for &x in vector {
                    out.write_f32::<LittleEndian>(x).expect("vec write");
                }
                Ok(out)
            }
            Quantizer::Scalar(q) => q.encode(vector),
            Quantizer::Product(q) => q.encode(vector),
            Quantizer::Binary(q) => q.encode(vector),
        }
    }

    /// Reconstruct an approximate vector from a stored code.
    pub fn decode(&self, code: &[u8]) -> QuantResult<Vec<f32>> {
        match self {
            Quantizer::NoOp { dimension } => {
                if code.len() != dimension * 4 {
                    return Err(QuantError::CorruptState(format!(
                        "expected {} code bytes, got {}",
                        dimension * 4,
                        code.len()
                    )));
                }
                let mut cursor = Cursor::new(code);
                let mut out = Vec::with_capacity(*dimension);
                for _ in 0..*dimension {
                    out.push(
                        cursor
                            .read_f32::<LittleEndian>()
                            .map_err(|e| QuantError::CorruptState(e.to_string()))?,
                    );
                }
                Ok(out)
            }
            Quantizer::Scalar(q) => q.decode(code),
            Quantizer::Product(q) => q.decode(code),
            Quantizer::Binary(q) => q.decode(code),
        }
    }

    /// Distance between an unquantized query and a stored code, in
    /// whatever units the underlying codec uses (euclidean for `NoOp` and
    /// scalar, euclidean-over-centroids for product, Hamming count for
    /// binary) — callers compare codes produced by the same codec
    /// instance, so units never need to match across variants.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8]) -> QuantResult<f32> {
        match self {
            Quantizer::NoOp { .. } => {
                let decoded = self.decode(code)?;
                Ok(synapse_core::metric::compute_score(
                    query,
                    &decoded,
                    synapse_core::metric::Metric::Euclidean,
                ))
            }
            Quantizer::Scalar(q) => q.asymmetric_distance(query, code),
            Quantizer::Product(q) => q.asymmetric_distance(query, code),
            Quantizer::Binary(q) => q.asymmetric_distance(query, code),
        }
    }

    /// Evaluate reconstruction error and recall@10 on a held-out test set,
    /// encoding/decoding through this codec as-is (no retraining).
    pub fn evaluate_accuracy(&self, test_set: &[Vec<f32>]) -> QuantResult<AccuracyReport> {
        if test_set.is_empty() {
            return Ok(AccuracyReport {
                avg_error: 0.0,
                recall_at_10: 1.0,
            });
        }

        let mut decoded = Vec::with_capacity(test_set.len());
        let mut codes = Vec::with_capacity(test_set.len());
        for x in test_set {
            let code = self.encode(x)?;
            decoded.push(self.decode(&code)?);
            codes.push(code);
        }
        let avg_error = accuracy::mean_abs_error(test_set, &decoded);

        let recall_at_10 = accuracy::recall_at_10(test_set, |query, candidate| {
            // `candidate` is a raw test-set vector, not a code; approximate
            // by re-encoding it under this codec so the ranking reflects
            // what `asymmetric_distance` would actually see in storage.
            match self.encode(candidate) {
                Ok(code) => self.asymmetric_distance(query, &code).unwrap_or(f32::INFINITY),
                Err(_) => f32::INFINITY,
            }
        });

        Ok(AccuracyReport {
            avg_error,
            recall_at_10,
        })
    }

    /// Serialize to a self-describing blob: a one-byte kind tag followed
    /// by the variant's own state encoding.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u8(self.kind().to_byte()).unwrap();
        match self {
            Quantizer::NoOp { dimension } => {
                out.write_u32::<LittleEndian>(*dimension as u32).unwrap();
            }
            Quantizer::Scalar(q) => out.extend(q.serialize_state()),
            Quantizer::Product(q) => out.extend(q.serialize_state()),
            Quantizer::Binary(q) => out.extend(q.serialize_state()),
        }
        out
    }

    /// Restore a codec (of whatever kind it was serialized as) from a
    /// blob produced by [`Self::serialize_state`].
    pub fn load_state(bytes: &[u8]) -> QuantResult<Self> {
        if bytes.is_empty() {
            return Err(QuantError::CorruptState("empty quantizer state".to_string()));
        }
        let kind = QuantizerKind::from_byte(bytes[0])?;
        let rest = &bytes[1..];
        Ok(match kind {
            QuantizerKind::None => {
                let mut cursor = Cursor::new(rest);
                let dimension = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| QuantError::CorruptState(e.to_string()))?
                    as usize;
                Quantizer::NoOp { dimension }
            }
            QuantizerKind::Scalar => Quantizer::Scalar(ScalarQuantizer::load_state(rest)?),
            QuantizerKind::Product => Quantizer::Product(ProductQuantizer::load_state(rest)?),
            QuantizerKind::Binary => Quantizer::Binary(BinaryQuantizer::load_state(rest)?),
        })
    }
}
