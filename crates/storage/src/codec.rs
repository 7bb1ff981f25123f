//! Binary encodings shared by every table: embeddings as contiguous
//! little-endian `f32`s, metadata and version vectors as MessagePack.

use crate::error::{StorageError, StorageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use std::io::Cursor;
use synapse_core::VersionVector;

/// Encode an embedding as contiguous little-endian `f32` bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for &x in embedding {
        out.write_f32::<LittleEndian>(x).expect("vec write");
    }
    out
}

/// Decode a little-endian `f32` embedding, verifying `bytes.len() == dimension * 4`.
pub fn decode_embedding(bytes: &[u8], dimension: usize) -> StorageResult<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return Err(StorageError::DimensionMismatch {
            expected: dimension,
            got: bytes.len() / 4,
        });
    }
    let mut cursor = Cursor::new(bytes);
    let mut out = Vec::with_capacity(dimension);
    for _ in 0..dimension {
        out.push(
            cursor
                .read_f32::<LittleEndian>()
                .map_err(|e| StorageError::CorruptRecord(e.to_string()))?,
        );
    }
    Ok(out)
}

/// Encode optional metadata as a MessagePack blob, or `None` when absent.
pub fn encode_metadata(metadata: &Option<JsonValue>) -> StorageResult<Option<Vec<u8>>> {
    match metadata {
        None => Ok(None),
        Some(value) => rmp_serde::to_vec(value)
            .map(Some)
            .map_err(|e| StorageError::CorruptRecord(e.to_string())),
    }
}

/// Decode a metadata blob produced by [`encode_metadata`].
pub fn decode_metadata(bytes: Option<&[u8]>) -> StorageResult<Option<JsonValue>> {
    match bytes {
        None => Ok(None),
        Some(b) => rmp_serde::from_slice(b)
            .map(Some)
            .map_err(|e| StorageError::CorruptRecord(e.to_string())),
    }
}

/// Encode a value generically as MessagePack — used for version vectors
/// and any other small structured blob stored alongside a row.
pub fn encode_msgpack<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| StorageError::CorruptRecord(e.to_string()))
}

/// Decode a value generically from MessagePack.
pub fn decode_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::CorruptRecord(e.to_string()))
}

/// Encode a [`VersionVector`]'s coordinate map.
pub fn encode_version_vector(vv: &VersionVector) -> StorageResult<Vec<u8>> {
    encode_msgpack(&vv.0)
}

/// Decode a [`VersionVector`] previously encoded with [`encode_version_vector`].
pub fn decode_version_vector(bytes: &[u8]) -> StorageResult<VersionVector> {
    decode_msgpack(bytes).map(VersionVector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_round_trips() {
        let v = vec![1.0f32, -2.5, 0.0, 3.25];
        let bytes = encode_embedding(&v);
        assert_eq!(decode_embedding(&bytes, 4).unwrap(), v);
    }

    #[test]
    fn embedding_length_mismatch_is_rejected() {
        let bytes = encode_embedding(&[1.0, 2.0]);
        assert!(matches!(
            decode_embedding(&bytes, 3),
            Err(StorageError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn metadata_round_trips_through_none_and_some() {
        assert_eq!(decode_metadata(encode_metadata(&None).unwrap().as_deref()).unwrap(), None);

        let meta = Some(serde_json::json!({"tag": "note", "n": 3}));
        let encoded = encode_metadata(&meta).unwrap();
        assert_eq!(decode_metadata(encoded.as_deref()).unwrap(), meta);
    }

    #[test]
    fn version_vector_round_trips() {
        let mut vv = VersionVector::new();
        vv.observe("a", 3);
        vv.observe("b", 7);
        let bytes = encode_version_vector(&vv).unwrap();
        let restored = decode_version_vector(&bytes).unwrap();
        assert_eq!(vv.0, restored.0);
    }
}
