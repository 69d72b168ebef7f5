//! Compression Codec
//!
//! Serializes values to JSON and gzips payloads above a size threshold.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, Result};

/// Serialized payload ready for storage in either tier.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// Serialized size before compression
    pub original_size: usize,
}

// == Compression Codec ==
#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    threshold: usize,
    level: Compression,
}

impl CompressionCodec {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: Compression::default(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serializes `value` and compresses it when asked to, or automatically
    /// when the serialized form exceeds the threshold.
    ///
    /// Automatic compression keeps the plain form if gzip does not shrink it.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T, force: Option<bool>) -> Result<Encoded> {
        let plain = serde_json::to_vec(value)?;
        let original_size = plain.len();

        let wanted = match force {
            Some(flag) => flag,
            None => original_size > self.threshold,
        };
        if !wanted {
            return Ok(Encoded {
                bytes: plain,
                compressed: false,
                original_size,
            });
        }

        let packed = self.gzip(&plain)?;
        if force.is_none() && packed.len() >= original_size {
            return Ok(Encoded {
                bytes: plain,
                compressed: false,
                original_size,
            });
        }

        Ok(Encoded {
            bytes: packed,
            compressed: true,
            original_size,
        })
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], compressed: bool) -> Result<T> {
        if compressed {
            let plain = self.gunzip(bytes)?;
            Ok(serde_json::from_slice(&plain)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    /// Unconditionally compresses a serializable value.
    pub fn compress<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        self.encode(value, Some(true)).map(|encoded| encoded.bytes)
    }

    /// Decompresses bytes produced by [`compress`](Self::compress).
    pub fn decompress<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        self.decode(bytes, true)
    }

    fn gzip(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| CacheError::Compression(format!("compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CacheError::Compression(format!("compression finish failed: {}", e)))
    }

    fn gunzip(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::Compression(format!("decompression failed: {}", e)))?;
        Ok(out)
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn large_document() -> Value {
        let rows: Vec<Value> = (0..200)
            .map(|i| json!({"id": i, "name": format!("component-{}", i), "tags": ["ui", "layout"]}))
            .collect();
        json!({ "rows": rows, "nested": { "flag": true, "ratio": 0.25, "none": null } })
    }

    #[test]
    fn test_small_values_stay_plain() {
        let codec = CompressionCodec::new(1024);
        let encoded = codec.encode(&json!({"x": 1}), None).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes, br#"{"x":1}"#);
    }

    #[test]
    fn test_large_values_compress_and_round_trip() {
        let codec = CompressionCodec::new(1024);
        let doc = large_document();

        let encoded = codec.encode(&doc, None).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.bytes.len() < encoded.original_size);

        let back: Value = codec.decode(&encoded.bytes, encoded.compressed).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_forced_compression_below_threshold() {
        let codec = CompressionCodec::new(1024);
        let bytes = codec.compress(&json!("tiny")).unwrap();
        let back: String = codec.decompress(&bytes).unwrap();
        assert_eq!(back, "tiny");
    }

    #[test]
    fn test_compression_can_be_disabled() {
        let codec = CompressionCodec::new(16);
        let encoded = codec.encode(&"y".repeat(500), Some(false)).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_incompressible_auto_stays_plain() {
        let codec = CompressionCodec::new(4);
        // Short payload: gzip framing alone outweighs any savings
        let encoded = codec.encode(&"abcdef", None).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_corrupt_payload_is_compression_error() {
        let codec = CompressionCodec::default();
        let result: Result<Value> = codec.decode(b"definitely not gzip", true);
        assert!(matches!(result, Err(CacheError::Compression(_))));
    }
}
