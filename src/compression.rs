//! Codecs for raw cell payloads
//!
//! Raw payloads carry exactly one cell's worth of little-endian samples, so
//! the decoded length is always known up front. Decoders read at most one
//! byte past it: a corrupt or hostile payload cannot inflate without bound.

use crate::error::{Result, VolError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Leading bytes of every zstd frame
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression applied to a raw cell payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Payload bytes are the samples themselves
    #[default]
    None,
    /// Raw deflate stream
    Deflate,
    /// Zstandard frame
    Zstd,
}

impl CompressionMethod {
    /// Whether `payload` starts the way this method's output does.
    ///
    /// Raw deflate has no header, so only zstd can be told apart.
    pub fn matches(&self, payload: &[u8]) -> bool {
        match self {
            CompressionMethod::Zstd => payload.starts_with(&ZSTD_MAGIC),
            CompressionMethod::None | CompressionMethod::Deflate => true,
        }
    }
}

/// Encoder effort (1 fastest .. 9 smallest)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.clamp(1, 9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// A payload codec
pub trait Compressor: Send + Sync {
    /// Encode a payload (used to publish or fabricate raw cells)
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Decode a payload that must expand to exactly `expected_len` bytes
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

/// Payload stored as-is
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        check_len(data.len(), expected_len)?;
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Raw deflate via flate2
#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(u32::from(level.value())));
        let mut out = Vec::new();
        encoder
            .read_to_end(&mut out)
            .map_err(|e| VolError::Compression(e.to_string()))?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        read_bounded(DeflateDecoder::new(data), expected_len)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

/// Zstandard via the zstd crate
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        // zstd's useful range is wider; stretch 1..9 over 1..19
        let zstd_level = i32::from(level.value()) * 2 + 1;
        zstd::encode_all(data, zstd_level).map_err(|e| VolError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if !CompressionMethod::Zstd.matches(data) {
            return Err(VolError::Decompression(
                "payload is not a zstd frame".to_string(),
            ));
        }
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| VolError::Decompression(e.to_string()))?;
        read_bounded(decoder, expected_len)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get the codec for a method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

fn read_bounded(reader: impl Read, expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    reader
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| VolError::Decompression(e.to_string()))?;
    check_len(out.len(), expected_len)?;
    Ok(out)
}

fn check_len(actual: usize, expected: usize) -> Result<()> {
    if actual > expected {
        return Err(VolError::Decompression(format!(
            "payload expands past the expected {} bytes",
            expected
        )));
    }
    if actual < expected {
        return Err(VolError::Decompression(format!(
            "payload holds {} bytes, expected {}",
            actual, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_bytes() -> Vec<u8> {
        (0..2000u32).flat_map(|i| ((i % 37) as u16).to_le_bytes()).collect()
    }

    #[test]
    fn test_none_checks_length() {
        let codec = get_compressor(CompressionMethod::None);
        let data = cell_bytes();
        assert_eq!(codec.decompress(&data, data.len()).unwrap(), data);
        assert!(matches!(
            codec.decompress(&data, data.len() + 2),
            Err(VolError::Decompression(_))
        ));
    }

    #[test]
    fn test_deflate() {
        let codec = DeflateCompressor;
        let data = cell_bytes();
        let compressed = codec.compress(&data, CompressionLevel::default()).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_zstd_and_magic() {
        let codec = ZstdCompressor;
        let data = cell_bytes();
        let compressed = codec.compress(&data, CompressionLevel::fast()).unwrap();
        assert!(CompressionMethod::Zstd.matches(&compressed));
        assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_oversized_output_rejected() {
        let data = vec![0u8; 64 * 1024];
        let compressed = ZstdCompressor.compress(&data, CompressionLevel::fast()).unwrap();
        let err = ZstdCompressor.decompress(&compressed, 1024).unwrap_err();
        assert!(err.to_string().contains("expands past"));
    }

    #[test]
    fn test_not_a_zstd_frame() {
        let err = ZstdCompressor.decompress(b"II*\0tiff", 8).unwrap_err();
        assert!(matches!(err, VolError::Decompression(_)));
    }

    #[test]
    fn test_method_names() {
        let method: CompressionMethod = serde_json::from_str("\"zstd\"").unwrap();
        assert_eq!(method, CompressionMethod::Zstd);
        assert_eq!(CompressionLevel::new(0).value(), 1);
    }
}
