//! Cell payload decoding
//!
//! A payload holds one cell as a stack of z slices, each slice `height` rows
//! of `width` samples. Decoders turn it into a [`VoxelBlock`] in the store's
//! `[y, x, z]` order, cropped to the cell's (possibly truncated) bounds.

use crate::compression::{get_compressor, CompressionMethod};
use crate::error::{Result, VolError};
use crate::types::{Region, VoxelBlock};
use crate::utils::le_bytes_to_voxels;
use ndarray::{s, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

/// On-the-wire format of a cell payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Multi-page TIFF, one 8- or 16-bit grayscale page per slice
    #[default]
    Tiff,
    /// Headerless little-endian u16 samples covering exactly the cell bounds
    Raw {
        #[serde(default)]
        compression: CompressionMethod,
    },
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Tiff => write!(f, "tiff"),
            PayloadFormat::Raw {
                compression: CompressionMethod::None,
            } => write!(f, "raw"),
            PayloadFormat::Raw {
                compression: CompressionMethod::Deflate,
            } => write!(f, "raw-deflate"),
            PayloadFormat::Raw {
                compression: CompressionMethod::Zstd,
            } => write!(f, "raw-zstd"),
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = VolError;

    fn from_str(s: &str) -> Result<Self> {
        let compression = match s {
            "tiff" => return Ok(PayloadFormat::Tiff),
            "raw" => CompressionMethod::None,
            "raw-deflate" => CompressionMethod::Deflate,
            "raw-zstd" => CompressionMethod::Zstd,
            other => {
                return Err(VolError::Configuration(format!(
                    "unknown payload format '{}' (expected tiff, raw, raw-deflate or raw-zstd)",
                    other
                )))
            }
        };
        Ok(PayloadFormat::Raw { compression })
    }
}

/// Trait for turning payload bytes into voxels
pub trait CellDecoder: Send + Sync {
    /// Decode a payload for a cell with the given clipped `bounds`.
    ///
    /// The returned block has exactly `bounds.shape()`.
    fn decode(&self, payload: &[u8], bounds: &Region, cell_size: u64) -> Result<VoxelBlock>;

    /// Get the payload format
    fn format(&self) -> PayloadFormat;
}

/// Multi-page TIFF decoder
#[derive(Debug, Default)]
pub struct TiffCellDecoder;

impl TiffCellDecoder {
    fn decode_pages(payload: &[u8]) -> Result<VoxelBlock> {
        let mut decoder = Decoder::new(Cursor::new(payload))?;
        let (width, height) = decoder.dimensions()?;
        let (width, height) = (width as usize, height as usize);

        let mut pages = Vec::new();
        loop {
            if decoder.dimensions()? != (width as u32, height as u32) {
                return Err(VolError::Decode(format!(
                    "page {} differs in size from the first page",
                    pages.len()
                )));
            }
            let samples = match decoder.read_image()? {
                DecodingResult::U16(v) => v,
                DecodingResult::U8(v) => v.into_iter().map(u16::from).collect(),
                _ => {
                    return Err(VolError::Decode(
                        "unsupported sample type, expected 8- or 16-bit grayscale".to_string(),
                    ))
                }
            };
            if samples.len() != width * height {
                return Err(VolError::Decode(format!(
                    "page {} holds {} samples, expected {} for one channel",
                    pages.len(),
                    samples.len(),
                    width * height
                )));
            }
            pages.push(samples);

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        let mut block = VoxelBlock::zeros((height, width, pages.len()));
        for (z, page) in pages.iter().enumerate() {
            let view = ArrayView2::from_shape((height, width), page)
                .map_err(|e| VolError::Decode(e.to_string()))?;
            block.index_axis_mut(Axis(2), z).assign(&view);
        }
        Ok(block)
    }
}

impl CellDecoder for TiffCellDecoder {
    fn decode(&self, payload: &[u8], bounds: &Region, cell_size: u64) -> Result<VoxelBlock> {
        let block = Self::decode_pages(payload)?;
        fit_to_bounds(block, bounds, cell_size)
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Tiff
    }
}

/// Headerless little-endian u16 decoder
#[derive(Debug, Default)]
pub struct RawCellDecoder {
    compression: CompressionMethod,
}

impl RawCellDecoder {
    pub fn new(compression: CompressionMethod) -> Self {
        Self { compression }
    }
}

impl CellDecoder for RawCellDecoder {
    fn decode(&self, payload: &[u8], bounds: &Region, _cell_size: u64) -> Result<VoxelBlock> {
        let (h, w, d) = bounds.shape();
        let expected_bytes = h * w * d * 2;
        let bytes = get_compressor(self.compression)
            .decompress(payload, expected_bytes)
            .map_err(|e| VolError::Decode(format!("raw payload: {}", e)))?;

        // Slices are stored one after another, row-major within a slice
        let samples = le_bytes_to_voxels(&bytes)?;
        let zyx = ndarray::Array3::from_shape_vec((d, h, w), samples)
            .map_err(|e| VolError::Decode(e.to_string()))?;
        Ok(zyx.permuted_axes([1, 2, 0]).as_standard_layout().into_owned())
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Raw {
            compression: self.compression,
        }
    }
}

/// Get a decoder for a given payload format
pub fn get_decoder(format: PayloadFormat) -> Box<dyn CellDecoder> {
    match format {
        PayloadFormat::Tiff => Box::new(TiffCellDecoder),
        PayloadFormat::Raw { compression } => Box::new(RawCellDecoder::new(compression)),
    }
}

/// Crop a decoded block to the cell's bounds.
///
/// Edge cells may arrive either truncated or padded to the full cell size;
/// anything smaller than the bounds or larger than a cell is corrupt.
fn fit_to_bounds(block: VoxelBlock, bounds: &Region, cell_size: u64) -> Result<VoxelBlock> {
    let (h, w, d) = bounds.shape();
    let (bh, bw, bd) = block.dim();
    let limit = cell_size as usize;

    if bh < h || bw < w || bd < d {
        return Err(VolError::Decode(format!(
            "payload is {}x{}x{} (h x w x d), smaller than cell bounds {}x{}x{}",
            bh, bw, bd, h, w, d
        )));
    }
    if bh > limit || bw > limit || bd > limit {
        return Err(VolError::Decode(format!(
            "payload is {}x{}x{} (h x w x d), larger than a {}^3 cell",
            bh, bw, bd, cell_size
        )));
    }

    if (bh, bw, bd) == (h, w, d) {
        Ok(block)
    } else {
        Ok(block.slice(s![..h, ..w, ..d]).to_owned())
    }
}

/// Encode a block as a multi-page 16-bit TIFF, one page per z slice
pub fn encode_tiff_cell(block: &VoxelBlock) -> Result<Vec<u8>> {
    let (h, w, d) = block.dim();
    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buf)?;
        for z in 0..d {
            let page: Vec<u16> = block.index_axis(Axis(2), z).iter().copied().collect();
            encoder.write_image::<colortype::Gray16>(w as u32, h as u32, &page)?;
        }
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionLevel, Compressor, ZstdCompressor};
    use crate::utils::voxels_to_le_bytes;

    fn gradient(h: usize, w: usize, d: usize) -> VoxelBlock {
        VoxelBlock::from_shape_fn((h, w, d), |(y, x, z)| (y * 100 + x * 10 + z) as u16)
    }

    #[test]
    fn test_tiff_pages_become_z_slices() {
        let block = gradient(4, 3, 2);
        let payload = encode_tiff_cell(&block).unwrap();
        let bounds = Region::new([0, 0, 0], [3, 4, 2]).unwrap();
        let decoded = TiffCellDecoder.decode(&payload, &bounds, 4).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded[[3, 2, 1]], 321);
    }

    #[test]
    fn test_padded_edge_cell_is_cropped() {
        let block = gradient(4, 4, 4);
        let payload = encode_tiff_cell(&block).unwrap();
        // A far-edge cell truncated to 2 x 3 x 1 (x, y, z)
        let bounds = Region::new([4, 8, 12], [6, 11, 13]).unwrap();
        let decoded = TiffCellDecoder.decode(&payload, &bounds, 4).unwrap();
        assert_eq!(decoded.dim(), (3, 2, 1));
        assert_eq!(decoded[[2, 1, 0]], 210);
    }

    #[test]
    fn test_short_payload_rejected() {
        let payload = encode_tiff_cell(&gradient(2, 2, 2)).unwrap();
        let bounds = Region::new([0, 0, 0], [4, 4, 4]).unwrap();
        let err = TiffCellDecoder.decode(&payload, &bounds, 4).unwrap_err();
        assert!(matches!(err, VolError::Decode(_)));
    }

    #[test]
    fn test_truncated_tiff_rejected() {
        let payload = encode_tiff_cell(&gradient(8, 8, 2)).unwrap();
        let bounds = Region::new([0, 0, 0], [8, 8, 2]).unwrap();
        let err = TiffCellDecoder
            .decode(&payload[..payload.len() / 3], &bounds, 8)
            .unwrap_err();
        assert!(matches!(err, VolError::Decode(_)));
    }

    #[test]
    fn test_raw_zstd_payload() {
        let bounds = Region::new([0, 0, 0], [3, 2, 2]).unwrap();
        // z-major, then rows (y), then columns (x)
        let mut bytes = Vec::new();
        voxels_to_le_bytes(0u16..12, &mut bytes);
        let payload = ZstdCompressor
            .compress(&bytes, CompressionLevel::default())
            .unwrap();

        let decoder = get_decoder("raw-zstd".parse().unwrap());
        let block = decoder.decode(&payload, &bounds, 3).unwrap();
        assert_eq!(block.dim(), (2, 3, 2));
        // z = 1, y = 0, x = 2 is sample 6 + 0 + 2
        assert_eq!(block[[0, 2, 1]], 8);
        assert_eq!(block[[1, 0, 0]], 3);
    }

    #[test]
    fn test_raw_wrong_length() {
        let bounds = Region::new([0, 0, 0], [2, 2, 2]).unwrap();
        let err = RawCellDecoder::default()
            .decode(&[0u8; 10], &bounds, 2)
            .unwrap_err();
        assert!(matches!(err, VolError::Decode(_)));
    }

    #[test]
    fn test_payload_format_parse() {
        assert_eq!("tiff".parse::<PayloadFormat>().unwrap(), PayloadFormat::Tiff);
        assert_eq!(
            "raw-deflate".parse::<PayloadFormat>().unwrap().to_string(),
            "raw-deflate"
        );
        assert!("png".parse::<PayloadFormat>().is_err());
    }
}
