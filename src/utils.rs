//! Utility functions

use crate::error::{Result, VolError};
use crate::types::Voxel;

/// Decode little-endian u16 samples
pub fn le_bytes_to_voxels(bytes: &[u8]) -> Result<Vec<Voxel>> {
    if bytes.len() % 2 != 0 {
        return Err(VolError::Decode(
            "Byte length not aligned with 16-bit samples".to_string(),
        ));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode samples as little-endian bytes, appending to `out`
pub fn voxels_to_le_bytes(voxels: impl IntoIterator<Item = Voxel>, out: &mut Vec<u8>) {
    for v in voxels {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Align value to power of 2
pub fn align_to_power_of_2(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxel_bytes() {
        let mut bytes = Vec::new();
        voxels_to_le_bytes([1u16, 256, 65535], &mut bytes);
        assert_eq!(bytes, vec![1, 0, 0, 1, 255, 255]);
        assert_eq!(le_bytes_to_voxels(&bytes).unwrap(), vec![1, 256, 65535]);
        assert!(le_bytes_to_voxels(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
        assert_eq!(format_bytes(1_000_000_000_000_000), "909.49 TB");
    }

    #[test]
    fn test_align_to_power_of_2() {
        assert_eq!(align_to_power_of_2(0, 4096), 0);
        assert_eq!(align_to_power_of_2(1, 4096), 4096);
        assert_eq!(align_to_power_of_2(4096, 4096), 4096);
        assert_eq!(align_to_power_of_2(4097, 4096), 8192);
    }
}
