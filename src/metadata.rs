//! Store metadata structures

use crate::types::VolumeDims;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Store file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersion {
    pub major: u16,
    pub minor: u16,
}

impl StoreVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for StoreVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Metadata kept in the store header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Format version
    pub version: StoreVersion,

    /// Identity of this store file
    pub volume_id: Uuid,

    /// Volume dimensions, fixed at creation
    pub dims: VolumeDims,

    /// Bits per sample (always 16)
    pub sample_bits: u8,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Custom metadata key-value pairs (source URL, scan name, ...)
    pub custom_metadata: BTreeMap<String, String>,
}

impl StoreMetadata {
    /// Create new metadata
    pub fn new(dims: VolumeDims) -> Self {
        Self {
            version: StoreVersion::default(),
            volume_id: Uuid::new_v4(),
            dims,
            sample_bits: 16,
            created_at: Utc::now(),
            custom_metadata: BTreeMap::new(),
        }
    }

    /// Add custom metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }

    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Uncompressed size of the voxel data in bytes
    pub fn logical_size_bytes(&self) -> u64 {
        self.dims.voxel_count() * u64::from(self.sample_bits / 8)
    }
}
