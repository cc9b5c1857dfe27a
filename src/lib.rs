//! volgrid - tiled volumetric store with windowed access
//!
//! Ingests very large 3D scan volumes, published as grids of fixed-size image
//! cells, into a single sparse local file and serves bounded in-memory cubes
//! of it to an interactive consumer.
//!
//! # Features
//!
//! - Grid addressing from a region of interest to covering cells
//! - Resumable two-phase pipeline: download to staging, then apply
//! - Sparse persistent store with single-writer / reader exclusivity
//! - Windowed cache with explicit reload
//! - Multi-page TIFF and raw (optionally Deflate/Zstd) cell payloads
//! - HTTP(S) sources with basic auth (feature `http-client`)
//!
//! # Example
//!
//! ```rust,ignore
//! use volgrid::{SparseVolumeStore, WindowedCache};
//!
//! # fn example() -> volgrid::Result<()> {
//! let store = SparseVolumeStore::open_read("/data/scan.vgs")?;
//! let mut cache = WindowedCache::new(store, 301)?;
//! cache.load([4000, 3900, 7000])?;
//! let intensity = cache.sample(4010, 3900, 7000)?;
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod grid;
pub mod ingest;
pub mod metadata;
pub mod pipeline;
pub mod source;
pub mod staging;
pub mod store;
pub mod types;
pub mod utils;
pub mod window;

// Re-exports
pub use compression::{CompressionMethod, Compressor};
pub use config::{RetryPolicy, VolgridConfig};
pub use decode::{CellDecoder, PayloadFormat};
pub use error::{Result, TransferFailureKind, VolError};
pub use fetch::{FetchOutcome, Fetcher};
pub use grid::{cell_bounds, cells_covering, CellGrid};
pub use ingest::{ApplyReport, IngestEngine};
pub use metadata::StoreMetadata;
pub use pipeline::{Action, Pipeline};
pub use source::{CellSource, Credentials};
pub use staging::{StagingArea, StagingState};
pub use store::{MemoryVolume, SparseVolumeStore, VoxelStore};
pub use types::{CellIndex, Region, VolumeDims, Voxel, VoxelBlock};
pub use window::{DisplayRange, WindowedCache};

/// Version of the volgrid implementation
pub const VOLGRID_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VOLGRID_VERSION.is_empty());
    }
}
