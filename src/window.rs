//! Windowed sub-volume cache
//!
//! Holds one dense cube of the volume in memory around an operator-chosen
//! centre. Queries outside the cube fail rather than fetching implicitly;
//! moving the viewpoint means an explicit, blocking [`WindowedCache::reload`]
//! that re-reads the whole cube.

use crate::error::{Result, VolError};
use crate::store::VoxelStore;
use crate::types::{Region, VolumeDims, Voxel, VoxelBlock, X, Y, Z};
use ndarray::{s, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Default side length of a window
pub const DEFAULT_WINDOW_SIZE: u64 = 301;

/// Maps 16-bit intensities onto an 8-bit display range.
///
/// Samples are scaled down to 8 bits, clipped to `[low, high]` and stretched
/// over 0..=255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDisplayRange")]
pub struct DisplayRange {
    low: u8,
    high: u8,
}

#[derive(Deserialize)]
struct RawDisplayRange {
    low: u8,
    high: u8,
}

impl TryFrom<RawDisplayRange> for DisplayRange {
    type Error = VolError;

    fn try_from(raw: RawDisplayRange) -> Result<Self> {
        Self::new(raw.low, raw.high)
    }
}

impl DisplayRange {
    pub fn new(low: u8, high: u8) -> Result<Self> {
        if low >= high {
            return Err(VolError::Configuration(format!(
                "display range low ({}) must be below high ({})",
                low, high
            )));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u8 {
        self.low
    }

    pub fn high(&self) -> u8 {
        self.high
    }

    /// Map one sample
    pub fn map(&self, v: Voxel) -> u8 {
        let a = (v as f32 / 256.0).clamp(self.low as f32, self.high as f32);
        ((a - self.low as f32) * 255.0 / (self.high - self.low) as f32) as u8
    }
}

impl Default for DisplayRange {
    fn default() -> Self {
        Self {
            low: 100,
            high: 230,
        }
    }
}

/// A loaded cube
#[derive(Debug, Clone)]
pub struct Window {
    center: [i64; 3],
    bounds: Region,
    data: VoxelBlock,
}

impl Window {
    /// Centre the window was loaded around
    pub fn center(&self) -> [i64; 3] {
        self.center
    }

    /// Volume-space box covered by the window (may extend past the volume)
    pub fn bounds(&self) -> Region {
        self.bounds
    }

    /// The cube's voxels, indexed `[y, x, z]` relative to `bounds().min`
    pub fn data(&self) -> &VoxelBlock {
        &self.data
    }

    /// Intensity at a volume coordinate
    pub fn sample(&self, x: i64, y: i64, z: i64) -> Result<Voxel> {
        if !self.bounds.contains([x, y, z]) {
            return Err(VolError::OutOfLoadedWindow(format!(
                "({}, {}, {}) is outside the loaded window {}",
                x, y, z, self.bounds
            )));
        }
        let min = self.bounds.min;
        Ok(self.data[[
            (y - min[Y]) as usize,
            (x - min[X]) as usize,
            (z - min[Z]) as usize,
        ]])
    }

    /// Dense copy of a box fully inside the window
    pub fn sample_region(&self, region: &Region) -> Result<VoxelBlock> {
        if !self.bounds.contains_region(region) {
            return Err(VolError::OutOfLoadedWindow(format!(
                "{} is not inside the loaded window {}",
                region, self.bounds
            )));
        }
        let min = self.bounds.min;
        let rel = |axis: usize, v: i64| (v - min[axis]) as usize;
        Ok(self
            .data
            .slice(s![
                rel(Y, region.min[Y])..rel(Y, region.max[Y]),
                rel(X, region.min[X])..rel(X, region.max[X]),
                rel(Z, region.min[Z])..rel(Z, region.max[Z])
            ])
            .to_owned())
    }

    /// One z slice mapped for display, shaped (height, width)
    pub fn z_slice_u8(&self, z: i64, range: DisplayRange) -> Result<Array2<u8>> {
        if z < self.bounds.min[Z] || z >= self.bounds.max[Z] {
            return Err(VolError::OutOfLoadedWindow(format!(
                "slice z={} is outside the loaded window {}",
                z, self.bounds
            )));
        }
        let slice = self
            .data
            .index_axis(Axis(2), (z - self.bounds.min[Z]) as usize);
        Ok(slice.mapv(|v| range.map(v)))
    }
}

/// Memory-bounded view onto a store
pub struct WindowedCache<S: VoxelStore> {
    store: S,
    window_size: u64,
    current: Option<Window>,
}

impl<S: VoxelStore> WindowedCache<S> {
    /// Create a cache serving cubes of side `window_size`
    pub fn new(store: S, window_size: u64) -> Result<Self> {
        if window_size == 0 {
            return Err(VolError::InvalidRegion(
                "window size must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            store,
            window_size,
            current: None,
        })
    }

    /// Side length of the cubes this cache loads
    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Dimensions of the underlying volume
    pub fn volume_bounds(&self) -> VolumeDims {
        self.store.bounds()
    }

    /// The loaded window, if any
    pub fn window(&self) -> Option<&Window> {
        self.current.as_ref()
    }

    /// Bounds of the loaded window, if any
    pub fn bounds(&self) -> Option<Region> {
        self.current.as_ref().map(Window::bounds)
    }

    /// Read the cube around `center` from the store and make it current.
    ///
    /// Portions outside the volume are zero-filled. A cube with no overlap
    /// with the volume fails with [`VolError::OutOfBounds`] and leaves the
    /// previous window in place.
    pub fn load(&mut self, center: [i64; 3]) -> Result<&Window> {
        let bounds = Region::cube(center, self.window_size)?;
        let start = Instant::now();
        let data = self.store.read_block(&bounds)?;
        info!(
            center = ?center,
            bounds = %bounds,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "window loaded"
        );
        Ok(self.current.insert(Window {
            center,
            bounds,
            data,
        }))
    }

    /// Discard the current window and load a fresh one around `center`.
    ///
    /// The old cube is dropped before reading so at most one is ever held.
    /// If the load fails no window remains loaded.
    pub fn reload(&mut self, center: [i64; 3]) -> Result<&Window> {
        self.current = None;
        self.load(center)
    }

    /// Intensity at (x, y, z) in the loaded window
    pub fn sample(&self, x: i64, y: i64, z: i64) -> Result<Voxel> {
        self.loaded()?.sample(x, y, z)
    }

    /// Dense box from the loaded window
    pub fn sample_region(&self, region: &Region) -> Result<VoxelBlock> {
        self.loaded()?.sample_region(region)
    }

    /// Give back the store, releasing the read handle when it drops
    pub fn into_store(self) -> S {
        self.store
    }

    fn loaded(&self) -> Result<&Window> {
        self.current
            .as_ref()
            .ok_or_else(|| VolError::OutOfLoadedWindow("no window loaded".to_string()))
    }
}
