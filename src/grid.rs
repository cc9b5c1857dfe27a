//! Grid addressing - maps regions of the volume onto fixed-size cells

use crate::error::{Result, VolError};
use crate::types::{CellIndex, Region, VolumeDims, X, Y, Z};
use serde::{Deserialize, Serialize};

/// Default cell side length of the remote grid
pub const DEFAULT_CELL_SIZE: u64 = 500;

/// The cell grid laid over a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellGrid {
    /// Side length of a cell in voxels
    pub cell_size: u64,

    /// Dimensions of the volume the grid covers
    pub dims: VolumeDims,
}

impl CellGrid {
    /// Create a grid; the cell size must be non-zero
    pub fn new(cell_size: u64, dims: VolumeDims) -> Result<Self> {
        if cell_size == 0 {
            return Err(VolError::InvalidRegion("cell size must be non-zero".to_string()));
        }
        Ok(Self { cell_size, dims })
    }

    /// Number of cells along each axis (x, y, z)
    pub fn cell_count(&self) -> [u64; 3] {
        let [w, h, d] = self.dims.xyz();
        [
            w.div_ceil(self.cell_size),
            h.div_ceil(self.cell_size),
            d.div_ceil(self.cell_size),
        ]
    }

    /// Total number of cells in the grid
    pub fn total_cells(&self) -> u64 {
        self.cell_count().iter().product()
    }

    /// The cell containing a point, if the point lies inside the volume
    pub fn cell_of(&self, point: [i64; 3]) -> Option<CellIndex> {
        if !self.dims.contains(point) {
            return None;
        }
        let s = self.cell_size as i64;
        Some(CellIndex::new(
            (point[X] / s) as u64,
            (point[Y] / s) as u64,
            (point[Z] / s) as u64,
        ))
    }

    /// Voxel bounds of a cell, truncated at the far edges of the volume
    pub fn cell_bounds(&self, cell: CellIndex) -> Result<Region> {
        let count = self.cell_count();
        let index = [cell.x, cell.y, cell.z];
        if (0..3).any(|axis| index[axis] >= count[axis]) {
            return Err(VolError::InvalidRegion(format!(
                "cell {} lies outside the {:?} cell grid",
                cell, count
            )));
        }

        let extent = self.dims.xyz();
        let mut min = [0i64; 3];
        let mut max = [0i64; 3];
        for axis in 0..3 {
            let start = index[axis] * self.cell_size;
            let end = (start + self.cell_size).min(extent[axis]);
            min[axis] = start as i64;
            max[axis] = end as i64;
        }
        Region::new(min, max)
    }

    /// All cells intersecting `roi`, ordered by y, then x, then z.
    ///
    /// Portions of the ROI beyond the volume are ignored; an ROI entirely
    /// outside the volume yields no cells. Negative coordinates are rejected.
    pub fn cells_covering(&self, roi: &Region) -> Result<Vec<CellIndex>> {
        if roi.has_negative() {
            return Err(VolError::InvalidRegion(format!(
                "negative coordinates are not addressable: {}",
                roi
            )));
        }

        let Some(clipped) = roi.intersect(&self.dims.region()) else {
            return Ok(Vec::new());
        };

        let s = self.cell_size as i64;
        let first = [clipped.min[X] / s, clipped.min[Y] / s, clipped.min[Z] / s];
        let last = [
            (clipped.max[X] - 1) / s,
            (clipped.max[Y] - 1) / s,
            (clipped.max[Z] - 1) / s,
        ];

        let mut cells = Vec::new();
        for y in first[Y]..=last[Y] {
            for x in first[X]..=last[X] {
                for z in first[Z]..=last[Z] {
                    cells.push(CellIndex::new(x as u64, y as u64, z as u64));
                }
            }
        }
        Ok(cells)
    }

    /// Name under which the remote source publishes a cell.
    ///
    /// Remote names are 1-based and list y before x.
    pub fn cell_file_name(cell: CellIndex) -> String {
        format!(
            "cell_yxz_{:03}_{:03}_{:03}.tif",
            cell.y + 1,
            cell.x + 1,
            cell.z + 1
        )
    }

    /// Summary string of the grid
    pub fn summary(&self) -> String {
        let [cx, cy, cz] = self.cell_count();
        format!(
            "Volume {} in {}^3 cells ({} x {} x {} = {} cells)",
            self.dims,
            self.cell_size,
            cx,
            cy,
            cz,
            self.total_cells()
        )
    }
}

/// Cells covering `roi` for a grid of `cell_size` over `dims`
pub fn cells_covering(roi: &Region, cell_size: u64, dims: VolumeDims) -> Result<Vec<CellIndex>> {
    CellGrid::new(cell_size, dims)?.cells_covering(roi)
}

/// Bounds of `cell` for a grid of `cell_size` over `dims`
pub fn cell_bounds(cell: CellIndex, cell_size: u64, dims: VolumeDims) -> Result<Region> {
    CellGrid::new(cell_size, dims)?.cell_bounds(cell)
}
