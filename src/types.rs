//! Core data types for volgrid

use crate::error::{Result, VolError};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single intensity sample
pub type Voxel = u16;

/// Dense block of voxels, indexed `[y, x, z]` (height, width, slices)
pub type VoxelBlock = Array3<Voxel>;

/// Axis order used by coordinate triples throughout the crate
pub const X: usize = 0;
pub const Y: usize = 1;
pub const Z: usize = 2;

/// Dimensions of the full volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeDims {
    /// Slice width (x)
    pub width: u64,
    /// Slice height (y)
    pub height: u64,
    /// Number of slices (z)
    pub depth: u64,
}

impl VolumeDims {
    /// Create volume dimensions.
    ///
    /// Every axis must be non-zero and addressable with signed coordinates,
    /// and the 16-bit voxel data must fit in a `u64` byte count.
    pub fn new(width: u64, height: u64, depth: u64) -> Result<Self> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(VolError::InvalidRegion(format!(
                "volume dimensions must be non-zero, got {}x{}x{}",
                width, height, depth
            )));
        }
        if [width, height, depth].iter().any(|&v| v > i64::MAX as u64) {
            return Err(VolError::InvalidRegion(format!(
                "volume axis exceeds {}: {}x{}x{}",
                i64::MAX,
                width,
                height,
                depth
            )));
        }
        let bytes = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(depth))
            .and_then(|v| v.checked_mul(std::mem::size_of::<Voxel>() as u64));
        if bytes.is_none() {
            return Err(VolError::InvalidRegion(format!(
                "volume {}x{}x{} is too large to address",
                width, height, depth
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
        })
    }

    /// Extent as an x/y/z triple
    pub fn xyz(&self) -> [u64; 3] {
        [self.width, self.height, self.depth]
    }

    /// The region covering the whole volume
    pub fn region(&self) -> Region {
        Region {
            min: [0, 0, 0],
            max: [self.width as i64, self.height as i64, self.depth as i64],
        }
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> u64 {
        self.width * self.height * self.depth
    }

    /// Check if a point lies inside the volume
    pub fn contains(&self, point: [i64; 3]) -> bool {
        self.region().contains(point)
    }
}

impl fmt::Display for VolumeDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {} x {}", self.width, self.height, self.depth)
    }
}

impl FromStr for VolumeDims {
    type Err = VolError;

    /// Parse `W,H,D`
    fn from_str(s: &str) -> Result<Self> {
        let [w, h, d] = parse_triple::<u64>(s)?;
        Self::new(w, h, d)
    }
}

/// Axis-aligned half-open box `[min, max)` in volume coordinates (x, y, z).
///
/// Coordinates are signed so a box may hang off the volume's low edge,
/// as a window centred near the origin does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub min: [i64; 3],
    pub max: [i64; 3],
}

impl Region {
    /// Create a region; every axis must satisfy `min < max`
    pub fn new(min: [i64; 3], max: [i64; 3]) -> Result<Self> {
        for axis in 0..3 {
            if min[axis] >= max[axis] {
                return Err(VolError::InvalidRegion(format!(
                    "empty or inverted extent on axis {}: {}..{}",
                    axis, min[axis], max[axis]
                )));
            }
        }
        Ok(Self { min, max })
    }

    /// A cube of side `size` around `center`.
    ///
    /// For odd sizes the centre voxel sits exactly in the middle.
    pub fn cube(center: [i64; 3], size: u64) -> Result<Self> {
        if size == 0 {
            return Err(VolError::InvalidRegion("cube size must be non-zero".to_string()));
        }
        let overflow = || {
            VolError::InvalidRegion(format!(
                "cube of side {} around {:?} leaves the coordinate range",
                size, center
            ))
        };
        let size = i64::try_from(size).map_err(|_| overflow())?;
        let half = size / 2;
        let mut min = [0i64; 3];
        let mut max = [0i64; 3];
        for axis in 0..3 {
            min[axis] = center[axis].checked_sub(half).ok_or_else(overflow)?;
            max[axis] = min[axis].checked_add(size).ok_or_else(overflow)?;
        }
        Self::new(min, max)
    }

    /// A single-voxel region
    pub fn point(p: [i64; 3]) -> Self {
        Self {
            min: p,
            max: [p[X] + 1, p[Y] + 1, p[Z] + 1],
        }
    }

    /// Length along each axis (x, y, z)
    pub fn extent(&self) -> [u64; 3] {
        [
            (self.max[X] - self.min[X]) as u64,
            (self.max[Y] - self.min[Y]) as u64,
            (self.max[Z] - self.min[Z]) as u64,
        ]
    }

    /// Shape of a [`VoxelBlock`] holding this region: (height, width, slices)
    pub fn shape(&self) -> (usize, usize, usize) {
        let [w, h, d] = self.extent();
        (h as usize, w as usize, d as usize)
    }

    /// Number of voxels in the region
    pub fn voxel_count(&self) -> u64 {
        self.extent().iter().product()
    }

    /// Check if a point lies inside the region
    pub fn contains(&self, p: [i64; 3]) -> bool {
        (0..3).all(|axis| p[axis] >= self.min[axis] && p[axis] < self.max[axis])
    }

    /// Check if `other` lies fully inside this region
    pub fn contains_region(&self, other: &Region) -> bool {
        (0..3).all(|axis| other.min[axis] >= self.min[axis] && other.max[axis] <= self.max[axis])
    }

    /// Overlap of two regions, if any
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let mut min = [0; 3];
        let mut max = [0; 3];
        for axis in 0..3 {
            min[axis] = self.min[axis].max(other.min[axis]);
            max[axis] = self.max[axis].min(other.max[axis]);
            if min[axis] >= max[axis] {
                return None;
            }
        }
        Some(Region { min, max })
    }

    /// Whether any coordinate is negative
    pub fn has_negative(&self) -> bool {
        self.min.iter().any(|&c| c < 0)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x: {}-{}, y: {}-{}, z: {}-{}",
            self.min[X], self.max[X], self.min[Y], self.max[Y], self.min[Z], self.max[Z]
        )
    }
}

impl FromStr for Region {
    type Err = VolError;

    /// Parse `x0-x1,y0-y1,z0-z1`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(VolError::InvalidRegion(format!(
                "expected x0-x1,y0-y1,z0-z1, got '{}'",
                s
            )));
        }

        let mut min = [0i64; 3];
        let mut max = [0i64; 3];
        for (axis, part) in parts.iter().enumerate() {
            let (lo, hi) = part.split_once('-').ok_or_else(|| {
                VolError::InvalidRegion(format!("expected a range like 0-500, got '{}'", part))
            })?;
            min[axis] = parse_number(lo)?;
            max[axis] = parse_number(hi)?;
        }
        Self::new(min, max)
    }
}

/// Index of a grid cell: `floor(coordinate / cell_size)` per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIndex {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl CellIndex {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Parse a point given as `X,Y,Z`
pub fn parse_point(s: &str) -> Result<[i64; 3]> {
    parse_triple::<i64>(s)
}

fn parse_triple<T: FromStr>(s: &str) -> Result<[T; 3]> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(VolError::InvalidRegion(format!(
            "expected three comma-separated values, got '{}'",
            s
        )));
    }
    let mut values = Vec::with_capacity(3);
    for part in parts {
        values.push(parse_number::<T>(part)?);
    }
    let mut it = values.into_iter();
    match (it.next(), it.next(), it.next()) {
        (Some(a), Some(b), Some(c)) => Ok([a, b, c]),
        _ => Err(VolError::InvalidRegion(format!("malformed triple '{}'", s))),
    }
}

fn parse_number<T: FromStr>(s: &str) -> Result<T> {
    s.trim()
        .parse::<T>()
        .map_err(|_| VolError::InvalidRegion(format!("not a valid number: '{}'", s)))
}
