//! Persistent sparse volume store
//!
//! The whole volume lives in one file: a small header followed by a dense
//! u16 array laid out as (height, width, slices). The file is extended with
//! `set_len`, so regions never written occupy no disk space and read back as
//! zero.
//!
//! Exclusivity is taken at open time with OS file locks: a write handle holds
//! an exclusive lock, a read handle a shared one. Opening while an
//! incompatible handle exists anywhere fails with
//! [`VolError::StoreContention`]; there is no waiting and no in-process
//! arbitration.

use crate::error::{Result, VolError};
use crate::metadata::{StoreMetadata, StoreVersion};
use crate::types::{Region, VolumeDims, Voxel, VoxelBlock, X, Y, Z};
use crate::utils::{align_to_power_of_2, format_bytes, voxels_to_le_bytes};
use fs2::FileExt;
use ndarray::{s, Array3};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Magic number at the start of a store file
pub const STORE_MAGIC: &[u8; 4] = b"VGS\0";

/// Voxel data starts on a boundary of this many bytes
const DATA_ALIGNMENT: u64 = 4096;

/// Fixed prefix: magic plus header length
const PREAMBLE_LEN: u64 = 8;

/// Narrow capability over a voxel volume.
///
/// The ingest engine and the windowed cache only ever talk to a volume
/// through this trait, so alternate backends slot in without touching them.
pub trait VoxelStore {
    /// Dimensions of the volume
    fn bounds(&self) -> VolumeDims;

    /// Read a dense block for `region`.
    ///
    /// Parts of the region outside the volume read as zero. A region with no
    /// overlap at all fails with [`VolError::OutOfBounds`].
    fn read_block(&self, region: &Region) -> Result<VoxelBlock>;

    /// Write a dense block (indexed `[y, x, z]`) with its origin at `offset` (x, y, z)
    fn write_block(&mut self, offset: [u64; 3], block: &VoxelBlock) -> Result<()>;

    /// Make previous writes durable
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How a store handle was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A handle to the on-disk sparse volume
#[derive(Debug)]
pub struct SparseVolumeStore {
    file: File,
    path: PathBuf,
    metadata: StoreMetadata,
    data_offset: u64,
    mode: AccessMode,
}

impl SparseVolumeStore {
    /// Create a new store file; fails if the file already exists
    pub fn create(path: impl AsRef<Path>, metadata: StoreMetadata) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = bincode::serialize(&metadata)?;
        if PREAMBLE_LEN + header.len() as u64 > DATA_ALIGNMENT {
            return Err(VolError::Metadata(format!(
                "metadata takes {} bytes, more than the {} byte header block",
                header.len(),
                DATA_ALIGNMENT
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        lock(&file, &path, AccessMode::Write)?;

        let mut preamble = Vec::with_capacity(PREAMBLE_LEN as usize + header.len());
        preamble.extend_from_slice(STORE_MAGIC);
        preamble.extend_from_slice(&(header.len() as u32).to_le_bytes());
        preamble.extend_from_slice(&header);
        write_all_at(&file, &preamble, 0)?;

        let data_offset = align_to_power_of_2(preamble.len() as u64, DATA_ALIGNMENT);
        file.set_len(data_offset + metadata.logical_size_bytes())?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            dims = %metadata.dims,
            logical_size = %format_bytes(metadata.logical_size_bytes()),
            "created sparse store"
        );

        Ok(Self {
            file,
            path,
            metadata,
            data_offset,
            mode: AccessMode::Write,
        })
    }

    /// Open an existing store for writing (exclusive of every other handle)
    pub fn open_write(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), AccessMode::Write)
    }

    /// Open an existing store for reading (excludes writers)
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), AccessMode::Read)
    }

    /// Open a store for writing, creating it when absent.
    ///
    /// `dims` is required only when the file does not exist yet; for an
    /// existing store it must match if given.
    pub fn open_or_create(path: impl AsRef<Path>, dims: Option<VolumeDims>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let store = Self::open_write(path)?;
            if let Some(dims) = dims {
                if dims != store.metadata.dims {
                    return Err(VolError::Configuration(format!(
                        "store {} holds a {} volume, not {}",
                        path.display(),
                        store.metadata.dims,
                        dims
                    )));
                }
            }
            return Ok(store);
        }

        let dims = dims.ok_or_else(|| {
            VolError::Configuration(format!(
                "store {} does not exist yet; volume dimensions are required to create it",
                path.display()
            ))
        })?;
        Self::create(path, StoreMetadata::new(dims))
    }

    fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .open(path)?;
        lock(&file, path, mode)?;

        let mut preamble = [0u8; PREAMBLE_LEN as usize];
        read_exact_at(&file, &mut preamble, 0)
            .map_err(|_| VolError::InvalidFormat("file too short for a store header".to_string()))?;
        if &preamble[..4] != STORE_MAGIC {
            return Err(VolError::InvalidFormat(format!(
                "{} is not a volgrid store",
                path.display()
            )));
        }

        let header_len = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]);
        if PREAMBLE_LEN + u64::from(header_len) > DATA_ALIGNMENT {
            return Err(VolError::InvalidFormat(format!(
                "header length {} exceeds the {} byte header block",
                header_len, DATA_ALIGNMENT
            )));
        }
        let mut header = vec![0u8; header_len as usize];
        read_exact_at(&file, &mut header, PREAMBLE_LEN)
            .map_err(|_| VolError::InvalidFormat("truncated store header".to_string()))?;
        let metadata: StoreMetadata = bincode::deserialize(&header)
            .map_err(|e| VolError::Metadata(e.to_string()))?;

        if !metadata.version.is_compatible(&StoreVersion::CURRENT) {
            return Err(VolError::UnsupportedVersion(u32::from(metadata.version.major)));
        }
        let dims = metadata.dims;
        VolumeDims::new(dims.width, dims.height, dims.depth)
            .map_err(|e| VolError::InvalidFormat(format!("stored dimensions: {}", e)))?;

        let data_offset = align_to_power_of_2(PREAMBLE_LEN + u64::from(header_len), DATA_ALIGNMENT);
        let expected_len = data_offset + metadata.logical_size_bytes();
        let actual_len = file.metadata()?.len();
        if actual_len < expected_len {
            return Err(VolError::InvalidFormat(format!(
                "store is {} bytes, expected at least {}",
                actual_len, expected_len
            )));
        }

        debug!(path = %path.display(), ?mode, dims = %metadata.dims, "opened store");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            metadata,
            data_offset,
            mode,
        })
    }

    /// Store metadata
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How this handle was opened
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Disk space actually backing the file
    pub fn allocated_bytes(&self) -> Result<u64> {
        let meta = self.file.metadata()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(meta.blocks() * 512)
        }
        #[cfg(not(unix))]
        {
            Ok(meta.len())
        }
    }

    /// Get a summary string of the store
    pub fn summary(&self) -> Result<String> {
        Ok(format!(
            "Store {} ({}): {} u{} volume, {} logical, {} allocated, created {}",
            self.path.display(),
            self.metadata.volume_id,
            self.metadata.dims,
            self.metadata.sample_bits,
            format_bytes(self.metadata.logical_size_bytes()),
            format_bytes(self.allocated_bytes()?),
            self.metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ))
    }

    /// Byte offset of voxel (x, y, z)
    fn voxel_offset(&self, x: u64, y: u64, z: u64) -> u64 {
        let dims = &self.metadata.dims;
        self.data_offset + ((y * dims.width + x) * dims.depth + z) * 2
    }
}

impl VoxelStore for SparseVolumeStore {
    fn bounds(&self) -> VolumeDims {
        self.metadata.dims
    }

    fn read_block(&self, region: &Region) -> Result<VoxelBlock> {
        let inside = region
            .intersect(&self.metadata.dims.region())
            .ok_or_else(|| {
                VolError::OutOfBounds(format!(
                    "{} lies entirely outside the {} volume",
                    region, self.metadata.dims
                ))
            })?;

        let mut block = VoxelBlock::zeros(region.shape());
        let run_len = (inside.max[Z] - inside.min[Z]) as usize;
        let mut buf = vec![0u8; run_len * 2];
        let rz = (inside.min[Z] - region.min[Z]) as usize;

        // z is the fastest axis on disk, so each (y, x) column is one read
        for y in inside.min[Y]..inside.max[Y] {
            for x in inside.min[X]..inside.max[X] {
                let offset = self.voxel_offset(x as u64, y as u64, inside.min[Z] as u64);
                read_exact_at(&self.file, &mut buf, offset)?;

                let ry = (y - region.min[Y]) as usize;
                let rx = (x - region.min[X]) as usize;
                let mut column = block.slice_mut(s![ry, rx, rz..rz + run_len]);
                for (dst, pair) in column.iter_mut().zip(buf.chunks_exact(2)) {
                    *dst = Voxel::from_le_bytes([pair[0], pair[1]]);
                }
            }
        }
        Ok(block)
    }

    fn write_block(&mut self, offset: [u64; 3], block: &VoxelBlock) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(VolError::Configuration(format!(
                "store {} is open read-only",
                self.path.display()
            )));
        }

        let target = block_region(offset, block)?;
        if !self.metadata.dims.region().contains_region(&target) {
            return Err(VolError::OutOfBounds(format!(
                "write of {} exceeds the {} volume",
                target, self.metadata.dims
            )));
        }

        let (h, w, d) = block.dim();
        let mut buf = Vec::with_capacity(d * 2);
        for y in 0..h {
            for x in 0..w {
                buf.clear();
                voxels_to_le_bytes(block.slice(s![y, x, ..]).iter().copied(), &mut buf);
                let pos = self.voxel_offset(offset[X] + x as u64, offset[Y] + y as u64, offset[Z]);
                write_all_at(&self.file, &buf, pos)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.mode == AccessMode::Write {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Dense in-memory volume, mainly a test double
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    dims: VolumeDims,
    data: Array3<Voxel>,
}

impl MemoryVolume {
    pub fn new(dims: VolumeDims) -> Self {
        let data = Array3::zeros((
            dims.height as usize,
            dims.width as usize,
            dims.depth as usize,
        ));
        Self { dims, data }
    }

    /// Voxel at (x, y, z)
    pub fn get(&self, x: usize, y: usize, z: usize) -> Voxel {
        self.data[[y, x, z]]
    }
}

impl VoxelStore for MemoryVolume {
    fn bounds(&self) -> VolumeDims {
        self.dims
    }

    fn read_block(&self, region: &Region) -> Result<VoxelBlock> {
        let inside = region.intersect(&self.dims.region()).ok_or_else(|| {
            VolError::OutOfBounds(format!(
                "{} lies entirely outside the {} volume",
                region, self.dims
            ))
        })?;

        let mut block = VoxelBlock::zeros(region.shape());
        let rel = |axis: usize, v: i64| (v - region.min[axis]) as usize;
        block
            .slice_mut(s![
                rel(Y, inside.min[Y])..rel(Y, inside.max[Y]),
                rel(X, inside.min[X])..rel(X, inside.max[X]),
                rel(Z, inside.min[Z])..rel(Z, inside.max[Z])
            ])
            .assign(&self.data.slice(s![
                inside.min[Y] as usize..inside.max[Y] as usize,
                inside.min[X] as usize..inside.max[X] as usize,
                inside.min[Z] as usize..inside.max[Z] as usize
            ]));
        Ok(block)
    }

    fn write_block(&mut self, offset: [u64; 3], block: &VoxelBlock) -> Result<()> {
        let target = block_region(offset, block)?;
        if !self.dims.region().contains_region(&target) {
            return Err(VolError::OutOfBounds(format!(
                "write of {} exceeds the {} volume",
                target, self.dims
            )));
        }
        self.data
            .slice_mut(s![
                target.min[Y] as usize..target.max[Y] as usize,
                target.min[X] as usize..target.max[X] as usize,
                target.min[Z] as usize..target.max[Z] as usize
            ])
            .assign(block);
        Ok(())
    }
}

/// Region covered by `block` placed at `offset`
fn block_region(offset: [u64; 3], block: &VoxelBlock) -> Result<Region> {
    let (h, w, d) = block.dim();
    let min = [offset[X] as i64, offset[Y] as i64, offset[Z] as i64];
    Region::new(min, [min[X] + w as i64, min[Y] + h as i64, min[Z] + d as i64])
}

fn lock(file: &File, path: &Path, mode: AccessMode) -> Result<()> {
    let result = match mode {
        AccessMode::Write => FileExt::try_lock_exclusive(file),
        AccessMode::Read => FileExt::try_lock_shared(file),
    };
    result.map_err(|e| {
        VolError::StoreContention(format!(
            "cannot open {} for {}: another process holds it open ({})",
            path.display(),
            match mode {
                AccessMode::Write => "writing",
                AccessMode::Read => "reading",
            },
            e
        ))
    })
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dims() -> VolumeDims {
        VolumeDims::new(40, 30, 20).unwrap()
    }

    fn pattern(h: usize, w: usize, d: usize, seed: u16) -> VoxelBlock {
        VoxelBlock::from_shape_fn((h, w, d), |(y, x, z)| {
            seed.wrapping_add((y * 7 + x * 3 + z) as u16) | 1
        })
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let mut store = SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap();

        let block = pattern(5, 6, 7, 100);
        store.write_block([10, 3, 4], &block).unwrap();

        let region = Region::new([10, 3, 4], [16, 8, 11]).unwrap();
        assert_eq!(store.read_block(&region).unwrap(), block);
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let store = SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap();

        let region = Region::new([0, 0, 0], [8, 9, 10]).unwrap();
        let block = store.read_block(&region).unwrap();
        assert_eq!(block.dim(), (9, 8, 10));
        assert!(block.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_read_clips_at_volume_edge() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let mut store = SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap();
        store.write_block([38, 28, 18], &pattern(2, 2, 2, 5)).unwrap();

        let region = Region::new([38, 28, 18], [42, 32, 22]).unwrap();
        let block = store.read_block(&region).unwrap();
        assert_eq!(block.dim(), (4, 4, 4));
        assert_eq!(block[[1, 1, 1]], pattern(2, 2, 2, 5)[[1, 1, 1]]);
        assert_eq!(block[[2, 0, 0]], 0);
        assert_eq!(block[[0, 0, 3]], 0);

        let outside = Region::new([40, 0, 0], [50, 5, 5]).unwrap();
        assert!(matches!(
            store.read_block(&outside),
            Err(VolError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_write_outside_volume_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let mut store = SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap();
        let err = store.write_block([39, 0, 0], &pattern(1, 2, 1, 0)).unwrap_err();
        assert!(matches!(err, VolError::OutOfBounds(_)));
    }

    #[test]
    fn test_reopen_preserves_data_and_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let metadata = StoreMetadata::new(dims()).with_metadata("scan", "test");
        let block = pattern(3, 3, 3, 42);
        {
            let mut store = SparseVolumeStore::create(&path, metadata.clone()).unwrap();
            store.write_block([1, 2, 3], &block).unwrap();
            store.flush().unwrap();
        }

        let store = SparseVolumeStore::open_read(&path).unwrap();
        assert_eq!(store.metadata(), &metadata);
        assert_eq!(store.mode(), AccessMode::Read);
        let region = Region::new([1, 2, 3], [4, 5, 6]).unwrap();
        assert_eq!(store.read_block(&region).unwrap(), block);
    }

    #[test]
    fn test_writer_excludes_readers_and_writers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let writer = SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap();

        assert!(matches!(
            SparseVolumeStore::open_read(&path),
            Err(VolError::StoreContention(_))
        ));
        assert!(matches!(
            SparseVolumeStore::open_write(&path),
            Err(VolError::StoreContention(_))
        ));
        drop(writer);

        let reader = SparseVolumeStore::open_read(&path).unwrap();
        let second_reader = SparseVolumeStore::open_read(&path).unwrap();
        assert!(matches!(
            SparseVolumeStore::open_write(&path),
            Err(VolError::StoreContention(_))
        ));
        drop(reader);
        drop(second_reader);

        assert!(SparseVolumeStore::open_write(&path).is_ok());
    }

    #[test]
    fn test_read_handle_cannot_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        drop(SparseVolumeStore::create(&path, StoreMetadata::new(dims())).unwrap());

        let mut reader = SparseVolumeStore::open_read(&path).unwrap();
        assert!(reader.write_block([0, 0, 0], &pattern(1, 1, 1, 0)).is_err());
    }

    #[test]
    fn test_open_or_create() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");

        assert!(matches!(
            SparseVolumeStore::open_or_create(&path, None),
            Err(VolError::Configuration(_))
        ));
        drop(SparseVolumeStore::open_or_create(&path, Some(dims())).unwrap());
        drop(SparseVolumeStore::open_or_create(&path, None).unwrap());

        let other = VolumeDims::new(1, 2, 3).unwrap();
        assert!(matches!(
            SparseVolumeStore::open_or_create(&path, Some(other)),
            Err(VolError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("not-a-store");
        std::fs::write(&path, b"GIF89a........").unwrap();
        assert!(matches!(
            SparseVolumeStore::open_read(&path),
            Err(VolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_oversized_header_length_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.vgs");
        let mut bytes = STORE_MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.resize(8192, 0);
        std::fs::write(&path, bytes).unwrap();

        let err = SparseVolumeStore::open_read(&path).unwrap_err();
        assert!(matches!(err, VolError::InvalidFormat(_)));
        assert!(err.to_string().contains("header length"));
    }

    #[test]
    fn test_oversized_metadata_refused_at_create() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scan.vgs");
        let metadata = StoreMetadata::new(dims()).with_metadata("notes", "x".repeat(8000));
        assert!(matches!(
            SparseVolumeStore::create(&path, metadata),
            Err(VolError::Metadata(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_memory_volume_matches_contract() {
        let mut volume = MemoryVolume::new(dims());
        let block = pattern(2, 3, 4, 9);
        volume.write_block([37, 0, 16], &block).unwrap();
        assert_eq!(volume.get(37, 0, 16), block[[0, 0, 0]]);

        let region = Region::new([36, -1, 16], [41, 2, 20]).unwrap();
        let read = volume.read_block(&region).unwrap();
        assert_eq!(read.dim(), (3, 5, 4));
        assert_eq!(read[[1, 1, 0]], block[[0, 0, 0]]);
        assert_eq!(read[[0, 1, 0]], 0);
        assert_eq!(read[[1, 4, 0]], 0);
    }
}
