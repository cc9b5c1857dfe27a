//! Staging area for downloaded cell payloads
//!
//! One file per cell. The file's presence and length encode the cell's state:
//! absent (not fetched), non-empty (fetched, not applied) and empty
//! (applied). Emptied files are never deleted, so an applied cell is not
//! fetched again even after its payload bytes are gone.

use crate::error::{Result, VolError};
use crate::grid::CellGrid;
use crate::types::CellIndex;
use std::fs::{self as stdfs, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Suffix of in-flight transfer files
const PARTIAL_SUFFIX: &str = ".part";

/// Lifecycle state of a staged cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingState {
    /// Nothing fetched yet
    Absent,
    /// Complete payload on disk, waiting to be applied
    Pending,
    /// Payload applied to the store and emptied
    Applied,
}

/// Directory holding staged payloads
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Open an existing staging directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(VolError::Configuration(format!(
                "download directory {} does not exist or is not a directory",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// The staging directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a cell's payload file
    pub fn payload_path(&self, cell: CellIndex) -> PathBuf {
        self.dir.join(CellGrid::cell_file_name(cell))
    }

    fn partial_path(&self, cell: CellIndex) -> PathBuf {
        self.dir.join(format!(
            ".{}{}",
            CellGrid::cell_file_name(cell),
            PARTIAL_SUFFIX
        ))
    }

    /// Current state of a cell
    pub fn state(&self, cell: CellIndex) -> Result<StagingState> {
        let path = self.payload_path(cell);
        match stdfs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(if meta.len() == 0 {
                StagingState::Applied
            } else {
                StagingState::Pending
            }),
            Ok(_) => Err(VolError::Configuration(format!(
                "{} exists but is not a regular file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StagingState::Absent),
            Err(e) => Err(VolError::Io(e)),
        }
    }

    /// Atomically place a complete payload.
    ///
    /// Bytes go to a hidden partial file which is synced and then renamed over
    /// the final name, so a crash never leaves a truncated payload behind.
    pub async fn publish(&self, cell: CellIndex, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(VolError::InvalidFormat(format!(
                "refusing to stage an empty payload for cell {}",
                cell
            )));
        }

        let partial = self.partial_path(cell);
        let mut file = fs::File::create(&partial).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&partial, self.payload_path(cell)).await?;
        debug!(%cell, bytes = payload.len(), "payload staged");
        Ok(())
    }

    /// Read a pending payload
    pub fn read_payload(&self, cell: CellIndex) -> Result<Vec<u8>> {
        Ok(stdfs::read(self.payload_path(cell))?)
    }

    /// Empty a payload to record that it has been applied
    pub fn mark_applied(&self, cell: CellIndex) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.payload_path(cell))?;
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Forget a cell entirely so the next download fetches it again
    pub fn forget(&self, cell: CellIndex) -> Result<()> {
        match stdfs::remove_file(self.payload_path(cell)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolError::Io(e)),
        }
    }

    /// Remove partial files left by interrupted transfers
    pub fn clean_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in stdfs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                stdfs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "removed partial transfers");
        }
        Ok(removed)
    }
}
