//! Operator actions over a region of interest
//!
//! Ties the fetcher, the staging area and the ingest engine together and owns
//! the retry policy for transient transfer failures. Downloading never touches
//! the store, so it can run while a viewer holds the store open; applying needs
//! the store's write handle for the whole run.

use crate::config::VolgridConfig;
use crate::decode::get_decoder;
use crate::error::{Result, TransferFailureKind, VolError};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::grid::CellGrid;
use crate::ingest::{ApplyReport, IngestEngine};
use crate::source::CellSource;
use crate::staging::{StagingArea, StagingState};
use crate::store::VoxelStore;
use crate::types::{CellIndex, Region, VolumeDims};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a run does with the cells covering the ROI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stage payloads only
    Download,
    /// Write staged payloads into the store
    Apply,
    /// Download, then apply
    DownloadApply,
    /// Report each cell's staging state without transferring or writing
    DryRun,
}

impl Action {
    pub fn downloads(&self) -> bool {
        matches!(self, Action::Download | Action::DownloadApply)
    }

    pub fn applies(&self) -> bool {
        matches!(self, Action::Apply | Action::DownloadApply)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Download => write!(f, "download"),
            Action::Apply => write!(f, "apply"),
            Action::DownloadApply => write!(f, "download-apply"),
            Action::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Outcome of a download run
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<CellIndex>,
    pub bytes: u64,
    pub already_staged: Vec<CellIndex>,
    pub already_applied: Vec<CellIndex>,
    /// Cells still absent after the retry budget ran out, or not found
    pub failed: Vec<(CellIndex, VolError)>,
}

impl DownloadReport {
    pub fn total(&self) -> usize {
        self.downloaded.len()
            + self.already_staged.len()
            + self.already_applied.len()
            + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cells: {} downloaded ({}), {} already staged, {} already applied, {} failed",
            self.total(),
            self.downloaded.len(),
            crate::utils::format_bytes(self.bytes),
            self.already_staged.len(),
            self.already_applied.len(),
            self.failed.len()
        )
    }

    fn record(&mut self, cell: CellIndex, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Downloaded { bytes } => {
                self.downloaded.push(cell);
                self.bytes += bytes as u64;
            }
            FetchOutcome::AlreadyStaged => self.already_staged.push(cell),
            FetchOutcome::AlreadyApplied => self.already_applied.push(cell),
        }
    }
}

/// Staging state of every cell covering a region
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub absent: Vec<CellIndex>,
    pub pending: Vec<CellIndex>,
    pub applied: Vec<CellIndex>,
}

impl StatusReport {
    pub fn total(&self) -> usize {
        self.absent.len() + self.pending.len() + self.applied.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cells: {} not fetched, {} fetched not applied, {} applied",
            self.total(),
            self.absent.len(),
            self.pending.len(),
            self.applied.len()
        )
    }
}

/// Runs operator actions against one staging area
pub struct Pipeline {
    config: VolgridConfig,
    staging: StagingArea,
}

impl Pipeline {
    pub fn new(config: VolgridConfig, staging: StagingArea) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, staging })
    }

    pub fn config(&self) -> &VolgridConfig {
        &self.config
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Grid over `dims`, or over the ROI's own extent when the volume size is
    /// not known (download without a store)
    pub fn grid(&self, dims: Option<VolumeDims>, roi: &Region) -> Result<CellGrid> {
        let dims = match dims {
            Some(dims) => dims,
            None => {
                if roi.has_negative() {
                    return Err(VolError::InvalidRegion(format!(
                        "ROI {} has negative coordinates",
                        roi
                    )));
                }
                VolumeDims::new(roi.max[0] as u64, roi.max[1] as u64, roi.max[2] as u64)?
            }
        };
        CellGrid::new(self.config.cell_size, dims)
    }

    /// Classify every covering cell by its staging state
    pub fn status(&self, grid: &CellGrid, roi: &Region) -> Result<StatusReport> {
        let mut report = StatusReport::default();
        for cell in grid.cells_covering(roi)? {
            let state = self.staging.state(cell)?;
            debug!(%cell, ?state, "status");
            match state {
                StagingState::Absent => report.absent.push(cell),
                StagingState::Pending => report.pending.push(cell),
                StagingState::Applied => report.applied.push(cell),
            }
        }
        Ok(report)
    }

    /// Stage every covering cell.
    ///
    /// Transient failures are retried in rounds with linear backoff until
    /// the retry budget is spent. An authentication failure ends the run.
    pub async fn download(
        &self,
        source: Arc<dyn CellSource>,
        grid: &CellGrid,
        roi: &Region,
    ) -> Result<DownloadReport> {
        let cells = grid.cells_covering(roi)?;
        info!(roi = %roi, cells = cells.len(), from = %source.locate(""), "downloading region");

        let fetcher = Fetcher::new(source, self.staging.clone());
        let retry = &self.config.retry;
        let mut report = DownloadReport::default();
        let mut pending = cells;
        let mut attempt = 1;

        while !pending.is_empty() {
            let results = fetcher
                .fetch_all(&pending, self.config.max_concurrent_transfers)
                .await;
            let mut again = Vec::new();

            for (cell, result) in results {
                match result {
                    Ok(outcome) => report.record(cell, outcome),
                    Err(
                        e @ VolError::Transfer {
                            kind: TransferFailureKind::Authentication,
                            ..
                        },
                    ) => return Err(e),
                    Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                        warn!(%cell, attempt, error = %e, "transfer failed, will retry");
                        again.push(cell);
                    }
                    Err(e) => {
                        warn!(%cell, error = %e, "transfer failed");
                        report.failed.push((cell, e));
                    }
                }
            }

            if !again.is_empty() {
                let delay = retry.delay_for_attempt(attempt);
                debug!(cells = again.len(), delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            pending = again;
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Write every staged covering cell into `store`, then hand it back
    pub fn apply<S: VoxelStore>(&self, store: S, roi: &Region) -> Result<(ApplyReport, S)> {
        let decoder = get_decoder(self.config.payload_format);
        let mut engine =
            IngestEngine::new(store, self.staging.clone(), self.config.cell_size, decoder)?;
        let report = engine.apply(roi)?;
        Ok((report, engine.into_store()))
    }

    /// Download then apply.
    ///
    /// The caller opens the store first so contention is reported before any
    /// transfer starts.
    pub async fn download_apply<S: VoxelStore>(
        &self,
        source: Arc<dyn CellSource>,
        store: S,
        roi: &Region,
    ) -> Result<(DownloadReport, ApplyReport, S)> {
        let grid = CellGrid::new(self.config.cell_size, store.bounds())?;
        let downloaded = self.download(source, &grid, roi).await?;
        let (applied, store) = self.apply(store, roi)?;
        Ok((downloaded, applied, store))
    }
}
