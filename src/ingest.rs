//! Apply/ingest - writes staged cell payloads into the volume store

use crate::decode::CellDecoder;
use crate::error::{Result, VolError};
use crate::grid::CellGrid;
use crate::staging::{StagingArea, StagingState};
use crate::store::VoxelStore;
use crate::types::{CellIndex, Region, X, Y, Z};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one cell during apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellApply {
    /// Payload decoded, written and emptied
    Applied,
    /// Payload was already emptied by an earlier run
    AlreadyApplied,
    /// Nothing staged for this cell
    NotStaged,
}

/// Outcome of applying a set of cells
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<CellIndex>,
    pub already_applied: Vec<CellIndex>,
    pub not_staged: Vec<CellIndex>,
    /// Cells that failed; their payloads stay pending for a later run
    pub failed: Vec<(CellIndex, VolError)>,
}

impl ApplyReport {
    /// Total number of cells considered
    pub fn total(&self) -> usize {
        self.applied.len() + self.already_applied.len() + self.not_staged.len() + self.failed.len()
    }

    /// True when no cell failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cells: {} applied, {} already applied, {} not staged, {} failed",
            self.total(),
            self.applied.len(),
            self.already_applied.len(),
            self.not_staged.len(),
            self.failed.len()
        )
    }

    fn record(&mut self, cell: CellIndex, result: Result<CellApply>) {
        match result {
            Ok(CellApply::Applied) => self.applied.push(cell),
            Ok(CellApply::AlreadyApplied) => self.already_applied.push(cell),
            Ok(CellApply::NotStaged) => self.not_staged.push(cell),
            Err(e) => self.failed.push((cell, e)),
        }
    }
}

/// Writes staged payloads into a store.
///
/// The engine must be the store's only writer for its whole run, and no
/// reader may hold the store open meanwhile.
pub struct IngestEngine<S: VoxelStore> {
    store: S,
    staging: StagingArea,
    grid: CellGrid,
    decoder: Box<dyn CellDecoder>,
}

impl<S: VoxelStore> IngestEngine<S> {
    /// Create an engine; the grid is laid over the store's own dimensions
    pub fn new(
        store: S,
        staging: StagingArea,
        cell_size: u64,
        decoder: Box<dyn CellDecoder>,
    ) -> Result<Self> {
        let grid = CellGrid::new(cell_size, store.bounds())?;
        Ok(Self {
            store,
            staging,
            grid,
            decoder,
        })
    }

    /// The cell grid in use
    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    /// The staging area payloads are read from
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Borrow the underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give back the store, releasing write access when it drops
    pub fn into_store(self) -> S {
        self.store
    }

    /// Apply every staged cell covering `roi`.
    ///
    /// Only a malformed ROI fails the call; per-cell failures are collected
    /// in the report and the remaining cells are still attempted.
    pub fn apply(&mut self, roi: &Region) -> Result<ApplyReport> {
        let cells = self.grid.cells_covering(roi)?;
        info!(roi = %roi, cells = cells.len(), "applying region");
        Ok(self.apply_cells(&cells))
    }

    /// Apply the given cells in order
    pub fn apply_cells(&mut self, cells: &[CellIndex]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (i, &cell) in cells.iter().enumerate() {
            let result = self.apply_cell(cell);
            if let Err(e) = &result {
                warn!(%cell, error = %e, "cell not applied, payload left pending");
            } else {
                debug!(%cell, progress = i + 1, total = cells.len(), "cell done");
            }
            report.record(cell, result);
        }
        info!("{}", report.summary());
        report
    }

    /// Apply a single cell.
    ///
    /// The payload is emptied only after the voxels are written and flushed,
    /// so a failure or crash anywhere before that leaves it pending.
    pub fn apply_cell(&mut self, cell: CellIndex) -> Result<CellApply> {
        match self.staging.state(cell)? {
            StagingState::Absent => return Ok(CellApply::NotStaged),
            StagingState::Applied => {
                debug!(%cell, "already applied, skipping");
                return Ok(CellApply::AlreadyApplied);
            }
            StagingState::Pending => {}
        }

        let start = Instant::now();
        let bounds = self.grid.cell_bounds(cell)?;
        let payload = self.staging.read_payload(cell)?;
        let block = self
            .decoder
            .decode(&payload, &bounds, self.grid.cell_size)?;

        let offset = [
            bounds.min[X] as u64,
            bounds.min[Y] as u64,
            bounds.min[Z] as u64,
        ];
        self.store.write_block(offset, &block)?;
        self.store.flush()?;
        self.staging.mark_applied(cell)?;

        info!(
            %cell,
            bounds = %bounds,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "applied"
        );
        Ok(CellApply::Applied)
    }
}
