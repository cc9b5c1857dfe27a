//! Cell transfer - downloads cell payloads into the staging area

use crate::error::{Result, TransferFailureKind, VolError};
use crate::grid::CellGrid;
use crate::source::CellSource;
use crate::staging::{StagingArea, StagingState};
use crate::types::CellIndex;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of fetching one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Payload transferred and staged
    Downloaded { bytes: usize },
    /// A complete payload was already staged
    AlreadyStaged,
    /// The cell was already applied; its emptied payload blocks re-download
    AlreadyApplied,
}

/// Downloads cells from a source into a staging area.
///
/// Performs no retries: a failed fetch leaves the cell absent and the caller
/// decides whether to try again.
pub struct Fetcher {
    source: Arc<dyn CellSource>,
    staging: StagingArea,
}

impl Fetcher {
    /// Create a fetcher
    pub fn new(source: Arc<dyn CellSource>, staging: StagingArea) -> Self {
        Self { source, staging }
    }

    /// The staging area payloads land in
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Ensure a complete payload for `cell` is staged (or was applied)
    pub async fn fetch(&self, cell: CellIndex) -> Result<FetchOutcome> {
        match self.staging.state(cell)? {
            StagingState::Pending => {
                debug!(%cell, "payload already staged, not downloading");
                return Ok(FetchOutcome::AlreadyStaged);
            }
            StagingState::Applied => {
                debug!(%cell, "cell already applied, not downloading");
                return Ok(FetchOutcome::AlreadyApplied);
            }
            StagingState::Absent => {}
        }

        let name = CellGrid::cell_file_name(cell);
        let start = Instant::now();
        debug!(%cell, from = %self.source.locate(&name), "downloading");

        let payload = self.source.fetch(cell, &name).await?;
        if payload.is_empty() {
            return Err(VolError::transfer(
                cell,
                TransferFailureKind::Transient,
                "source returned an empty payload",
            ));
        }

        self.staging.publish(cell, &payload).await?;
        info!(
            %cell,
            bytes = payload.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "downloaded"
        );
        Ok(FetchOutcome::Downloaded {
            bytes: payload.len(),
        })
    }

    /// Fetch many cells with at most `max_concurrent` transfers in flight.
    ///
    /// Every cell is attempted; results come back in the order given.
    pub async fn fetch_all(
        &self,
        cells: &[CellIndex],
        max_concurrent: usize,
    ) -> Vec<(CellIndex, Result<FetchOutcome>)> {
        let mut results: Vec<(usize, CellIndex, Result<FetchOutcome>)> =
            stream::iter(cells.iter().copied().enumerate())
                .map(|(i, cell)| async move { (i, cell, self.fetch(cell).await) })
                .buffer_unordered(max_concurrent.max(1))
                .collect()
                .await;

        results.sort_by_key(|(i, _, _)| *i);
        results
            .into_iter()
            .map(|(_, cell, result)| (cell, result))
            .collect()
    }
}
