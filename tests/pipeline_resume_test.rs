//! End-to-end ingest tests against a real store file and staging directory

use std::sync::Arc;
use tempfile::TempDir;
use volgrid::decode::{encode_tiff_cell, TiffCellDecoder};
use volgrid::source::{FileSystemCellSource, MemoryCellSource};
use volgrid::{
    CellGrid, CellIndex, IngestEngine, Pipeline, Region, SparseVolumeStore, StagingArea,
    StagingState, VolgridConfig, VolumeDims, VoxelBlock, VoxelStore,
};

const CELL: u64 = 10;

fn voxel_value(x: i64, y: i64, z: i64) -> u16 {
    (1 + x + 20 * y + 400 * z) as u16
}

fn cell_payload(grid: &CellGrid, cell: CellIndex) -> Vec<u8> {
    let bounds = grid.cell_bounds(cell).unwrap();
    let block = VoxelBlock::from_shape_fn(bounds.shape(), |(y, x, z)| {
        voxel_value(
            bounds.min[0] + x as i64,
            bounds.min[1] + y as i64,
            bounds.min[2] + z as i64,
        )
    });
    encode_tiff_cell(&block).unwrap()
}

fn config() -> VolgridConfig {
    VolgridConfig {
        cell_size: CELL,
        ..VolgridConfig::default()
    }
}

#[test]
fn test_interrupted_apply_resumes_remaining_cells() {
    let temp_dir = TempDir::new().unwrap();
    let staging_dir = temp_dir.path().join("cells");
    std::fs::create_dir(&staging_dir).unwrap();
    let store_path = temp_dir.path().join("scan.vgs");

    let dims = VolumeDims::new(20, 20, 20).unwrap();
    let grid = CellGrid::new(CELL, dims).unwrap();
    let roi = Region::new([0, 0, 0], [20, 20, 20]).unwrap();
    let cells = grid.cells_covering(&roi).unwrap();
    assert_eq!(cells.len(), 8);

    let staging = StagingArea::open(&staging_dir).unwrap();
    for &cell in &cells {
        std::fs::write(staging.payload_path(cell), cell_payload(&grid, cell)).unwrap();
    }

    // First run dies after two cells
    {
        let store = SparseVolumeStore::create(&store_path, volgrid::StoreMetadata::new(dims)).unwrap();
        let mut engine =
            IngestEngine::new(store, staging.clone(), CELL, Box::new(TiffCellDecoder)).unwrap();
        let report = engine.apply_cells(&cells[..2]);
        assert_eq!(report.applied.len(), 2);
    }
    let first_two: Vec<_> = cells[..2]
        .iter()
        .map(|&c| {
            let store = SparseVolumeStore::open_read(&store_path).unwrap();
            store.read_block(&grid.cell_bounds(c).unwrap()).unwrap()
        })
        .collect();

    // Resume over the same ROI
    let pipeline = Pipeline::new(config(), staging.clone()).unwrap();
    let store = SparseVolumeStore::open_or_create(&store_path, None).unwrap();
    let (report, store) = pipeline.apply(store, &roi).unwrap();
    assert_eq!(report.applied, cells[2..].to_vec());
    assert_eq!(report.already_applied, cells[..2].to_vec());
    assert!(report.is_clean());

    for (i, &cell) in cells[..2].iter().enumerate() {
        assert_eq!(
            store.read_block(&grid.cell_bounds(cell).unwrap()).unwrap(),
            first_two[i]
        );
    }
    let all = store.read_block(&roi).unwrap();
    for &(x, y, z) in &[(0, 0, 0), (19, 0, 0), (5, 17, 3), (19, 19, 19)] {
        assert_eq!(all[[y, x, z]], voxel_value(x as i64, y as i64, z as i64));
    }
    for &cell in &cells {
        assert_eq!(staging.state(cell).unwrap(), StagingState::Applied);
    }
}

#[test]
fn test_apply_refused_while_viewer_holds_store() {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("scan.vgs");
    let dims = VolumeDims::new(10, 10, 10).unwrap();
    drop(SparseVolumeStore::open_or_create(&store_path, Some(dims)).unwrap());

    let viewer = SparseVolumeStore::open_read(&store_path).unwrap();
    assert!(matches!(
        SparseVolumeStore::open_or_create(&store_path, None),
        Err(volgrid::VolError::StoreContention(_))
    ));
    drop(viewer);
    assert!(SparseVolumeStore::open_or_create(&store_path, None).is_ok());
}

#[tokio::test]
async fn test_download_while_viewer_reads_then_apply() {
    let temp_dir = TempDir::new().unwrap();
    let staging_dir = temp_dir.path().join("cells");
    std::fs::create_dir(&staging_dir).unwrap();
    let store_path = temp_dir.path().join("scan.vgs");

    let dims = VolumeDims::new(20, 10, 10).unwrap();
    let grid = CellGrid::new(CELL, dims).unwrap();
    let source = Arc::new(MemoryCellSource::new());
    for cell in grid.cells_covering(&dims.region()).unwrap() {
        source.insert(CellGrid::cell_file_name(cell), cell_payload(&grid, cell));
    }
    drop(SparseVolumeStore::open_or_create(&store_path, Some(dims)).unwrap());

    let pipeline = Pipeline::new(config(), StagingArea::open(&staging_dir).unwrap()).unwrap();
    let roi = dims.region();

    // Staging does not need the store, so a reader may stay open
    let viewer = SparseVolumeStore::open_read(&store_path).unwrap();
    let downloaded = pipeline.download(source.clone(), &grid, &roi).await.unwrap();
    assert_eq!(downloaded.downloaded.len(), 2);
    assert_eq!(viewer.read_block(&roi).unwrap().sum(), 0);
    drop(viewer);

    let store = SparseVolumeStore::open_write(&store_path).unwrap();
    let (applied, store) = pipeline.apply(store, &roi).unwrap();
    assert_eq!(applied.applied.len(), 2);
    let point = Region::point([15, 3, 7]);
    assert_eq!(store.read_block(&point).unwrap()[[0, 0, 0]], voxel_value(15, 3, 7));
}

#[tokio::test]
async fn test_file_system_source_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let remote = temp_dir.path().join("remote");
    let staging_dir = temp_dir.path().join("cells");
    std::fs::create_dir(&remote).unwrap();
    std::fs::create_dir(&staging_dir).unwrap();

    let dims = VolumeDims::new(10, 10, 15).unwrap();
    let grid = CellGrid::new(CELL, dims).unwrap();
    for cell in grid.cells_covering(&dims.region()).unwrap() {
        std::fs::write(
            remote.join(CellGrid::cell_file_name(cell)),
            cell_payload(&grid, cell),
        )
        .unwrap();
    }

    let pipeline = Pipeline::new(config(), StagingArea::open(&staging_dir).unwrap()).unwrap();
    let store = SparseVolumeStore::open_or_create(temp_dir.path().join("scan.vgs"), Some(dims)).unwrap();
    let (downloaded, applied, store) = pipeline
        .download_apply(Arc::new(FileSystemCellSource::new(&remote)), store, &dims.region())
        .await
        .unwrap();

    assert_eq!(downloaded.downloaded.len(), 2);
    assert_eq!(applied.applied.len(), 2);
    // Second cell along z is truncated to 5 slices
    let tail = Region::new([0, 0, 10], [10, 10, 15]).unwrap();
    let block = store.read_block(&tail).unwrap();
    assert_eq!(block.dim(), (10, 10, 5));
    assert_eq!(block[[9, 9, 4]], voxel_value(9, 9, 14));
}
