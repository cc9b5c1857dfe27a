use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use volgrid::grid::CellGrid;
use volgrid::pipeline::{Action, DownloadReport, StatusReport};
use volgrid::source::{create_cell_source, CellSource};
use volgrid::types::parse_point;
use volgrid::{
    ApplyReport, Credentials, PayloadFormat, Pipeline, Region, SparseVolumeStore, StagingArea,
    VolgridConfig, VolumeDims, WindowedCache,
};

#[derive(Parser)]
#[command(
    name = "volgrid",
    version,
    about = "Ingest grid-cell scan volumes into a sparse local store and inspect them"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Side length of a remote grid cell (overrides the config file)
    #[arg(long, global = true)]
    cell_size: Option<u64>,
    /// Payload encoding: tiff, raw, raw-deflate or raw-zstd
    #[arg(long, global = true)]
    payload_format: Option<PayloadFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RegionArgs {
    /// Directory holding staged cell payloads
    #[arg(long)]
    download_dir: PathBuf,
    /// Region of interest as x0-x1,y0-y1,z0-z1
    #[arg(long)]
    roi_xyz: Region,
    /// Full volume size as W,H,D (needed to create a store)
    #[arg(long)]
    volume_size_xyz: Option<VolumeDims>,
}

#[derive(Args)]
struct SourceArgs {
    /// Base URL (or directory) the grid cells are published under
    #[arg(long)]
    url: String,
    /// Basic-auth credentials as USERNAME:PASSWORD
    #[arg(long, env = "VOLGRID_AUTH", hide_env_values = true)]
    auth: Option<Credentials>,
    /// Transfers in flight at once (overrides the config file)
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Stage the cells covering the ROI; never touches the store
    Download {
        #[command(flatten)]
        region: RegionArgs,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Write staged cells covering the ROI into the store
    Apply {
        #[command(flatten)]
        region: RegionArgs,
        /// Store file
        #[arg(long)]
        store: PathBuf,
    },
    /// Download, then apply
    DownloadApply {
        #[command(flatten)]
        region: RegionArgs,
        #[command(flatten)]
        source: SourceArgs,
        /// Store file
        #[arg(long)]
        store: PathBuf,
    },
    /// List each covering cell's staging state without transferring or writing
    #[command(alias = "dummy")]
    DryRun {
        #[command(flatten)]
        region: RegionArgs,
    },
    /// Count covering cells per staging state
    Status {
        #[command(flatten)]
        region: RegionArgs,
    },
    /// Print a store's metadata
    Info {
        /// Store file
        #[arg(long)]
        store: PathBuf,
    },
    /// Load a window and report the intensity at its centre
    Probe {
        /// Store file
        #[arg(long)]
        store: PathBuf,
        /// Window centre as X,Y,Z
        #[arg(long, value_parser = parse_point)]
        center: [i64; 3],
        /// Window side length (overrides the config file)
        #[arg(long)]
        window_size: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<VolgridConfig> {
    let mut config = match &cli.config {
        Some(path) => VolgridConfig::from_file(path)?,
        None => VolgridConfig::default(),
    };
    if let Some(cell_size) = cli.cell_size {
        config.cell_size = cell_size;
    }
    if let Some(format) = cli.payload_format {
        config.payload_format = format;
    }
    config.validate()?;
    Ok(config)
}

fn open_pipeline(config: &VolgridConfig, region: &RegionArgs) -> anyhow::Result<Pipeline> {
    let staging = StagingArea::open(&region.download_dir)?;
    let removed = staging.clean_partials()?;
    if removed > 0 {
        info!(removed, "removed interrupted partial downloads");
    }
    Ok(Pipeline::new(config.clone(), staging)?)
}

fn open_source(config: &mut VolgridConfig, args: SourceArgs) -> anyhow::Result<Arc<dyn CellSource>> {
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_transfers = max;
    }
    let source = create_cell_source(&args.url, args.auth, config.request_timeout())
        .with_context(|| format!("cannot use source {}", args.url))?;
    Ok(Arc::from(source))
}

fn print_status(report: &StatusReport, verbose: bool) {
    if verbose {
        for cell in &report.absent {
            println!("{}  {}  not fetched", cell, CellGrid::cell_file_name(*cell));
        }
        for cell in &report.pending {
            println!("{}  {}  fetched, not applied", cell, CellGrid::cell_file_name(*cell));
        }
        for cell in &report.applied {
            println!("{}  {}  applied", cell, CellGrid::cell_file_name(*cell));
        }
    }
    println!("{}", report.summary());
}

fn check_download(report: &DownloadReport) -> anyhow::Result<()> {
    for (cell, e) in &report.failed {
        warn!(%cell, error = %e, "not downloaded");
    }
    if !report.is_clean() {
        bail!("{} cells could not be downloaded; re-run to resume", report.failed.len());
    }
    Ok(())
}

fn check_apply(report: &ApplyReport) -> anyhow::Result<()> {
    if !report.is_clean() {
        bail!("{} cells could not be applied; re-run to resume", report.failed.len());
    }
    Ok(())
}

async fn run_action(
    mut config: VolgridConfig,
    action: Action,
    region: RegionArgs,
    source: Option<SourceArgs>,
    store: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!(%action, roi = %region.roi_xyz, "starting");
    let source = match source {
        Some(args) if action.downloads() => Some(open_source(&mut config, args)?),
        _ => None,
    };
    let pipeline = open_pipeline(&config, &region)?;
    let roi = region.roi_xyz;

    // Opened before any transfer so contention surfaces immediately
    let store = match store {
        Some(path) if action.applies() => Some(SparseVolumeStore::open_or_create(
            &path,
            region.volume_size_xyz,
        )?),
        _ => None,
    };

    match (source, store) {
        (Some(source), Some(store)) => {
            let (downloaded, applied, store) = pipeline.download_apply(source, store, &roi).await?;
            println!("{}", downloaded.summary());
            println!("{}", applied.summary());
            info!("{}", store.summary()?);
            check_download(&downloaded)?;
            check_apply(&applied)?;
        }
        (Some(source), None) => {
            let grid = pipeline.grid(region.volume_size_xyz, &roi)?;
            let report = pipeline.download(source, &grid, &roi).await?;
            println!("{}", report.summary());
            check_download(&report)?;
        }
        (None, Some(store)) => {
            let (report, store) = pipeline.apply(store, &roi)?;
            println!("{}", report.summary());
            info!("{}", store.summary()?);
            check_apply(&report)?;
        }
        (None, None) => {
            let grid = pipeline.grid(region.volume_size_xyz, &roi)?;
            print_status(&pipeline.status(&grid, &roi)?, action == Action::DryRun);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("volgrid=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Download { region, source } => {
            run_action(config, Action::Download, region, Some(source), None).await?;
        }
        Command::Apply { region, store } => {
            run_action(config, Action::Apply, region, None, Some(store)).await?;
        }
        Command::DownloadApply {
            region,
            source,
            store,
        } => {
            run_action(config, Action::DownloadApply, region, Some(source), Some(store)).await?;
        }
        Command::DryRun { region } => {
            run_action(config, Action::DryRun, region, None, None).await?;
        }
        Command::Status { region } => {
            let pipeline = open_pipeline(&config, &region)?;
            let grid = pipeline.grid(region.volume_size_xyz, &region.roi_xyz)?;
            print_status(&pipeline.status(&grid, &region.roi_xyz)?, false);
        }
        Command::Info { store } => {
            let store = SparseVolumeStore::open_read(&store)?;
            println!("{}", store.summary()?);
            for (key, value) in &store.metadata().custom_metadata {
                println!("  {}: {}", key, value);
            }
        }
        Command::Probe {
            store,
            center,
            window_size,
        } => {
            let store = SparseVolumeStore::open_read(&store)?;
            let mut cache = WindowedCache::new(store, window_size.unwrap_or(config.window_size))?;
            let window = cache.load(center)?;
            let [x, y, z] = center;
            let value = window.sample(x, y, z)?;
            println!("window {}", window.bounds());
            println!(
                "intensity at ({}, {}, {}): {} (display {})",
                x,
                y,
                z,
                value,
                config.display.map(value)
            );
        }
    }

    Ok(())
}
