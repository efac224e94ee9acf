use clap::Parser;
use std::path::PathBuf;

use crate::error::{FragmapError, Result};
use crate::viewport::{ViewportCalculator, DEFAULT_CLUSTER_SIZE};

#[derive(Parser, Debug)]
#[command(name = "fragmap", about = "Map of block allocation and fragmentation on a filesystem")]
pub struct Cli {
    /// Directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Load extents from a JSON snapshot instead of scanning
    #[arg(long, value_name = "FILE", conflicts_with = "watch")]
    pub snapshot: Option<PathBuf>,

    /// Write the scanned extents to a JSON snapshot
    #[arg(long, value_name = "FILE")]
    pub save_snapshot: Option<PathBuf>,

    /// Initial blocks per cluster
    #[arg(long, default_value_t = DEFAULT_CLUSTER_SIZE)]
    pub cluster_size: u64,

    /// Size of one map cell in display units
    #[arg(long, default_value_t = 1)]
    pub cell_size: u32,

    /// Width reserved for the scrollbar when the map does not fit
    #[arg(long, default_value_t = 1)]
    pub scrollbar_width: u32,

    /// Keep the map live while files change
    #[arg(long)]
    pub watch: bool,

    /// Write logs to this file (filter with RUST_LOG)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Scan(PathBuf),
    Snapshot(PathBuf),
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct FragmapConfig {
    pub source: ModelSource,
    pub save_snapshot: Option<PathBuf>,
    pub cluster_size: u64,
    pub calculator: ViewportCalculator,
    pub watch: bool,
    pub log_file: Option<PathBuf>,
}

impl TryFrom<Cli> for FragmapConfig {
    type Error = FragmapError;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.cluster_size == 0 {
            return Err(FragmapError::Configuration(
                "--cluster-size must be at least 1".to_string(),
            ));
        }
        let calculator = ViewportCalculator::new(cli.cell_size, cli.scrollbar_width)?;
        let source = match cli.snapshot {
            Some(snapshot) => ModelSource::Snapshot(snapshot),
            None => ModelSource::Scan(cli.path),
        };
        Ok(Self {
            source,
            save_snapshot: cli.save_snapshot,
            cluster_size: cli.cluster_size,
            calculator,
            watch: cli.watch,
            log_file: cli.log_file,
        })
    }
}
