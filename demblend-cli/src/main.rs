use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use demblend::{Mosaic, MosaicConfig};

/// Mosaic and blend DEMs, writing the result as GeoTIFF tiles
#[derive(Parser)]
#[command(name = "demblend")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input DEM files to mosaic
    dem_files: Vec<PathBuf>,

    /// Text file listing the DEM files to mosaic, one per line
    #[arg(short = 'l', long)]
    dem_list_file: Option<PathBuf>,

    /// Output prefix; tiles are written as <prefix>-tile-<index>.tif
    #[arg(short = 'o', long, required = true)]
    output_prefix: String,

    /// Maximum size of output DEM tiles, in pixels
    #[arg(long, default_value_t = 1_000_000)]
    tile_size: i64,

    /// Index of the single tile to save (starting from zero); default saves
    /// all tiles
    #[arg(long)]
    tile_index: Option<i64>,

    /// Erode input DEMs by this many pixels at boundary and hole edges
    /// before mosaicking them
    #[arg(long, default_value_t = 0)]
    erode_length: i64,

    /// Larger values (in input DEM pixels) may give smoother blending while
    /// using more memory and compute time
    #[arg(long, default_value_t = 200)]
    blending_length: i64,

    /// Output DEM resolution in target georeferenced units per pixel;
    /// default is the first DEM's resolution
    #[arg(long)]
    tr: Option<f64>,

    /// Output DEM resolution in meters per pixel
    #[arg(long, conflicts_with = "tr")]
    mpp: Option<f64>,

    /// Target projection as a PROJ.4 string; default is the first DEM's
    #[arg(long = "t_srs")]
    target_srs: Option<String>,

    /// Tile size in georeferenced (projected) units, e.g. degrees or meters
    #[arg(long)]
    georef_tile_size: Option<f64>,

    /// No-data value to use on output; default is the first DEM's
    #[arg(long)]
    output_nodata_value: Option<f64>,

    /// Put the DEMs together without blending them (the result is less
    /// smooth)
    #[arg(long)]
    draft_mode: bool,

    /// Number of threads to use
    #[arg(long, default_value_t = default_threads())]
    threads: usize,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve the input list: either the list file or the positional paths,
/// never both.
fn resolve_dem_files(cli: &Cli) -> Result<Vec<PathBuf>> {
    match &cli.dem_list_file {
        Some(list) => {
            if !cli.dem_files.is_empty() {
                bail!(
                    "The DEMs were specified via a list. There were however \
                     extraneous files or options passed in."
                );
            }
            let text = fs::read_to_string(list)
                .with_context(|| format!("Failed to read DEM list {}", list.display()))?;
            let files: Vec<PathBuf> = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect();
            if files.is_empty() {
                bail!("No DEM files to mosaic.");
            }
            Ok(files)
        }
        None => {
            if cli.dem_files.is_empty() {
                bail!("No input DEMs were specified.");
            }
            Ok(cli.dem_files.clone())
        }
    }
}

/// Create the directory part of the output prefix, if any.
fn create_output_dir(prefix: &str) -> Result<()> {
    if let Some(parent) = PathBuf::from(prefix).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let dem_files = resolve_dem_files(&cli)?;
    create_output_dir(&cli.output_prefix)?;

    let config = MosaicConfig {
        dem_files,
        output_prefix: cli.output_prefix.clone(),
        tile_size: cli.tile_size,
        tile_index: cli.tile_index,
        erode_len: cli.erode_length,
        blending_len: cli.blending_length,
        draft_mode: cli.draft_mode,
        tr: cli.tr,
        mpp: cli.mpp,
        target_srs: cli.target_srs.clone(),
        geo_tile_size: cli.georef_tile_size,
        out_nodata: cli.output_nodata_value,
        threads: cli.threads,
    };
    config.validate().map_err(anyhow::Error::from)?;

    println!("Reading the input DEMs.");
    let bar = ProgressBar::new(config.dem_files.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let mosaic = Mosaic::open_with_progress(&config, |done, _| {
        bar.set_position(done as u64);
    })
    .context("Failed to open the input DEMs")?;
    bar.finish_and_clear();

    println!("Using output no-data value: {}", mosaic.out_nodata());
    println!(
        "The size of the mosaic is {} x {} pixels.",
        mosaic.cols(),
        mosaic.rows()
    );
    let layout = mosaic.layout();
    println!(
        "Number of tiles: {} x {} = {}",
        layout.num_tiles_x,
        layout.num_tiles_y,
        layout.num_tiles()
    );

    if let Some(idx) = cli.tile_index {
        if idx >= layout.num_tiles() {
            println!("Tile with index: {idx} is out of bounds.");
            return Ok(());
        }
    }

    let written = mosaic.run().context("Mosaicking failed")?;
    for path in &written {
        println!("Writing: {}", path.display());
    }

    Ok(())
}
