//! The mosaic driver and tile compositor.
//!
//! The driver runs `ReadSources -> ComputeExtent -> PartitionTiles ->
//! EvaluateTiles`. Sources and the mosaic output stay lazy throughout:
//! tiles evaluate one full-width row band at a time, each band's blocks
//! composed in parallel and the finished band handed straight to the strip
//! encoder. Peak memory is one band plus the per-block accumulators and
//! source windows, governed by the block and strip sizes rather than the
//! tile size.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{MosaicError, Result};
use crate::geom::{Point, PixelBox};
use crate::georef::{
    pixel_to_point_bbox, point_to_pixel_bbox_nogrow, snap_point_to_int, Georef, Projection,
};
use crate::raster::{DemReader, Grid, Source, SourceImage, WarpView};
use crate::weights::{compute_weights, WeightMode};
use crate::writer::write_geotiff_streamed;
use crate::TOL;

/// Output no-data when neither the user nor the first source provides one.
/// The most negative value a 32-bit float tile can carry.
pub const DEFAULT_NODATA: f64 = f32::MIN as f64;

/// Extra pixels of source context beyond erosion/blending reach: the
/// bilinear kernel radius plus one.
const INTERP_MARGIN: i64 = 2;

/// Authalic-sphere equatorial radius, meters. Converts --mpp to degrees on
/// geographic outputs.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Everything the driver needs for one run. Validated up front; fatal
/// configuration errors abort before any raster I/O.
#[derive(Debug, Clone)]
pub struct MosaicConfig {
    /// Input DEM paths, in processing order.
    pub dem_files: Vec<PathBuf>,
    /// Output prefix; tiles are written as `<prefix>-tile-<id>.tif`.
    pub output_prefix: String,
    /// Maximum output tile side, in pixels.
    pub tile_size: i64,
    /// Single tile to save; negative or absent saves all tiles.
    pub tile_index: Option<i64>,
    /// Pixels to erode from each source at boundary and hole edges.
    pub erode_len: i64,
    /// Blend falloff reach, in input DEM pixels; sizes processing context.
    pub blending_len: i64,
    /// Last-writer-wins compositing without smooth blending.
    pub draft_mode: bool,
    /// Output resolution in target georeferenced units per pixel.
    pub tr: Option<f64>,
    /// Output resolution in meters per pixel.
    pub mpp: Option<f64>,
    /// Target projection as a proj4 string.
    pub target_srs: Option<String>,
    /// Tile size in georeferenced units; overrides `tile_size` once the
    /// resolution is known.
    pub geo_tile_size: Option<f64>,
    /// Output no-data value; default inherited from the first source.
    pub out_nodata: Option<f64>,
    /// Worker thread count.
    pub threads: usize,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            dem_files: Vec::new(),
            output_prefix: String::new(),
            tile_size: 1_000_000,
            tile_index: None,
            erode_len: 0,
            blending_len: 200,
            draft_mode: false,
            tr: None,
            mpp: None,
            target_srs: None,
            geo_tile_size: None,
            out_nodata: None,
            threads: 1,
        }
    }
}

impl MosaicConfig {
    /// Check every configuration invariant that can be checked without
    /// touching the input files.
    pub fn validate(&self) -> Result<()> {
        if self.tr.is_some() && self.mpp.is_some() {
            return Err(config_err(
                "Just one of the --mpp and --tr options needs to be set.",
            ));
        }
        if self.output_prefix.is_empty() {
            return Err(config_err("No output prefix was specified."));
        }
        if self.threads == 0 {
            return Err(config_err("The number of threads must be set and positive."));
        }
        if self.erode_len < 0 {
            return Err(config_err("The erode length must not be negative."));
        }
        if self.blending_len < 0 {
            return Err(config_err("The blending length must not be negative."));
        }
        if self.tile_size <= 0 {
            return Err(config_err(
                "The size of a tile in pixels must be set and positive.",
            ));
        }
        if self.draft_mode && self.erode_len > 0 {
            return Err(config_err("Cannot erode pixels in draft mode."));
        }
        if self.geo_tile_size.is_some_and(|g| g < 0.0) {
            return Err(config_err(
                "The size of a tile in georeferenced units must not be negative.",
            ));
        }
        if self.dem_files.is_empty() {
            return Err(config_err("No DEM files to mosaic."));
        }
        Ok(())
    }
}

fn config_err(msg: &str) -> MosaicError {
    MosaicError::Config(msg.to_string())
}

/// How the mosaic's pixel extent splits into output tiles.
///
/// Tiles are ordered row-major: `tile_x = id % num_tiles_x`, `tile_y = id /
/// num_tiles_x`. The union of all tile boxes covers `[0, cols) x [0, rows)`
/// exactly, without overlap.
#[derive(Debug, Clone, Copy)]
pub struct TileLayout {
    pub cols: i64,
    pub rows: i64,
    pub tile_size: i64,
    pub num_tiles_x: i64,
    pub num_tiles_y: i64,
}

impl TileLayout {
    pub fn new(cols: i64, rows: i64, tile_size: i64) -> Self {
        let num_tiles_x = (cols as f64 / tile_size as f64).ceil().max(1.0) as i64;
        let num_tiles_y = (rows as f64 / tile_size as f64).ceil().max(1.0) as i64;
        Self {
            cols,
            rows,
            tile_size,
            num_tiles_x,
            num_tiles_y,
        }
    }

    pub fn num_tiles(&self) -> i64 {
        self.num_tiles_x * self.num_tiles_y
    }

    /// The pixel box of tile `id`, clamped to the mosaic extent.
    pub fn tile_box(&self, id: i64) -> PixelBox {
        let tile_x = id % self.num_tiles_x;
        let tile_y = id / self.num_tiles_x;
        PixelBox::with_size(
            tile_x * self.tile_size,
            tile_y * self.tile_size,
            self.tile_size,
            self.tile_size,
        )
        .crop(&PixelBox::new(0, 0, self.cols, self.rows))
    }
}

/// Block side for memory-bounded evaluation: the next power of two at or
/// above `4 * (erode_len + blending_len)`, floored at 256. Big enough to
/// amortize the per-block context margin, small enough to bound memory.
pub fn block_size(erode_len: i64, blending_len: i64) -> i64 {
    let wanted = 4 * (erode_len + blending_len).max(1);
    (wanted as u64).next_power_of_two().max(256) as i64
}

/// A fully prepared mosaic: sources opened, extent computed, output
/// georeference resolved. Immutable; tile evaluation shares it read-only.
#[derive(Debug)]
pub struct Mosaic {
    sources: Vec<Source>,
    out_georef: Georef,
    cols: i64,
    rows: i64,
    erode_len: i64,
    blending_len: i64,
    mode: WeightMode,
    out_nodata: f64,
    tile_size: i64,
    tile_index: Option<i64>,
    output_prefix: String,
    pool: rayon::ThreadPool,
}

impl Mosaic {
    /// Run `ReadSources` and `ComputeExtent` for `config`.
    pub fn open(config: &MosaicConfig) -> Result<Self> {
        Self::open_with_progress(config, |_, _| {})
    }

    /// Like [`Mosaic::open`], reporting `(sources_read, total)` after each
    /// input is opened.
    pub fn open_with_progress(
        config: &MosaicConfig,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Self> {
        config.validate()?;

        // The first DEM seeds the output georeference and no-data value.
        let first = DemReader::open(&config.dem_files[0])?;
        let out_nodata = config
            .out_nodata
            .or_else(|| first.nodata())
            .unwrap_or(DEFAULT_NODATA);
        let mut out_georef = first.georef().clone();
        drop(first);

        let mut projection_changed = false;
        if let Some(srs) = &config.target_srs {
            let target = Projection::from_proj4(srs)?;
            projection_changed = target != out_georef.projection;
            out_georef.projection = target;
        }

        // Resolve the output resolution; --mpp converts meters to degrees
        // on geographic outputs.
        let spacing = match (config.tr, config.mpp) {
            (Some(tr), _) => Some(tr),
            (None, Some(mpp)) if out_georef.projection.is_geographic() => {
                Some(mpp * 360.0 / (2.0 * std::f64::consts::PI * EARTH_RADIUS_M))
            }
            (None, Some(mpp)) => Some(mpp),
            (None, None) => None,
        };
        // The first DEM's resolution is meaningless in a different
        // projection's units; changing the projection needs an explicit
        // positive resolution.
        let spacing = match spacing {
            Some(s) if s > 0.0 => {
                out_georef = out_georef.with_resolution(s);
                s
            }
            _ if projection_changed => {
                return Err(config_err(
                    "Changing the projection was requested. The output DEM resolution \
                     must be specified via the --tr option.",
                ));
            }
            _ => out_georef.resolution(),
        };

        let tile_size = match config.geo_tile_size {
            Some(geo) if geo > 0.0 => {
                let px = (geo / spacing).round() as i64;
                info!("Tile size in pixels: {px}");
                px
            }
            _ => config.tile_size,
        }
        .max(1);

        // ReadSources: open every input, defaulting its no-data to the
        // output's, and wrap projection mismatches in a lazy warped view.
        let total = config.dem_files.len();
        let mut sources = Vec::with_capacity(total);
        let mut mosaic_bbox = crate::geom::Box2::empty();
        for (i, path) in config.dem_files.iter().enumerate() {
            let reader = DemReader::open(path)?;
            let nodata = reader.nodata().unwrap_or(out_nodata);

            let source = if reader.georef().projection == out_georef.projection {
                let georef = reader.georef().clone();
                Source {
                    image: SourceImage::Direct(reader),
                    georef,
                    nodata,
                }
            } else {
                debug!(path = %path.display(), "reprojecting source to the output projection");
                let view = WarpView::new(reader, &out_georef, nodata)?;
                let georef = view.georef();
                Source {
                    image: SourceImage::Warped(view),
                    georef,
                    nodata,
                }
            };

            mosaic_bbox.grow_box(&pixel_to_point_bbox(
                &source.georef,
                &source.bounds().to_box2(),
            ));
            sources.push(source);
            progress(i + 1, total);
        }

        // ComputeExtent: anchor the output georef at the mosaic's lower-left
        // pixel corner, snapping near-integer corners so a single-source
        // mosaic reproduces the source's exact bounds.
        let pixel_box = point_to_pixel_bbox_nogrow(&out_georef, &mosaic_bbox);
        let beg = snap_point_to_int(Point::new(pixel_box.min_x, pixel_box.min_y));
        out_georef = out_georef.crop(beg.x, beg.y);

        let pixel_box = point_to_pixel_bbox_nogrow(&out_georef, &mosaic_bbox);
        let cols = pixel_box.max_x.round() as i64;
        let rows = pixel_box.max_y.round() as i64;

        let mode = if config.draft_mode {
            WeightMode::Draft
        } else {
            WeightMode::Blended
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| MosaicError::Config(format!("Failed to build the thread pool: {e}")))?;

        Ok(Self {
            sources,
            out_georef,
            cols,
            rows,
            erode_len: config.erode_len,
            blending_len: config.blending_len,
            mode,
            out_nodata,
            tile_size,
            tile_index: config.tile_index,
            output_prefix: config.output_prefix.clone(),
            pool,
        })
    }

    pub fn cols(&self) -> i64 {
        self.cols
    }

    pub fn rows(&self) -> i64 {
        self.rows
    }

    pub fn out_georef(&self) -> &Georef {
        &self.out_georef
    }

    pub fn out_nodata(&self) -> f64 {
        self.out_nodata
    }

    /// `PartitionTiles`: the tile grid over the computed extent.
    pub fn layout(&self) -> TileLayout {
        TileLayout::new(self.cols, self.rows, self.tile_size)
    }

    /// Compose one output region: iterate all sources, reproject/resample
    /// each into the region, accumulate weighted sums. Returns the raw
    /// accumulators; [`Mosaic::finalize_region`] turns them into values.
    pub fn compose_region(&self, bbox: &PixelBox) -> Result<(Grid, Grid)> {
        let width = bbox.width() as usize;
        let height = bbox.height() as usize;
        let mut tile = Grid::filled(width, height, self.out_nodata);
        let mut weights = Grid::filled(width, height, 0.0);

        for source in &self.sources {
            // The region's corners as pixels in this source. All of this is
            // done in projected-point units, never lon/lat; the latter breaks
            // down badly around poles.
            let point_box = pixel_to_point_bbox(&self.out_georef, &bbox.to_box2());
            let pix_box = point_to_pixel_bbox_nogrow(&source.georef, &point_box)
                .to_pixel_box()
                .expand(self.erode_len + self.blending_len + INTERP_MARGIN)
                .crop(&source.bounds());
            if pix_box.is_empty() {
                continue;
            }

            let dem = source.read_window(&pix_box)?;
            let wts = compute_weights(&dem, source.nodata, self.mode, self.erode_len);

            let src_cols = dem.cols;
            let src_rows = dem.rows;

            for r in 0..height {
                for c in 0..width {
                    let out_pix = Point::new(
                        (bbox.min_x + c as i64) as f64,
                        (bbox.min_y + r as i64) as f64,
                    );
                    let in_pix = source
                        .georef
                        .point_to_pixel(self.out_georef.pixel_to_point(out_pix));
                    let x = in_pix.x - pix_box.min_x as f64;
                    let y = in_pix.y - pix_box.min_y as f64;

                    let i0 = x.round();
                    let j0 = y.round();
                    let (val, wt) = if (x - i0).abs() < TOL
                        && (y - j0).abs() < TOL
                        && i0 >= 0.0
                        && i0 <= (src_cols - 1) as f64
                        && j0 >= 0.0
                        && j0 <= (src_rows - 1) as f64
                    {
                        // At an integer pixel, save for numerical error.
                        // Borrow the pixel's value rather than interpolate:
                        // interpolation can invalidate a valid pixel when a
                        // neighbor is invalid, or make a barely-in-bounds
                        // point appear out of bounds.
                        let (i0, j0) = (i0 as usize, j0 as usize);
                        (dem.get(i0, j0), wts.get(i0, j0))
                    } else {
                        if src_cols < 2 || src_rows < 2 {
                            continue;
                        }
                        // x is fractional, so the bound is cols - 1.
                        if !(x >= 0.0
                            && x <= (src_cols - 1) as f64
                            && y >= 0.0
                            && y <= (src_rows - 1) as f64)
                        {
                            continue;
                        }
                        // A zero weight among the neighbors means invalid
                        // pixels take part; skip this point.
                        let i = (x.floor() as usize).min(src_cols - 2);
                        let j = (y.floor() as usize).min(src_rows - 2);
                        if wts.get(i, j) <= 0.0
                            || wts.get(i + 1, j) <= 0.0
                            || wts.get(i, j + 1) <= 0.0
                            || wts.get(i + 1, j + 1) <= 0.0
                        {
                            continue;
                        }
                        (dem.sample_bilinear(x, y), wts.sample_bilinear(x, y))
                    };

                    if wt <= 0.0 {
                        continue;
                    }

                    // First valid contribution resets the no-data sentinel.
                    let current = tile.get(c, r);
                    if current == self.out_nodata || current.is_nan() {
                        tile.set(c, r, 0.0);
                    }

                    match self.mode {
                        WeightMode::Blended => {
                            tile.set(c, r, tile.get(c, r) + wt * val);
                            weights.set(c, r, weights.get(c, r) + wt);
                        }
                        WeightMode::Draft => {
                            tile.set(c, r, val);
                            weights.set(c, r, 1.0);
                        }
                    }
                }
            }
        }
        Ok((tile, weights))
    }

    /// Divide accumulated values by total weight; zero-weight pixels keep
    /// the no-data sentinel.
    pub fn finalize_region(&self, tile: &mut Grid, weights: &Grid) {
        for r in 0..tile.rows {
            for c in 0..tile.cols {
                let w = weights.get(c, r);
                if w > 0.0 {
                    tile.set(c, r, tile.get(c, r) / w);
                }
            }
        }
    }

    /// Compose and finalize one full-width row band, its blocks evaluated
    /// in parallel on the worker pool.
    fn compose_band(&self, band: &PixelBox) -> Result<Grid> {
        let side = block_size(self.erode_len, self.blending_len);
        let mut blocks = Vec::new();
        let mut x = band.min_x;
        while x < band.max_x {
            blocks.push(PixelBox::new(
                x,
                band.min_y,
                (x + side).min(band.max_x),
                band.max_y,
            ));
            x += side;
        }

        let computed: Vec<(PixelBox, Grid)> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| {
                    let (mut values, weights) = self.compose_region(block)?;
                    self.finalize_region(&mut values, &weights);
                    Ok((*block, values))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut out = Grid::filled(
            band.width() as usize,
            band.height() as usize,
            self.out_nodata,
        );
        for (block, values) in computed {
            let off_x = (block.min_x - band.min_x) as usize;
            for r in 0..values.rows {
                for c in 0..values.cols {
                    out.set(off_x + c, r, values.get(c, r));
                }
            }
        }
        Ok(out)
    }

    /// `EvaluateTiles` for one tile, assembled in memory band by band.
    /// `None` when the tile box is empty after clipping to the mosaic
    /// extent. [`Mosaic::write_tile`] streams the bands to disk instead.
    pub fn evaluate_tile(&self, layout: &TileLayout, tile_id: i64) -> Result<Option<Grid>> {
        let tile_box = layout.tile_box(tile_id);
        if tile_box.is_empty() {
            return Ok(None);
        }

        let side = block_size(self.erode_len, self.blending_len);
        let mut tile = Grid::filled(
            tile_box.width() as usize,
            tile_box.height() as usize,
            self.out_nodata,
        );
        let mut y = tile_box.min_y;
        while y < tile_box.max_y {
            let band = PixelBox::new(
                tile_box.min_x,
                y,
                tile_box.max_x,
                (y + side).min(tile_box.max_y),
            );
            let values = self.compose_band(&band)?;
            let off_y = (y - tile_box.min_y) as usize;
            for r in 0..values.rows {
                for c in 0..values.cols {
                    tile.set(c, off_y + r, values.get(c, r));
                }
            }
            y += side;
        }
        Ok(Some(tile))
    }

    /// Evaluate and persist one tile, streaming each row band of blocks to
    /// the encoder as it completes; the full tile raster is never held in
    /// memory. `Ok(None)` when the tile is empty.
    pub fn write_tile(&self, layout: &TileLayout, tile_id: i64) -> Result<Option<PathBuf>> {
        let path = PathBuf::from(format!("{}-tile-{}.tif", self.output_prefix, tile_id));

        let tile_box = layout.tile_box(tile_id);
        if tile_box.is_empty() {
            info!("Skip writing empty image: {}", path.display());
            return Ok(None);
        }

        let tile_georef = self
            .out_georef
            .crop(tile_box.min_x as f64, tile_box.min_y as f64);
        let file = File::create(&path)?;
        write_geotiff_streamed(
            BufWriter::new(file),
            tile_box.width() as usize,
            tile_box.height() as usize,
            &tile_georef,
            self.out_nodata,
            |row, rows| {
                let band = PixelBox::new(
                    tile_box.min_x,
                    tile_box.min_y + row as i64,
                    tile_box.max_x,
                    tile_box.min_y + (row + rows) as i64,
                );
                self.compose_band(&band)
            },
        )?;
        Ok(Some(path))
    }

    /// Evaluate and persist the selected tiles; returns the written paths.
    ///
    /// A requested tile index at or beyond the tile count is a no-op with a
    /// diagnostic, not an error.
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        let layout = self.layout();
        let num_tiles = layout.num_tiles();

        let (start, end) = match self.tile_index {
            Some(idx) if idx >= num_tiles => {
                info!("Tile with index: {idx} is out of bounds.");
                return Ok(Vec::new());
            }
            Some(idx) if idx >= 0 => (idx, idx + 1),
            _ => (0, num_tiles),
        };

        let mut written = Vec::new();
        for tile_id in start..end {
            if let Some(path) = self.write_tile(&layout, tile_id)? {
                info!("Wrote: {}", path.display());
                written.push(path);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MosaicConfig {
        MosaicConfig {
            dem_files: vec![PathBuf::from("a.tif")],
            output_prefix: "out/mosaic".into(),
            ..MosaicConfig::default()
        }
    }

    #[test]
    fn test_validate_accepts_defaults_with_inputs() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let cases: Vec<(&str, Box<dyn Fn(&mut MosaicConfig)>)> = vec![
            ("--mpp and --tr", Box::new(|c| {
                c.tr = Some(30.0);
                c.mpp = Some(30.0);
            })),
            ("output prefix", Box::new(|c| c.output_prefix.clear())),
            ("threads", Box::new(|c| c.threads = 0)),
            ("erode length", Box::new(|c| c.erode_len = -1)),
            ("blending length", Box::new(|c| c.blending_len = -1)),
            ("tile", Box::new(|c| c.tile_size = 0)),
            ("draft mode", Box::new(|c| {
                c.draft_mode = true;
                c.erode_len = 3;
            })),
            ("georeferenced units", Box::new(|c| c.geo_tile_size = Some(-1.0))),
            ("No DEM files", Box::new(|c| c.dem_files.clear())),
        ];
        for (needle, mutate) in cases {
            let mut config = valid_config();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "expected {needle:?} in {err}"
            );
        }
    }

    #[test]
    fn test_tile_layout_is_exhaustive_and_disjoint() {
        let layout = TileLayout::new(25, 10, 8);
        assert_eq!(layout.num_tiles_x, 4);
        assert_eq!(layout.num_tiles_y, 2);
        assert_eq!(layout.num_tiles(), 8);

        // Every mosaic pixel is covered exactly once.
        let mut covered = vec![0u8; 25 * 10];
        for id in 0..layout.num_tiles() {
            let b = layout.tile_box(id);
            for y in b.min_y..b.max_y {
                for x in b.min_x..b.max_x {
                    covered[(y * 25 + x) as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_tile_layout_tiny_mosaic_has_one_tile() {
        let layout = TileLayout::new(5, 5, 1_000_000);
        assert_eq!(layout.num_tiles(), 1);
        assert_eq!(layout.tile_box(0), PixelBox::new(0, 0, 5, 5));
    }

    #[test]
    fn test_tile_ordering_is_row_major() {
        let layout = TileLayout::new(30, 30, 10);
        // id 4 -> tile (1, 1)
        assert_eq!(layout.tile_box(4), PixelBox::new(10, 10, 20, 20));
        // id 5 -> tile (2, 1)
        assert_eq!(layout.tile_box(5), PixelBox::new(20, 10, 30, 20));
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(0, 0), 256);
        assert_eq!(block_size(0, 200), 1024);
        assert_eq!(block_size(56, 200), 1024);
        assert_eq!(block_size(0, 1000), 4096);
    }
}
