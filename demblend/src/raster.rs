//! DEM sources: GeoTIFF-backed rasters and lazily reprojected views.
//!
//! A [`DemReader`] never materializes its whole file; windows are assembled
//! from decoded TIFF chunks (strips or tiles), each chunk decoded at most
//! once while it stays in the LRU cache. A [`WarpView`] wraps a reader whose
//! projection differs from the output's and evaluates the reprojected,
//! nodata-masked, bilinearly resampled image one requested window at a time.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::sync::Cache;
use parking_lot::Mutex;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tracing::debug;

use crate::error::{MosaicError, Result};
use crate::geom::{Box2, Point, PixelBox};
use crate::georef::{
    lonlat_to_pixel_bbox_adjusted, pixel_to_lonlat_bbox, GeoTransform, Georef, Projection,
};

/// GeoTIFF tags not covered by the standard tiff crate tag set.
pub(crate) const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
pub(crate) const TAG_MODEL_TIEPOINT: u16 = 33922;
pub(crate) const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
pub(crate) const TAG_GEO_ASCII_PARAMS: u16 = 34737;
pub(crate) const TAG_GDAL_NODATA: u16 = 42113;

/// GeoKey IDs carrying the EPSG code.
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

/// Decoded chunks kept per reader. Bounds re-decode work without letting one
/// source pin a large share of memory.
const CHUNK_CACHE_CAPACITY: u64 = 256;

/// An owned 2-D scalar field, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub cols: usize,
    pub rows: usize,
    data: Vec<f64>,
}

impl Grid {
    /// A grid filled with a single value.
    pub fn filled(cols: usize, rows: usize, value: f64) -> Self {
        Self {
            cols,
            rows,
            data: vec![value; cols * rows],
        }
    }

    pub fn from_vec(cols: usize, rows: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), cols * rows);
        Self { cols, rows, data }
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Largest value in the grid, ignoring NaNs. 0 for an empty grid.
    pub fn max_value(&self) -> f64 {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(0.0_f64, f64::max)
    }

    /// Bilinear sample with indices clamped at the border (constant-edge
    /// extension). `x`/`y` are fractional pixel coordinates.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> f64 {
        let i = (x.floor() as i64).clamp(0, self.cols as i64 - 2).max(0) as usize;
        let j = (y.floor() as i64).clamp(0, self.rows as i64 - 2).max(0) as usize;
        let i1 = (i + 1).min(self.cols - 1);
        let j1 = (j + 1).min(self.rows - 1);
        let fx = (x - i as f64).clamp(0.0, 1.0);
        let fy = (y - j as f64).clamp(0.0, 1.0);

        let top = self.get(i, j) * (1.0 - fx) + self.get(i1, j) * fx;
        let bot = self.get(i, j1) * (1.0 - fx) + self.get(i1, j1) * fx;
        top * (1.0 - fy) + bot * fy
    }
}

/// Widen any decoded sample format to f64.
fn decoding_to_f64(result: DecodingResult) -> Vec<f64> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
    }
}

/// A single-band GeoTIFF elevation raster with lazy, chunk-cached window
/// access.
pub struct DemReader {
    path: PathBuf,
    cols: usize,
    rows: usize,
    georef: Georef,
    nodata: Option<f64>,
    chunk_width: usize,
    chunk_height: usize,
    chunks_across: usize,
    decoder: Mutex<Decoder<BufReader<File>>>,
    chunk_cache: Cache<u32, Arc<Vec<f64>>>,
}

impl std::fmt::Debug for DemReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemReader")
            .field("path", &self.path)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("georef", &self.georef)
            .field("nodata", &self.nodata)
            .field("chunk_width", &self.chunk_width)
            .field("chunk_height", &self.chunk_height)
            .field("chunks_across", &self.chunks_across)
            .finish_non_exhaustive()
    }
}

impl DemReader {
    /// Open a GeoTIFF DEM and parse its georeference.
    ///
    /// # Errors
    ///
    /// Returns [`MosaicError::NoGeoreference`] if the file lacks the
    /// pixel-scale/tiepoint tags or a recognizable projection, and
    /// [`MosaicError::UnsupportedRaster`] for multi-band files.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut decoder = Decoder::new(BufReader::new(file))?;

        let (width, height) = decoder.dimensions()?;
        match decoder.colortype()? {
            tiff::ColorType::Gray(_) => {}
            other => {
                return Err(MosaicError::UnsupportedRaster {
                    path,
                    reason: format!("expected a single-band raster, got {other:?}"),
                })
            }
        }

        let georef = read_georef(&mut decoder, &path)?;
        let nodata = read_gdal_nodata(&mut decoder)?;

        // Chunk layout from the standard tags: tiled files carry
        // TileWidth/TileLength, stripped files RowsPerStrip (whole image
        // when absent).
        let (chunk_width, chunk_height) = match decoder.find_tag(Tag::TileWidth)? {
            Some(tile_width) => {
                let tile_length = match decoder.find_tag(Tag::TileLength)? {
                    Some(v) => v.into_u64()? as usize,
                    None => height as usize,
                };
                (tile_width.into_u64()? as usize, tile_length)
            }
            None => {
                let rows_per_strip = match decoder.find_tag(Tag::RowsPerStrip)? {
                    Some(v) => (v.into_u64()? as usize).min(height as usize),
                    None => height as usize,
                };
                (width as usize, rows_per_strip)
            }
        };
        let chunks_across = (width as usize).div_ceil(chunk_width);

        debug!(
            path = %path.display(),
            width, height, ?nodata, "opened DEM"
        );

        Ok(Self {
            path,
            cols: width as usize,
            rows: height as usize,
            georef,
            nodata,
            chunk_width,
            chunk_height,
            chunks_across,
            decoder: Mutex::new(decoder),
            chunk_cache: Cache::builder().max_capacity(CHUNK_CACHE_CAPACITY).build(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn georef(&self) -> &Georef {
        &self.georef
    }

    /// The no-data value embedded in the file, if any.
    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Full raster extent as a pixel box.
    pub fn bounds(&self) -> PixelBox {
        PixelBox::new(0, 0, self.cols as i64, self.rows as i64)
    }

    /// Read a rectangular window, which must lie within [`Self::bounds`].
    pub fn read_window(&self, window: &PixelBox) -> Result<Grid> {
        debug_assert!(!window.is_empty());
        debug_assert_eq!(window.crop(&self.bounds()), *window);

        let mut out = Grid::filled(window.width() as usize, window.height() as usize, 0.0);

        let first_cx = window.min_x as usize / self.chunk_width;
        let last_cx = (window.max_x as usize - 1) / self.chunk_width;
        let first_cy = window.min_y as usize / self.chunk_height;
        let last_cy = (window.max_y as usize - 1) / self.chunk_height;

        for cy in first_cy..=last_cy {
            for cx in first_cx..=last_cx {
                let index = (cy * self.chunks_across + cx) as u32;
                let chunk = self.chunk(index)?;

                // Chunk extent in raster coordinates; edge chunks are clipped.
                let x0 = cx * self.chunk_width;
                let y0 = cy * self.chunk_height;
                let cw = self.chunk_width.min(self.cols - x0);
                let ch = self.chunk_height.min(self.rows - y0);

                let copy_min_x = (window.min_x as usize).max(x0);
                let copy_max_x = (window.max_x as usize).min(x0 + cw);
                let copy_min_y = (window.min_y as usize).max(y0);
                let copy_max_y = (window.max_y as usize).min(y0 + ch);

                for y in copy_min_y..copy_max_y {
                    for x in copy_min_x..copy_max_x {
                        let v = chunk[(y - y0) * cw + (x - x0)];
                        out.set(
                            x - window.min_x as usize,
                            y - window.min_y as usize,
                            v,
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    /// Fetch a decoded chunk, consulting the cache first.
    fn chunk(&self, index: u32) -> Result<Arc<Vec<f64>>> {
        if let Some(chunk) = self.chunk_cache.get(&index) {
            return Ok(chunk);
        }
        let decoded = {
            let mut decoder = self.decoder.lock();
            decoder.read_chunk(index)?
        };
        let chunk = Arc::new(decoding_to_f64(decoded));
        self.chunk_cache.insert(index, Arc::clone(&chunk));
        Ok(chunk)
    }
}

/// Parse pixel scale, tiepoint and projection into a [`Georef`].
fn read_georef(decoder: &mut Decoder<BufReader<File>>, path: &Path) -> Result<Georef> {
    let scale = find_f64_vec(decoder, TAG_MODEL_PIXEL_SCALE)?;
    let tiepoint = find_f64_vec(decoder, TAG_MODEL_TIEPOINT)?;

    let (scale, tiepoint) = match (scale, tiepoint) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => (s, t),
        _ => {
            return Err(MosaicError::NoGeoreference {
                path: path.to_path_buf(),
            })
        }
    };

    // Tiepoint ties raster position (I, J) to model position (X, Y).
    let px_size_x = scale[0];
    let px_size_y = -scale[1];
    let origin_x = tiepoint[3] - tiepoint[0] * px_size_x;
    let origin_y = tiepoint[4] - tiepoint[1] * px_size_y;

    let projection = read_projection(decoder).ok_or_else(|| MosaicError::NoGeoreference {
        path: path.to_path_buf(),
    })??;

    Ok(Georef::new(projection, origin_x, origin_y, px_size_x, px_size_y))
}

/// Projection from GeoAsciiParams (proj4 string) or, failing that, the EPSG
/// code in the GeoKey directory.
fn read_projection(decoder: &mut Decoder<BufReader<File>>) -> Option<Result<Projection>> {
    if let Ok(Some(value)) = decoder.find_tag(Tag::from_u16_exhaustive(TAG_GEO_ASCII_PARAMS)) {
        if let Ok(ascii) = value.into_string() {
            for part in ascii.split('|') {
                let part = part.trim().trim_end_matches('\0').trim();
                if part.contains("+proj") {
                    return Some(Projection::from_proj4(part));
                }
            }
        }
    }

    let keys = match decoder.find_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY)) {
        Ok(Some(value)) => value.into_u64_vec().ok()?,
        _ => return None,
    };
    // [version, revision, minor, count, (key, location, count, value)...]
    for entry in keys.get(4..)?.chunks_exact(4) {
        let key = entry[0] as u16;
        let location = entry[1];
        if location == 0
            && (key == PROJECTED_CS_TYPE_GEO_KEY || key == GEOGRAPHIC_TYPE_GEO_KEY)
        {
            return Some(Projection::from_epsg(entry[3] as u16));
        }
    }
    None
}

/// GDAL stores nodata as an ASCII tag.
fn read_gdal_nodata(decoder: &mut Decoder<BufReader<File>>) -> Result<Option<f64>> {
    let value = match decoder.find_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))? {
        Some(v) => v,
        None => return Ok(None),
    };
    let text = match value.into_string() {
        Ok(t) => t,
        Err(_) => return Ok(None),
    };
    Ok(text.trim_end_matches('\0').trim().parse().ok())
}

fn find_f64_vec(
    decoder: &mut Decoder<BufReader<File>>,
    tag: u16,
) -> Result<Option<Vec<f64>>> {
    match decoder.find_tag(Tag::from_u16_exhaustive(tag))? {
        Some(value) => Ok(Some(value.into_f64_vec()?)),
        None => Ok(None),
    }
}

/// A lazily reprojected, nodata-masked view of a [`DemReader`] in the output
/// projection: mask, warp, bilinear-resample, unmask, evaluated one
/// requested window at a time. The full reprojected raster is never
/// materialized.
#[derive(Debug)]
pub struct WarpView {
    reader: DemReader,
    trans: GeoTransform,
    cols: usize,
    rows: usize,
    nodata: f64,
}

impl WarpView {
    /// Build the view for a source whose projection differs from
    /// `out_georef`'s. The view's pixel grid lives in the output projection,
    /// anchored at the source's reprojected extent.
    pub fn new(reader: DemReader, out_georef: &Georef, nodata: f64) -> Result<Self> {
        let src_box = reader.bounds();
        let lonlat_box = pixel_to_lonlat_bbox(reader.georef(), &src_box)?;
        let pix_box = lonlat_to_pixel_bbox_adjusted(out_georef, &lonlat_box)?;
        let view_georef = out_georef.crop(pix_box.min_x, pix_box.min_y);

        let trans = GeoTransform::new(reader.georef().clone(), view_georef);
        let out_box = trans.forward_bbox(&src_box.to_box2())?;
        let cols = out_box.max_x.ceil().max(0.0) as usize;
        let rows = out_box.max_y.ceil().max(0.0) as usize;

        Ok(Self {
            reader,
            trans,
            cols,
            rows,
            nodata,
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The view's georef: the output georef cropped to this source's corner.
    pub fn georef(&self) -> Georef {
        // GeoTransform's destination is exactly the view georef.
        self.trans.dst().clone()
    }

    /// Evaluate the reprojected view over `window` (view pixel coordinates).
    pub fn read_window(&self, window: &PixelBox) -> Result<Grid> {
        let mut out = Grid::filled(
            window.width() as usize,
            window.height() as usize,
            self.nodata,
        );

        // Source pixels needed for this window, with a bilinear margin.
        let mut src_need = Box2::empty();
        for corner in window.to_box2().corners() {
            src_need.grow(self.trans.reverse(corner)?);
        }
        let src_box = src_need
            .to_pixel_box()
            .expand(2)
            .crop(&self.reader.bounds());
        if src_box.is_empty() {
            return Ok(out);
        }
        let src = self.reader.read_window(&src_box)?;
        let src_nodata = self.reader.nodata().unwrap_or(self.nodata);

        for r in 0..out.rows {
            for c in 0..out.cols {
                let view_pix = Point::new(
                    (window.min_x + c as i64) as f64,
                    (window.min_y + r as i64) as f64,
                );
                let src_pix = self.trans.reverse(view_pix)?;
                let x = src_pix.x - src_box.min_x as f64;
                let y = src_pix.y - src_box.min_y as f64;

                // Outside the cropped source: value-edge extension with an
                // invalid pixel, i.e. nodata.
                if x < 0.0 || y < 0.0 || x > (src.cols - 1) as f64 || y > (src.rows - 1) as f64 {
                    continue;
                }

                // Masked bilinear: if any contributing neighbor is invalid,
                // the resampled pixel is invalid.
                let i = (x.floor() as usize).min(src.cols.saturating_sub(2));
                let j = (y.floor() as usize).min(src.rows.saturating_sub(2));
                let i1 = (i + 1).min(src.cols - 1);
                let j1 = (j + 1).min(src.rows - 1);
                let neighbors = [
                    src.get(i, j),
                    src.get(i1, j),
                    src.get(i, j1),
                    src.get(i1, j1),
                ];
                if neighbors.iter().any(|&v| v == src_nodata || v.is_nan()) {
                    continue;
                }
                out.set(c, r, src.sample_bilinear(x, y));
            }
        }
        Ok(out)
    }
}

/// One input DEM: its raster (direct or warped), its georeference in the
/// output projection's terms, and its no-data sentinel. Immutable once
/// loaded; read-only across all tile computations.
#[derive(Debug)]
pub struct Source {
    pub image: SourceImage,
    pub georef: Georef,
    pub nodata: f64,
}

/// Closed set of raster backends; dispatched by plain match.
#[derive(Debug)]
pub enum SourceImage {
    Direct(DemReader),
    Warped(WarpView),
}

impl Source {
    pub fn cols(&self) -> usize {
        match &self.image {
            SourceImage::Direct(r) => r.cols(),
            SourceImage::Warped(w) => w.cols(),
        }
    }

    pub fn rows(&self) -> usize {
        match &self.image {
            SourceImage::Direct(r) => r.rows(),
            SourceImage::Warped(w) => w.rows(),
        }
    }

    pub fn bounds(&self) -> PixelBox {
        PixelBox::new(0, 0, self.cols() as i64, self.rows() as i64)
    }

    pub fn read_window(&self, window: &PixelBox) -> Result<Grid> {
        match &self.image {
            SourceImage::Direct(r) => r.read_window(window),
            SourceImage::Warped(w) => w.read_window(window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_indexing() {
        let mut g = Grid::filled(3, 2, 0.0);
        g.set(2, 1, 7.5);
        assert_eq!(g.get(2, 1), 7.5);
        assert_eq!(g.get(0, 0), 0.0);
        assert_eq!(g.data().len(), 6);
    }

    #[test]
    fn test_grid_max_ignores_nan() {
        let g = Grid::from_vec(2, 2, vec![1.0, f64::NAN, 3.0, -5.0]);
        assert_eq!(g.max_value(), 3.0);
    }

    #[test]
    fn test_bilinear_interior_and_edges() {
        let g = Grid::from_vec(2, 2, vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(g.sample_bilinear(0.0, 0.0), 0.0);
        assert_eq!(g.sample_bilinear(1.0, 1.0), 6.0);
        assert_eq!(g.sample_bilinear(0.5, 0.5), 3.0);
        // Clamped beyond the last row/column
        assert_eq!(g.sample_bilinear(1.0, 0.5), 4.0);
    }

    #[test]
    fn test_decoding_result_widening() {
        let v = decoding_to_f64(DecodingResult::I16(vec![-3, 7]));
        assert_eq!(v, vec![-3.0, 7.0]);
        let v = decoding_to_f64(DecodingResult::F32(vec![1.5]));
        assert_eq!(v, vec![1.5]);
    }
}
