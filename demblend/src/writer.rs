//! GeoTIFF output for finished mosaic tiles.
//!
//! Writes single-band 32-bit-float rasters with the GeoTIFF tags readers
//! expect: ModelPixelScale, ModelTiepoint, a GeoKey directory, the proj4
//! string in GeoAsciiParams, and the GDAL ASCII nodata tag. Pure Rust, no
//! GDAL dependency.
//!
//! Output is strip-based and pull-driven: [`write_geotiff_streamed`] asks a
//! callback for one row band per strip and converts it to f32 in place, so
//! write-buffer memory follows the strip height, never the raster height.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::error::{MosaicError, Result};
use crate::georef::Georef;
use crate::raster::{
    Grid, TAG_GDAL_NODATA, TAG_GEO_ASCII_PARAMS, TAG_GEO_KEY_DIRECTORY, TAG_MODEL_PIXEL_SCALE,
    TAG_MODEL_TIEPOINT,
};

// GeoKey IDs and values.
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

/// Strip height cap so writes stream in bounded pieces.
const MAX_ROWS_PER_STRIP: u32 = 512;

/// Write a tile to `path` as a GeoTIFF.
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    grid: &Grid,
    georef: &Georef,
    nodata: f64,
) -> Result<()> {
    let file = File::create(path)?;
    write_geotiff_to(BufWriter::new(file), grid, georef, nodata)
}

/// Write a tile to any `Write + Seek` sink.
pub fn write_geotiff_to<W: Write + Seek>(
    writer: W,
    grid: &Grid,
    georef: &Georef,
    nodata: f64,
) -> Result<()> {
    write_geotiff_streamed(writer, grid.cols, grid.rows, georef, nodata, |row, rows| {
        let start = row * grid.cols;
        let end = (row + rows) * grid.cols;
        Ok(Grid::from_vec(
            grid.cols,
            rows,
            grid.data()[start..end].to_vec(),
        ))
    })
}

/// Write a `cols` x `rows` raster strip by strip, pulling each strip's row
/// band from `fill_band(start_row, rows)`. The returned band must be `cols`
/// wide and `rows` tall; it is converted to f32 and encoded immediately, so
/// only one band is alive at a time.
pub fn write_geotiff_streamed<W, F>(
    writer: W,
    cols: usize,
    rows: usize,
    georef: &Georef,
    nodata: f64,
    mut fill_band: F,
) -> Result<()>
where
    W: Write + Seek,
    F: FnMut(usize, usize) -> Result<Grid>,
{
    if cols == 0 || rows == 0 {
        return Err(MosaicError::Config(
            "Refusing to write an empty raster.".into(),
        ));
    }

    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<Gray32Float>(cols as u32, rows as u32)?;
    image.rows_per_strip(MAX_ROWS_PER_STRIP.min(rows as u32))?;

    write_geo_tags(image.encoder(), georef, nodata)?;

    let mut row = 0usize;
    loop {
        let samples = image.next_strip_sample_count() as usize;
        if samples == 0 {
            break;
        }
        let strip_rows = samples / cols;
        let band = fill_band(row, strip_rows)?;
        debug_assert_eq!((band.cols, band.rows), (cols, strip_rows));
        let pixels: Vec<f32> = band.data().iter().map(|&v| v as f32).collect();
        image.write_strip(&pixels)?;
        row += strip_rows;
    }
    image.finish()?;
    Ok(())
}

fn write_geo_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
    dir: &mut tiff::encoder::DirectoryEncoder<W, K>,
    georef: &Georef,
    nodata: f64,
) -> Result<()> {
    // ModelPixelScale stores the y scale as a positive magnitude.
    let pixel_scale = [georef.px_size_x, -georef.px_size_y, 0.0];
    dir.write_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE), pixel_scale.as_slice())?;

    // Tie pixel (0, 0) to the georef origin.
    let tiepoint = [0.0, 0.0, 0.0, georef.origin_x, georef.origin_y, 0.0];
    dir.write_tag(Tag::Unknown(TAG_MODEL_TIEPOINT), tiepoint.as_slice())?;

    let geokeys = build_geokey_directory(georef);
    dir.write_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY), geokeys.as_slice())?;

    // GeoAsciiParams is pipe-delimited.
    let ascii_params = format!("{}|", georef.projection.proj4());
    dir.write_tag(Tag::Unknown(TAG_GEO_ASCII_PARAMS), ascii_params.as_str())?;

    let nodata_text = format!("{nodata}");
    dir.write_tag(Tag::Unknown(TAG_GDAL_NODATA), nodata_text.as_str())?;

    Ok(())
}

/// Minimal GeoKey directory: model type, raster type, and a user-defined
/// CRS key (the authoritative projection travels in GeoAsciiParams).
fn build_geokey_directory(georef: &Georef) -> Vec<u16> {
    let is_geographic = georef.projection.is_geographic();

    let mut keys = vec![
        1, // KeyDirectoryVersion
        1, // KeyRevision
        0, // MinorRevision
        3, // NumberOfKeys
    ];

    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if is_geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);

    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);

    if is_geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, USER_DEFINED]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, USER_DEFINED]);
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::georef::Projection;

    fn test_georef() -> Georef {
        let proj =
            Projection::from_proj4("+proj=utm +zone=10 +datum=WGS84 +units=m +no_defs").unwrap();
        Georef::new(proj, 500_000.0, 4_100_000.0, 30.0, -30.0)
    }

    #[test]
    fn test_write_produces_tiff_magic() {
        let grid = Grid::filled(16, 8, 42.0);
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_geotiff_to(&mut cursor, &grid, &test_georef(), -9999.0).unwrap();
        let bytes = cursor.into_inner();
        assert!(bytes.len() > 8);
        assert!(bytes[0] == b'I' && bytes[1] == b'I' || bytes[0] == b'M' && bytes[1] == b'M');
    }

    #[test]
    fn test_empty_grid_is_rejected() {
        let grid = Grid::filled(0, 0, 0.0);
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(write_geotiff_to(&mut cursor, &grid, &test_georef(), -9999.0).is_err());
    }

    #[test]
    fn test_geokey_directory_shape() {
        let keys = build_geokey_directory(&test_georef());
        assert_eq!(keys[0], 1);
        assert_eq!(keys[3], 3);
        assert_eq!(keys[4], GT_MODEL_TYPE_GEO_KEY);
        assert_eq!(keys[7], MODEL_TYPE_PROJECTED);
        assert_eq!(keys[12], PROJECTED_CS_TYPE_GEO_KEY);
    }

    #[test]
    fn test_streamed_write_pulls_one_band_per_strip() {
        use crate::geom::PixelBox;
        use crate::raster::DemReader;

        // 600 rows crosses the 512-row strip cap; each strip pulls exactly
        // its own band.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("striped.tif");
        let mut calls = Vec::new();
        {
            let file = std::fs::File::create(&path).unwrap();
            write_geotiff_streamed(
                std::io::BufWriter::new(file),
                4,
                600,
                &test_georef(),
                -9999.0,
                |row, rows| {
                    calls.push((row, rows));
                    let mut band = Grid::filled(4, rows, 0.0);
                    for r in 0..rows {
                        for c in 0..4 {
                            band.set(c, r, ((row + r) * 4 + c) as f64);
                        }
                    }
                    Ok(band)
                },
            )
            .unwrap();
        }
        assert_eq!(calls, vec![(0, 512), (512, 88)]);

        let reader = DemReader::open(&path).unwrap();
        assert_eq!(reader.rows(), 600);
        // Pixels on both sides of the strip boundary survive intact.
        let read = reader.read_window(&PixelBox::new(0, 510, 4, 515)).unwrap();
        assert_eq!(read.get(1, 0), (510 * 4 + 1) as f64);
        assert_eq!(read.get(3, 2), (512 * 4 + 3) as f64);
        assert_eq!(read.get(0, 4), (514 * 4) as f64);
    }

    #[test]
    fn test_round_trip_through_dem_reader() {
        use crate::raster::DemReader;

        let mut grid = Grid::filled(10, 6, 0.0);
        for r in 0..6 {
            for c in 0..10 {
                grid.set(c, r, (r * 10 + c) as f64);
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.tif");
        write_geotiff(&path, &grid, &test_georef(), -9999.0).unwrap();

        let reader = DemReader::open(&path).unwrap();
        assert_eq!(reader.cols(), 10);
        assert_eq!(reader.rows(), 6);
        assert_eq!(reader.nodata(), Some(-9999.0));
        assert_eq!(reader.georef().origin_x, 500_000.0);
        assert_eq!(reader.georef().px_size_y, -30.0);
        assert_eq!(reader.georef().projection, test_georef().projection);

        let window = crate::geom::PixelBox::new(2, 1, 5, 4);
        let read = reader.read_window(&window).unwrap();
        assert_eq!(read.get(0, 0), 12.0);
        assert_eq!(read.get(2, 2), 34.0);
    }
}
