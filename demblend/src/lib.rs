//! # demblend - DEM mosaicking and blending library
//!
//! Blends many overlapping, individually georeferenced elevation rasters
//! (possibly in different map projections and at different resolutions) into
//! one seamless mosaic, emitted as fixed-size GeoTIFF tiles.
//!
//! ## Features
//!
//! - **Smooth blending**: grassfire interior-distance weights suppress seam
//!   and hole artifacts where sources overlap
//! - **Projection-aware**: sources in other projections are warped lazily
//!   through pure-Rust proj4 transforms, never materialized to disk
//! - **Memory bounded**: tiles evaluate in power-of-two blocks across a
//!   fixed-size worker pool, so peak memory follows the block size, not the
//!   mosaic size
//! - **No GDAL**: GeoTIFF reading and writing are pure Rust
//!
//! ## Quick Start
//!
//! ```ignore
//! use demblend::{Mosaic, MosaicConfig};
//!
//! let config = MosaicConfig {
//!     dem_files: vec!["left.tif".into(), "right.tif".into()],
//!     output_prefix: "out/mosaic".into(),
//!     threads: 4,
//!     ..MosaicConfig::default()
//! };
//! let mosaic = Mosaic::open(&config)?;
//! println!("mosaic is {} x {} pixels", mosaic.cols(), mosaic.rows());
//! let tiles = mosaic.run()?; // writes out/mosaic-tile-<id>.tif
//! ```
//!
//! ## Notes
//!
//! The tool can be written as one single large image rather than tiles: give
//! a very large tile size. Very large mosaics can be high on memory usage;
//! tiles can be produced by separate invocations (one `tile_index` each),
//! possibly on separate machines.

pub mod error;
pub mod geom;
pub mod georef;
pub mod mosaic;
pub mod raster;
pub mod weights;
pub mod writer;

/// Numeric tolerance for on-grid detection, corner snapping, and all
/// floating comparisons, in source units.
pub const TOL: f64 = 1e-6;

// Re-export main types at crate root for convenience
pub use error::{MosaicError, Result};
pub use mosaic::{Mosaic, MosaicConfig, TileLayout, DEFAULT_NODATA};
pub use weights::WeightMode;
