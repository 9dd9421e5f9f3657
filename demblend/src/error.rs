//! Error types for the demblend library.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building a DEM mosaic.
#[derive(Error, Debug)]
pub enum MosaicError {
    /// IO error when reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Invalid configuration detected before any raster work starts.
    #[error("{0}")]
    Config(String),

    /// An input raster carries no usable georeference.
    #[error("No georeference found in {path}")]
    NoGeoreference { path: PathBuf },

    /// Projection string could not be parsed or a transform failed.
    #[error("Projection error: {0}")]
    Projection(String),

    /// An input raster has an unsupported layout (e.g. multi-band).
    #[error("Unsupported raster in {path}: {reason}")]
    UnsupportedRaster { path: PathBuf, reason: String },
}

/// Result type alias using [`MosaicError`].
pub type Result<T> = std::result::Result<T, MosaicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MosaicError::Config("The erode length must not be negative.".into());
        assert!(err.to_string().contains("erode length"));

        let err = MosaicError::NoGeoreference {
            path: PathBuf::from("left-DEM.tif"),
        };
        assert!(err.to_string().contains("left-DEM.tif"));
    }
}
