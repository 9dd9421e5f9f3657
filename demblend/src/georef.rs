//! Georeferences and coordinate transforms.
//!
//! A [`Georef`] couples a map projection with an affine pixel-to-point
//! transform (scale and origin only, the shape GeoTIFF PixelScale/Tiepoint
//! pairs can express). All cross-projection work happens in projected-point
//! units; longitude/latitude is only used for the antimeridian adjustment in
//! [`lonlat_to_pixel_bbox_adjusted`], because lon/lat box math breaks down
//! near the poles.

use std::sync::{Arc, OnceLock};

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::{MosaicError, Result};
use crate::geom::{Box2, Point, PixelBox};
use crate::TOL;

/// Samples per box edge when densifying a bounding box through a
/// non-affine map. Matches the granularity the projected extents need;
/// corners alone are not enough for curved projections.
const EDGE_SAMPLES: usize = 64;

/// A parsed map projection with a canonical proj4 representation.
///
/// Equality is defined on the normalized proj4 string, so functionally
/// identical strings that differ in token order or whitespace compare equal.
#[derive(Clone)]
pub struct Projection {
    proj4: String,
    proj: Arc<Proj>,
    geographic: bool,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("proj4", &self.proj4)
            .finish()
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        self.proj4 == other.proj4
    }
}

impl Projection {
    /// Parse a proj4 string, normalizing it first.
    pub fn from_proj4(srs: &str) -> Result<Self> {
        let proj4 = normalize_proj4(srs);
        let proj = Proj::from_proj_string(&proj4)
            .map_err(|e| MosaicError::Projection(format!("invalid proj4 string {srs:?}: {e}")))?;
        let geographic = proj4.contains("proj=longlat") || proj4.contains("proj=latlong");
        Ok(Self {
            proj4,
            proj: Arc::new(proj),
            geographic,
        })
    }

    /// Look up an EPSG code in the crs-definitions database.
    pub fn from_epsg(code: u16) -> Result<Self> {
        let def = crs_definitions::from_code(code).ok_or_else(|| {
            MosaicError::Projection(format!("EPSG:{code} is not in the crs-definitions database"))
        })?;
        Self::from_proj4(def.proj4)
    }

    /// The WGS84 longitude/latitude projection.
    pub fn lonlat() -> &'static Projection {
        static LONLAT: OnceLock<Projection> = OnceLock::new();
        LONLAT.get_or_init(|| {
            Projection::from_proj4("+proj=longlat +datum=WGS84 +no_defs")
                .expect("builtin lon/lat projection string")
        })
    }

    /// The normalized proj4 string.
    pub fn proj4(&self) -> &str {
        &self.proj4
    }

    /// Whether projected units are angular degrees rather than linear.
    pub fn is_geographic(&self) -> bool {
        self.geographic
    }
}

/// Canonical form of a proj4 string: tokens sorted, single-spaced, duplicates
/// removed. Functionally identical strings can differ in subtle ways (extra
/// spaces, parameter order), so any srs string must be normalized before
/// comparing it with another.
pub fn normalize_proj4(srs: &str) -> String {
    let mut tokens: Vec<&str> = srs.split_whitespace().filter(|t| !t.is_empty()).collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

/// Map a point between two projections. Geographic coordinates cross the
/// proj4rs boundary in radians.
pub fn transform_point(src: &Projection, dst: &Projection, p: Point) -> Result<Point> {
    if src == dst {
        return Ok(p);
    }

    let (x, y) = if src.is_geographic() {
        (p.x.to_radians(), p.y.to_radians())
    } else {
        (p.x, p.y)
    };

    let mut point = (x, y, 0.0);
    transform(&src.proj, &dst.proj, &mut point)
        .map_err(|e| MosaicError::Projection(format!("point transform failed: {e}")))?;

    let (out_x, out_y) = if dst.is_geographic() {
        (point.0.to_degrees(), point.1.to_degrees())
    } else {
        (point.0, point.1)
    };
    Ok(Point::new(out_x, out_y))
}

/// A projection plus the affine transform tying pixel indices to
/// projected-point coordinates.
///
/// Pixel `(col, row)` maps to point `(origin_x + col * px_size_x,
/// origin_y + row * px_size_y)`; `px_size_y` is negative for the usual
/// north-up rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct Georef {
    pub projection: Projection,
    pub origin_x: f64,
    pub origin_y: f64,
    pub px_size_x: f64,
    pub px_size_y: f64,
}

impl Georef {
    pub fn new(
        projection: Projection,
        origin_x: f64,
        origin_y: f64,
        px_size_x: f64,
        px_size_y: f64,
    ) -> Self {
        Self {
            projection,
            origin_x,
            origin_y,
            px_size_x,
            px_size_y,
        }
    }

    /// Pixel coordinates to projected-point coordinates.
    pub fn pixel_to_point(&self, p: Point) -> Point {
        Point::new(
            self.origin_x + p.x * self.px_size_x,
            self.origin_y + p.y * self.px_size_y,
        )
    }

    /// Projected-point coordinates to (fractional) pixel coordinates.
    pub fn point_to_pixel(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.origin_x) / self.px_size_x,
            (p.y - self.origin_y) / self.px_size_y,
        )
    }

    /// Pixel coordinates to longitude/latitude degrees.
    pub fn pixel_to_lonlat(&self, p: Point) -> Result<Point> {
        transform_point(
            &self.projection,
            Projection::lonlat(),
            self.pixel_to_point(p),
        )
    }

    /// Longitude/latitude degrees to projected-point coordinates.
    pub fn lonlat_to_point(&self, p: Point) -> Result<Point> {
        transform_point(Projection::lonlat(), &self.projection, p)
    }

    /// Shift the origin by a (possibly fractional) pixel offset, so that the
    /// returned georef's pixel `(0, 0)` is this georef's pixel `(dx, dy)`.
    pub fn crop(&self, dx: f64, dy: f64) -> Georef {
        Georef {
            projection: self.projection.clone(),
            origin_x: self.origin_x + dx * self.px_size_x,
            origin_y: self.origin_y + dy * self.px_size_y,
            px_size_x: self.px_size_x,
            px_size_y: self.px_size_y,
        }
    }

    /// Ground sample distance in projected units.
    pub fn resolution(&self) -> f64 {
        self.px_size_x
    }

    /// Replace the affine transform with a square grid of the given spacing,
    /// keeping the origin at the projected-space origin.
    pub fn with_resolution(&self, spacing: f64) -> Georef {
        Georef {
            projection: self.projection.clone(),
            origin_x: 0.0,
            origin_y: 0.0,
            px_size_x: spacing,
            px_size_y: -spacing,
        }
    }
}

/// Projected-point box to pixel box with NO integer rounding or growth.
///
/// The general-purpose variant of this conversion grows the result to
/// integer bounds; here finer control is needed, since callers floor/ceil
/// only where growth is intended.
pub fn point_to_pixel_bbox_nogrow(georef: &Georef, point_box: &Box2) -> Box2 {
    let mut pix_box = Box2::empty();
    for corner in point_box.corners() {
        pix_box.grow(georef.point_to_pixel(corner));
    }
    pix_box
}

/// Pixel box to projected-point box, corners only.
pub fn pixel_to_point_bbox(georef: &Georef, pixel_box: &Box2) -> Box2 {
    let mut point_box = Box2::empty();
    for corner in pixel_box.corners() {
        point_box.grow(georef.pixel_to_point(corner));
    }
    point_box
}

/// Pixel box to a longitude/latitude box, densified along the edges.
pub fn pixel_to_lonlat_bbox(georef: &Georef, pixel_box: &PixelBox) -> Result<Box2> {
    let mut out = Box2::empty();
    for p in border_samples(&pixel_box.to_box2()) {
        out.grow(georef.pixel_to_lonlat(p)?);
    }
    Ok(out)
}

/// Longitude/latitude box to pixel box, correcting for a ±360° longitude
/// offset first.
///
/// A lon/lat box can arrive offset by a whole number of 360° turns relative
/// to the georef's own longitude origin; without the shift the conversion
/// silently produces a degenerate or wildly oversized box near the
/// antimeridian.
pub fn lonlat_to_pixel_bbox_adjusted(georef: &Georef, lonlat_box: &Box2) -> Result<Box2> {
    let origin = georef.pixel_to_lonlat(Point::new(0.0, 0.0))?;
    let center_lon = (lonlat_box.min_x + lonlat_box.max_x) / 2.0;
    let shift = ((origin.x - center_lon) / 360.0).round();
    let adjusted = lonlat_box.shift(360.0 * shift, 0.0);

    let mut out = Box2::empty();
    for p in border_samples(&adjusted) {
        out.grow(georef.point_to_pixel(georef.lonlat_to_point(p)?));
    }
    Ok(out)
}

/// Points along the border of a box, `EDGE_SAMPLES` per edge plus corners.
fn border_samples(b: &Box2) -> Vec<Point> {
    let mut pts = Vec::with_capacity(4 * (EDGE_SAMPLES + 1));
    let n = EDGE_SAMPLES as f64;
    for i in 0..=EDGE_SAMPLES {
        let t = i as f64 / n;
        let x = b.min_x + t * (b.max_x - b.min_x);
        let y = b.min_y + t * (b.max_y - b.min_y);
        pts.push(Point::new(x, b.min_y));
        pts.push(Point::new(x, b.max_y));
        pts.push(Point::new(b.min_x, y));
        pts.push(Point::new(b.max_x, y));
    }
    pts
}

/// A pixel-space map between two georefs, possibly across projections.
#[derive(Debug, Clone)]
pub struct GeoTransform {
    src: Georef,
    dst: Georef,
}

impl GeoTransform {
    pub fn new(src: Georef, dst: Georef) -> Self {
        Self { src, dst }
    }

    pub fn src(&self) -> &Georef {
        &self.src
    }

    pub fn dst(&self) -> &Georef {
        &self.dst
    }

    /// Source pixel to destination pixel.
    pub fn forward(&self, p: Point) -> Result<Point> {
        let pt = transform_point(
            &self.src.projection,
            &self.dst.projection,
            self.src.pixel_to_point(p),
        )?;
        Ok(self.dst.point_to_pixel(pt))
    }

    /// Destination pixel to source pixel.
    pub fn reverse(&self, p: Point) -> Result<Point> {
        let pt = transform_point(
            &self.dst.projection,
            &self.src.projection,
            self.dst.pixel_to_point(p),
        )?;
        Ok(self.src.point_to_pixel(pt))
    }

    /// Image of a source pixel box in destination pixel space, densified.
    pub fn forward_bbox(&self, pixel_box: &Box2) -> Result<Box2> {
        let mut out = Box2::empty();
        for p in border_samples(pixel_box) {
            out.grow(self.forward(p)?);
        }
        Ok(out)
    }
}

/// Snap a point to the integer grid when it lies within [`TOL`] of it
/// (Euclidean norm over both coordinates).
///
/// Used on the mosaic's lower-left pixel corner: a corner that is very close
/// to an integer is assumed to have drifted off one through numerical error,
/// so a single-source mosaic keeps the source's exact corners.
pub fn snap_point_to_int(p: Point) -> Point {
    let dx = p.x - p.x.round();
    let dy = p.y - p.y.round();
    if (dx * dx + dy * dy).sqrt() < TOL {
        Point::new(p.x.round(), p.y.round())
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utm10() -> Projection {
        Projection::from_proj4("+proj=utm +zone=10 +datum=WGS84 +units=m +no_defs").unwrap()
    }

    #[test]
    fn test_normalization_is_order_and_space_insensitive() {
        let a = normalize_proj4("+proj=utm +zone=10  +datum=WGS84");
        let b = normalize_proj4("+datum=WGS84 +proj=utm +zone=10");
        assert_eq!(a, b);

        let pa = Projection::from_proj4("+proj=utm +zone=10 +datum=WGS84").unwrap();
        let pb = Projection::from_proj4("  +datum=WGS84   +proj=utm +zone=10 ").unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_geographic_detection() {
        assert!(Projection::lonlat().is_geographic());
        assert!(!utm10().is_geographic());
    }

    #[test]
    fn test_pixel_point_round_trip() {
        let geo = Georef::new(utm10(), 500_000.0, 4_100_000.0, 30.0, -30.0);
        let pix = Point::new(12.25, 7.5);
        let pt = geo.pixel_to_point(pix);
        let back = geo.point_to_pixel(pt);
        assert!((back.x - pix.x).abs() < TOL);
        assert!((back.y - pix.y).abs() < TOL);
    }

    #[test]
    fn test_crop_shifts_origin() {
        let geo = Georef::new(utm10(), 500_000.0, 4_100_000.0, 30.0, -30.0);
        let cropped = geo.crop(10.0, 20.0);
        assert_eq!(cropped.origin_x, 500_300.0);
        assert_eq!(cropped.origin_y, 4_099_400.0);
        // Pixel (0,0) of the crop is pixel (10,20) of the original
        let a = cropped.pixel_to_point(Point::new(0.0, 0.0));
        let b = geo.pixel_to_point(Point::new(10.0, 20.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_nogrow_bbox_keeps_fractional_corners() {
        let geo = Georef::new(utm10(), 500_000.0, 4_100_000.0, 30.0, -30.0);
        // A point box not aligned to the pixel grid
        let pt_box = Box2::new(500_015.0, 4_099_955.0, 500_105.0, 4_099_985.0);
        let pix_box = point_to_pixel_bbox_nogrow(&geo, &pt_box);
        assert!((pix_box.min_x - 0.5).abs() < TOL);
        assert!((pix_box.max_x - 3.5).abs() < TOL);
        assert!((pix_box.min_y - 0.5).abs() < TOL);
        assert!((pix_box.max_y - 1.5).abs() < TOL);
    }

    #[test]
    fn test_lonlat_transform_round_trip() {
        let geo = Georef::new(utm10(), 500_000.0, 4_100_000.0, 30.0, -30.0);
        let ll = geo.pixel_to_lonlat(Point::new(0.0, 0.0)).unwrap();
        // UTM zone 10 is centered on 123W
        assert!((ll.x + 123.0).abs() < 1.0, "lon = {}", ll.x);
        let pt = geo.lonlat_to_point(ll).unwrap();
        assert!((pt.x - 500_000.0).abs() < 1e-3);
        assert!((pt.y - 4_100_000.0).abs() < 1e-3);
    }

    #[test]
    fn test_lonlat_bbox_360_adjustment() {
        // Geographic georef anchored near the antimeridian
        let geo = Georef::new(Projection::lonlat().clone(), 170.0, 60.0, 0.01, -0.01);
        // Same area expressed with longitudes shifted by -360
        let shifted = Box2::new(170.5 - 360.0, 59.0, 171.5 - 360.0, 59.5);
        let pix = lonlat_to_pixel_bbox_adjusted(&geo, &shifted).unwrap();
        assert!((pix.min_x - 50.0).abs() < 1e-6);
        assert!((pix.max_x - 150.0).abs() < 1e-6);
        assert!((pix.min_y - 50.0).abs() < 1e-6);
        assert!((pix.max_y - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_geotransform_identity_between_equal_georefs() {
        let geo = Georef::new(utm10(), 500_000.0, 4_100_000.0, 30.0, -30.0);
        let trans = GeoTransform::new(geo.clone(), geo);
        let p = Point::new(5.0, 9.0);
        let q = trans.forward(p).unwrap();
        assert!((q.x - p.x).abs() < TOL);
        assert!((q.y - p.y).abs() < TOL);
    }

    #[test]
    fn test_snap_point_to_int() {
        let snapped = snap_point_to_int(Point::new(4.0 + 1e-9, -2.0 - 1e-8));
        assert_eq!(snapped, Point::new(4.0, -2.0));
        // Beyond tolerance, the point is untouched
        let kept = snap_point_to_int(Point::new(4.3, 1.0));
        assert_eq!(kept, Point::new(4.3, 1.0));
    }
}
