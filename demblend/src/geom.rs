//! Planar boxes and points used for pixel- and projected-space bookkeeping.
//!
//! Two box flavors exist on purpose: [`Box2`] carries fractional corners and
//! is used wherever sub-pixel precision matters (projected extents, inverse
//! affine images of tile corners), while [`PixelBox`] is the integer box that
//! actual buffers are allocated from. Conversions between the two only
//! floor/ceil where growth is intended.

/// A 2-D point, in pixel or projected units depending on context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned box with fractional corners. Empty until grown.
#[derive(Debug, Clone, Copy)]
pub struct Box2 {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Box2 {
    /// An empty box; growing it by any point makes it that point.
    pub fn empty() -> Self {
        Self {
            min_x: f64::MAX,
            min_y: f64::MAX,
            max_x: f64::MIN,
            max_y: f64::MIN,
        }
    }

    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).max(0.0)
    }

    /// Expand the box to contain `p`.
    pub fn grow(&mut self, p: Point) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    /// Union with another box.
    pub fn grow_box(&mut self, other: &Box2) {
        if other.is_empty() {
            return;
        }
        self.grow(Point::new(other.min_x, other.min_y));
        self.grow(Point::new(other.max_x, other.max_y));
    }

    /// Grow outward by `margin` on every side.
    pub fn expand(&self, margin: f64) -> Box2 {
        Box2::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    /// Shift the whole box by `(dx, dy)`.
    pub fn shift(&self, dx: f64, dy: f64) -> Box2 {
        Box2::new(
            self.min_x + dx,
            self.min_y + dy,
            self.max_x + dx,
            self.max_y + dy,
        )
    }

    /// The four corners, counter-clockwise from the minimum corner.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.min_x, self.min_y),
            Point::new(self.max_x, self.min_y),
            Point::new(self.max_x, self.max_y),
            Point::new(self.min_x, self.max_y),
        ]
    }

    /// Integer box obtained by flooring the minimum and ceiling the maximum.
    pub fn to_pixel_box(&self) -> PixelBox {
        PixelBox::new(
            self.min_x.floor() as i64,
            self.min_y.floor() as i64,
            self.max_x.ceil() as i64,
            self.max_y.ceil() as i64,
        )
    }
}

/// An axis-aligned integer box, `[min_x, max_x) x [min_y, max_y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl PixelBox {
    pub fn new(min_x: i64, min_y: i64, max_x: i64, max_y: i64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Box anchored at `(min_x, min_y)` with the given size.
    pub fn with_size(min_x: i64, min_y: i64, width: i64, height: i64) -> Self {
        Self::new(min_x, min_y, min_x + width, min_y + height)
    }

    pub fn width(&self) -> i64 {
        (self.max_x - self.min_x).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.max_y - self.min_y).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    /// Grow outward by `margin` pixels on every side.
    pub fn expand(&self, margin: i64) -> PixelBox {
        PixelBox::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    /// Intersection with `other`; may be empty.
    pub fn crop(&self, other: &PixelBox) -> PixelBox {
        PixelBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        )
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Fractional box with the same corners.
    pub fn to_box2(&self) -> Box2 {
        Box2::new(
            self.min_x as f64,
            self.min_y as f64,
            self.max_x as f64,
            self.max_y as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_box_grows_to_point() {
        let mut b = Box2::empty();
        assert!(b.is_empty());
        b.grow(Point::new(3.0, -2.0));
        assert_eq!(b.min_x, 3.0);
        assert_eq!(b.max_y, -2.0);
    }

    #[test]
    fn test_union() {
        let mut a = Box2::new(0.0, 0.0, 2.0, 2.0);
        a.grow_box(&Box2::new(1.0, -1.0, 5.0, 1.0));
        assert_eq!(a.min_y, -1.0);
        assert_eq!(a.max_x, 5.0);
        assert_eq!(a.max_y, 2.0);

        // Unioning an empty box is a no-op
        let before = a;
        a.grow_box(&Box2::empty());
        assert_eq!(a.min_x, before.min_x);
        assert_eq!(a.max_x, before.max_x);
    }

    #[test]
    fn test_expand_and_crop() {
        let b = PixelBox::new(10, 10, 20, 20).expand(5);
        assert_eq!(b, PixelBox::new(5, 5, 25, 25));

        let clipped = b.crop(&PixelBox::new(0, 0, 12, 40));
        assert_eq!(clipped, PixelBox::new(5, 5, 12, 25));

        let empty = b.crop(&PixelBox::new(100, 100, 110, 110));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_pixel_box_conversion_floors_and_ceils() {
        let b = Box2::new(0.2, -0.7, 3.1, 2.0);
        let p = b.to_pixel_box();
        assert_eq!(p, PixelBox::new(0, -1, 4, 2));
    }

    #[test]
    fn test_corners() {
        let b = Box2::new(1.0, 2.0, 3.0, 4.0);
        let c = b.corners();
        assert_eq!(c[0], Point::new(1.0, 2.0));
        assert_eq!(c[2], Point::new(3.0, 4.0));
    }
}
