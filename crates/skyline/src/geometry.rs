//! Planar polygon helpers over `[x, y]` rings, backed by `geo`.
//!
//! Rings are open (no repeated closing point) unless stated otherwise.

use geo::{Area, BoundingRect, Centroid, Coord, EuclideanDistance, LineString, Polygon, Triangle};

pub type Point2 = [f64; 2];

/// Relative tolerance for collinearity and zero-area tests.
const REL_EPS: f64 = 1e-12;

#[inline]
fn coord(p: Point2) -> Coord<f64> {
    Coord { x: p[0], y: p[1] }
}

#[inline]
fn dist2(a: Point2, b: Point2) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// Single-ring polygon; `geo` closes the ring.
pub fn polygon(ring: &[Point2]) -> Polygon<f64> {
    Polygon::new(LineString::from(ring.to_vec()), Vec::new())
}

/// Counter-clockwise rings are positive.
pub fn signed_area(ring: &[Point2]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    polygon(ring).signed_area()
}

/// Area-weighted centroid, or `None` for a zero-area ring.
pub fn centroid(ring: &[Point2]) -> Option<Point2> {
    if ring.len() < 3 || is_zero_area(ring) {
        return None;
    }

    polygon(ring).centroid().map(|c| [c.x(), c.y()])
}

/// `(min, max)` corners of the ring's bounding rectangle.
pub fn bounds(ring: &[Point2]) -> Option<(Point2, Point2)> {
    let rect = LineString::from(ring.to_vec()).bounding_rect()?;
    Some(([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}

/// Squared diagonal of the ring's bounding rectangle; scale for tolerances.
fn extent2(ring: &[Point2]) -> f64 {
    bounds(ring).map_or(0.0, |(min, max)| dist2(min, max))
}

/// Measured from `a` so large projected coordinates do not cancel.
pub(crate) fn is_collinear(a: Point2, b: Point2, c: Point2) -> bool {
    let scale = (dist2(a, b) * dist2(b, c)).sqrt();
    let rel = |p: Point2| coord([p[0] - a[0], p[1] - a[1]]);
    let area = Triangle::new(rel(a), rel(b), rel(c)).unsigned_area();
    2.0 * area <= REL_EPS * scale
}

/// True when the ring encloses no measurable area.
pub(crate) fn is_zero_area(ring: &[Point2]) -> bool {
    signed_area(ring).abs() <= REL_EPS * extent2(ring)
}

/// Minimum planar distance between two polygons; 0 when they touch,
/// overlap, or one contains the other.
pub fn polygon_distance(a: &[Point2], b: &[Point2]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    polygon(a).euclidean_distance(&polygon(b))
}
