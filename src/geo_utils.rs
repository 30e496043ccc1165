//! # Geographic Utilities
//!
//! Geometric primitives used by assignment, curb inference and queries.
//!
//! Coordinates are WGS84 longitude/latitude stored as `x`/`y`. Distances used for
//! nearest-segment ranking are planar (degrees); lengths used for densities are
//! geodesic (meters).
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two points |
//! | [`polyline_length`] | Total length of a street segment in meters |
//! | [`planar_distance`] | Planar point-to-segment distance in degrees |
//! | [`linear_reference`] | Normalized position of a point's projection along a line |
//! | [`project`] | Linear reference plus snapped point |
//! | [`canonical_direction`] | Orient a line south-to-north (west-to-east on ties) |
//! | [`side_of`] | Left/right of a point relative to the canonical direction |
//! | [`covered_by`] | Line lies inside or on the boundary of a polygon set |
//! | [`compute_bounds`] | Bounding box of a set of lines |
//!
//! ## Example
//!
//! ```rust
//! use geo::{line_string, point};
//! use rubbish_geo::{Side, geo_utils};
//!
//! let street = line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 0.001)];
//! let pickup = point!(x: -0.0001, y: 0.0005);
//!
//! let projection = geo_utils::project(&street, &pickup);
//! assert!((projection.linear_reference - 0.5).abs() < 1e-9);
//! assert_eq!(geo_utils::side_of(&pickup, &street, 0.01), Side::Left);
//! ```
//!
//! ## Side Convention
//!
//! A segment's stored vertex order is arbitrary, so sides are always reported against
//! its canonical direction: the endpoint with the smaller latitude is the start, and
//! when both endpoints share a latitude the one with the smaller longitude is. A point
//! exactly on the line is reported as [`Side::Left`].

use crate::Side;
use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{
    Coord, Distance, Euclidean, Haversine, Intersects, Line, LineInterpolatePoint,
    LineLocatePoint, LineString, MultiPolygon, Point, Rect,
};
use std::borrow::Cow;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance between two lon/lat points, in meters.
///
/// ```rust
/// use geo::point;
/// use rubbish_geo::geo_utils;
///
/// let london = point!(x: -0.1278, y: 51.5074);
/// let paris = point!(x: 2.3522, y: 48.8566);
/// assert!((geo_utils::haversine_distance(london, paris) - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: Point<f64>, p2: Point<f64>) -> f64 {
    Haversine::distance(p1, p2)
}

/// Length of a street segment in meters, summing haversine distance between vertices.
///
/// Empty or single-vertex lines return 0.0.
pub fn polyline_length(line: &LineString<f64>) -> f64 {
    line.lines()
        .map(|l| haversine_distance(l.start_point(), l.end_point()))
        .sum()
}

/// Planar distance (degrees) from a point to the closest location on a line.
#[inline]
pub fn planar_distance(point: &Point<f64>, line: &LineString<f64>) -> f64 {
    Euclidean::distance(point, line)
}

// =============================================================================
// Projection
// =============================================================================

/// Where a point lands when projected onto a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Normalized distance along the line, in `[0, 1]`
    pub linear_reference: f64,
    /// The projected point on the line
    pub snapped: Point<f64>,
}

/// Fraction of the line's length at which the point's closest location lies.
///
/// Zero-length lines report 0.0.
pub fn linear_reference(line: &LineString<f64>, point: &Point<f64>) -> f64 {
    line.line_locate_point(point)
        .filter(|f| f.is_finite())
        .unwrap_or(0.0)
}

/// Point at `fraction` of the way along the line, clamped to its endpoints.
pub fn interpolate(line: &LineString<f64>, fraction: f64) -> Option<Point<f64>> {
    line.line_interpolate_point(fraction.clamp(0.0, 1.0))
}

/// Project a point onto a line.
pub fn project(line: &LineString<f64>, point: &Point<f64>) -> Projection {
    let linear_reference = linear_reference(line, point);
    let snapped = interpolate(line, linear_reference)
        .or_else(|| line.points().next())
        .unwrap_or(*point);

    Projection {
        linear_reference,
        snapped,
    }
}

// =============================================================================
// Side of Street
// =============================================================================

/// Orient a line so it runs south-to-north, or west-to-east when both endpoints
/// share a latitude. Borrowed when the stored order is already canonical.
pub fn canonical_direction(line: &LineString<f64>) -> Cow<'_, LineString<f64>> {
    let (Some(first), Some(last)) = (line.0.first(), line.0.last()) else {
        return Cow::Borrowed(line);
    };

    let reversed = first.y > last.y || (first.y == last.y && first.x > last.x);
    if reversed {
        let mut coords = line.0.clone();
        coords.reverse();
        Cow::Owned(LineString::new(coords))
    } else {
        Cow::Borrowed(line)
    }
}

/// Which side of the canonically-directed line the point falls on.
///
/// The local tangent is taken between the points at `lr - tangent_offset` and
/// `lr + tangent_offset` of the point's projection. The sign of the 2D cross product
/// of (point - tangent start) and the tangent picks the side; zero is `Left`.
pub fn side_of(point: &Point<f64>, line: &LineString<f64>, tangent_offset: f64) -> Side {
    let canonical = canonical_direction(line);
    let lr = linear_reference(&canonical, point);

    let (Some(start), Some(stop)) = (
        interpolate(&canonical, lr - tangent_offset),
        interpolate(&canonical, lr + tangent_offset),
    ) else {
        return Side::Left;
    };

    let (tx, ty) = (stop.x() - start.x(), stop.y() - start.y());
    let (vx, vy) = (point.x() - start.x(), point.y() - start.y());
    let cross = vx * ty - vy * tx;

    if cross <= 0.0 {
        Side::Left
    } else {
        Side::Right
    }
}

// =============================================================================
// Containment and Bounds
// =============================================================================

/// True when every part of the line lies inside the area or on its boundary.
///
/// Each line piece is cut wherever it meets a ring edge; the endpoints and the
/// midpoint of every resulting sub-piece must then intersect the area.
pub fn covered_by(line: &LineString<f64>, area: &MultiPolygon<f64>) -> bool {
    let edges: Vec<Line<f64>> = area
        .iter()
        .flat_map(|polygon| {
            std::iter::once(polygon.exterior())
                .chain(polygon.interiors().iter())
                .flat_map(|ring| ring.lines())
        })
        .collect();

    let inside = |c: Coord<f64>| {
        let p = Point::from(c);
        area.iter().any(|polygon| p.intersects(polygon))
    };

    line.lines().all(|piece| {
        let mut cuts = vec![0.0, 1.0];
        for edge in &edges {
            match line_intersection(piece, *edge) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    cuts.push(fraction_along(&piece, intersection));
                }
                Some(LineIntersection::Collinear { intersection }) => {
                    cuts.push(fraction_along(&piece, intersection.start));
                    cuts.push(fraction_along(&piece, intersection.end));
                }
                None => {}
            }
        }
        cuts.sort_by(|a, b| a.total_cmp(b));

        inside(piece.start)
            && inside(piece.end)
            && cuts.windows(2).all(|w| inside(coord_at(&piece, (w[0] + w[1]) / 2.0)))
    })
}

fn fraction_along(piece: &Line<f64>, c: Coord<f64>) -> f64 {
    let (dx, dy) = (piece.dx(), piece.dy());
    let t = if dx.abs() >= dy.abs() {
        if dx == 0.0 {
            return 0.0;
        }
        (c.x - piece.start.x) / dx
    } else {
        (c.y - piece.start.y) / dy
    };
    t.clamp(0.0, 1.0)
}

fn coord_at(piece: &Line<f64>, t: f64) -> Coord<f64> {
    Coord {
        x: piece.start.x + piece.dx() * t,
        y: piece.start.y + piece.dy() * t,
    }
}

/// Bounding box enclosing every vertex of the given lines. `None` for no vertices.
pub fn compute_bounds<'a>(lines: impl IntoIterator<Item = &'a LineString<f64>>) -> Option<Rect<f64>> {
    let mut min = Coord { x: f64::MAX, y: f64::MAX };
    let mut max = Coord { x: f64::MIN, y: f64::MIN };
    let mut any = false;

    for c in lines.into_iter().flat_map(|l| l.coords()) {
        min.x = min.x.min(c.x);
        min.y = min.y.min(c.y);
        max.x = max.x.max(c.x);
        max.y = max.y.max(c.y);
        any = true;
    }

    any.then(|| Rect::new(min, max))
}

// =============================================================================
// Unit Tests
// =============================================================================
