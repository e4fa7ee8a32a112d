//! Geometry helpers shared by the conflation stages.
//!
//! Distances and lengths are measured in metres. WGS84 input is mapped
//! into a local equirectangular frame first; planar input is used as-is.

use geo::{Closest, ClosestPoint, Line};
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};

use crate::types::{Point, Polyline};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// How input coordinates are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Longitude/latitude in degrees.
    #[default]
    Wgs84,
    /// Easting/northing already in metres.
    Planar,
}

/// Linear map from input coordinates into a local metre frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    scale_x: f64,
    scale_y: f64,
}

impl Projection {
    /// Identity mapping, for planar input.
    pub const IDENTITY: Self = Self {
        scale_x: 1.0,
        scale_y: 1.0,
    };

    /// Build a projection for `points`, centred on their mean latitude.
    pub fn for_points<'a>(
        system: CoordinateSystem,
        points: impl IntoIterator<Item = &'a Point>,
    ) -> Self {
        match system {
            CoordinateSystem::Planar => Self::IDENTITY,
            CoordinateSystem::Wgs84 => {
                let (sum, count) = points
                    .into_iter()
                    .fold((0.0_f64, 0_usize), |(s, n), p| (s + p.y, n + 1));
                #[allow(clippy::cast_precision_loss)]
                let mean_lat = if count == 0 { 0.0 } else { sum / count as f64 };
                let meters_per_degree = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;
                Self {
                    scale_x: meters_per_degree * mean_lat.to_radians().cos(),
                    scale_y: meters_per_degree,
                }
            }
        }
    }

    /// Map a point into the metre frame.
    #[must_use]
    pub fn project(self, p: Point) -> geo::Coord<f64> {
        geo::Coord {
            x: p.x * self.scale_x,
            y: p.y * self.scale_y,
        }
    }

    /// Distance in metres between two points.
    #[must_use]
    pub fn distance(self, a: Point, b: Point) -> f64 {
        let pa = self.project(a);
        let pb = self.project(b);
        (pa.x - pb.x).hypot(pa.y - pb.y)
    }
}

/// Exact-equality key for a coordinate, usable in hash maps.
///
/// `-0.0` and `0.0` map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoordKey {
    x_bits: u64,
    y_bits: u64,
}

impl CoordKey {
    /// Key for a point.
    #[must_use]
    pub fn from_point(p: Point) -> Self {
        // -0.0 + 0.0 == +0.0
        Self {
            x_bits: (p.x + 0.0).to_bits(),
            y_bits: (p.y + 0.0).to_bits(),
        }
    }
}

/// Drop consecutive identical points.
#[must_use]
pub fn dedup_consecutive(points: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for &p in points {
        if out
            .last()
            .is_none_or(|last| CoordKey::from_point(*last) != CoordKey::from_point(p))
        {
            out.push(p);
        }
    }
    out
}

/// Measured length of a polyline in metres.
#[must_use]
pub fn polyline_length(polyline: &Polyline, projection: Projection) -> f64 {
    polyline
        .points()
        .windows(2)
        .map(|w| projection.distance(w[0], w[1]))
        .sum()
}

/// Cut the stretch between two fractions of a polyline's measured length.
///
/// Fractions are clamped to `[0, 1]` and swapped if reversed. Interior
/// vertices inside the stretch are kept; the cut ends are interpolated.
#[must_use]
pub fn slice_along(
    polyline: &Polyline,
    start_fraction: f64,
    end_fraction: f64,
    projection: Projection,
) -> Polyline {
    let pts = polyline.points();
    if pts.len() < 2 {
        return polyline.clone();
    }

    let mut cumulative = Vec::with_capacity(pts.len());
    let mut total = 0.0;
    cumulative.push(0.0);
    for w in pts.windows(2) {
        total += projection.distance(w[0], w[1]);
        cumulative.push(total);
    }
    if total <= 0.0 {
        return Polyline::new(dedup_consecutive(pts));
    }

    let a = start_fraction.clamp(0.0, 1.0);
    let b = end_fraction.clamp(0.0, 1.0);
    let (from, to) = if a <= b { (a * total, b * total) } else { (b * total, a * total) };

    let mut out = vec![interpolate(pts, &cumulative, from)];
    for (p, &d) in pts.iter().zip(&cumulative) {
        if d > from && d < to {
            out.push(*p);
        }
    }
    out.push(interpolate(pts, &cumulative, to));
    Polyline::new(dedup_consecutive(&out))
}

/// The point at measured distance `d` along `pts`.
fn interpolate(pts: &[Point], cumulative: &[f64], d: f64) -> Point {
    for i in 0..pts.len() - 1 {
        let (c0, c1) = (cumulative[i], cumulative[i + 1]);
        if d <= c1 {
            let span = c1 - c0;
            if span <= 0.0 {
                return pts[i];
            }
            let t = ((d - c0) / span).clamp(0.0, 1.0);
            let (p0, p1) = (pts[i], pts[i + 1]);
            return Point::new(t.mul_add(p1.x - p0.x, p0.x), t.mul_add(p1.y - p0.y, p0.y));
        }
    }
    pts[pts.len() - 1]
}

/// Find the closest point on a `geo::Line` to a query `geo::Point`.
fn closest_coord_on_line(line: &Line<f64>, query: &geo::Point<f64>) -> geo::Coord<f64> {
    match line.closest_point(query) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p.into(),
        Closest::Indeterminate => line.start,
    }
}

/// A projected segment tagged with its start offset along the indexed
/// parts, taken in order.
type IndexedSegment = GeomWithData<Line<f64>, f64>;

/// R\*-tree over the segments of a (possibly multi-part) linestring, for
/// point-to-line distance queries in metres.
pub struct SegmentIndex {
    tree: RTree<IndexedSegment>,
    projection: Projection,
}

impl SegmentIndex {
    /// Index every segment of every part.
    #[must_use]
    pub fn new(parts: &[Polyline], projection: Projection) -> Self {
        let mut segments: Vec<IndexedSegment> = Vec::new();
        let mut offset = 0.0;
        for part in parts {
            for w in part.points().windows(2) {
                let line = Line::new(projection.project(w[0]), projection.project(w[1]));
                segments.push(GeomWithData::new(line, offset));
                offset += (line.end.x - line.start.x).hypot(line.end.y - line.start.y);
            }
        }
        Self {
            tree: RTree::bulk_load(segments),
            projection,
        }
    }

    /// `true` when no segment was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Distance in metres from `p` to the nearest indexed segment.
    ///
    /// The minimum is taken across all parts.
    #[must_use]
    pub fn distance(&self, p: Point) -> Option<f64> {
        let query = geo::Point::from(self.projection.project(p));
        let nearest = self.tree.nearest_neighbor_iter(&query).next()?;
        let on_line = closest_coord_on_line(nearest.geom(), &query);
        Some((on_line.x - query.x()).hypot(on_line.y - query.y()))
    }

    /// Offset in metres, along the indexed parts taken in order, of the
    /// indexed point nearest to `p`.
    #[must_use]
    pub fn locate(&self, p: Point) -> Option<f64> {
        let query = geo::Point::from(self.projection.project(p));
        let nearest = self.tree.nearest_neighbor_iter(&query).next()?;
        let line = nearest.geom();
        let on_line = closest_coord_on_line(line, &query);
        Some(nearest.data + (on_line.x - line.start.x).hypot(on_line.y - line.start.y))
    }

    /// Root-mean-square over every vertex of `candidate` of its distance
    /// to the indexed linestring.
    ///
    /// Returns `None` if the index or the candidate is empty.
    #[must_use]
    pub fn rmsd(&self, candidate: &Polyline) -> Option<f64> {
        if candidate.is_empty() {
            return None;
        }
        let mut sum_sq = 0.0;
        for &p in candidate.points() {
            let d = self.distance(p)?;
            sum_sq += d * d;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = candidate.len() as f64;
        Some((sum_sq / n).sqrt())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line(points: &[(f64, f64)]) -> Polyline {
        Polyline::new(points.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    #[test]
    fn coord_key_normalizes_negative_zero() {
        assert_eq!(
            CoordKey::from_point(Point::new(-0.0, 1.0)),
            CoordKey::from_point(Point::new(0.0, 1.0))
        );
    }

    #[test]
    fn dedup_removes_only_consecutive() {
        let pts = line(&[(0.0, 0.0), (0.0, 0.0), (1.0, 0.0), (0.0, 0.0)]).into_points();
        let out = dedup_consecutive(&pts);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn planar_length() {
        let l = line(&[(0.0, 0.0), (3.0, 4.0), (3.0, 10.0)]);
        assert!((polyline_length(&l, Projection::IDENTITY) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn wgs84_degree_of_latitude_is_about_111km() {
        let l = line(&[(0.0, 0.0), (0.0, 1.0)]);
        let proj = Projection::for_points(CoordinateSystem::Wgs84, l.points());
        let len = polyline_length(&l, proj);
        assert!((len - 111_195.0).abs() < 100.0, "got {len}");
    }

    #[test]
    fn wgs84_longitude_shrinks_with_latitude() {
        let l = line(&[(0.0, 60.0), (1.0, 60.0)]);
        let proj = Projection::for_points(CoordinateSystem::Wgs84, l.points());
        let len = polyline_length(&l, proj);
        assert!((len - 55_597.0).abs() < 100.0, "got {len}");
    }

    #[test]
    fn slice_middle_interpolates_ends() {
        let l = line(&[(0.0, 0.0), (10.0, 0.0), (20.0, 0.0)]);
        let s = slice_along(&l, 0.25, 0.75, Projection::IDENTITY);
        assert_eq!(s.points(), line(&[(5.0, 0.0), (10.0, 0.0), (15.0, 0.0)]).points());
    }

    #[test]
    fn slice_full_range_is_identity() {
        let l = line(&[(0.0, 0.0), (10.0, 0.0), (10.0, 5.0)]);
        let s = slice_along(&l, 0.0, 1.0, Projection::IDENTITY);
        assert_eq!(s, l);
    }

    #[test]
    fn slice_reversed_fractions_swap() {
        let l = line(&[(0.0, 0.0), (10.0, 0.0)]);
        let s = slice_along(&l, 0.8, 0.2, Projection::IDENTITY);
        assert_eq!(s.points(), line(&[(2.0, 0.0), (8.0, 0.0)]).points());
    }

    #[test]
    fn segment_index_distance_to_nearest_part() {
        let parts = vec![
            line(&[(0.0, 0.0), (10.0, 0.0)]),
            line(&[(0.0, 100.0), (10.0, 100.0)]),
        ];
        let index = SegmentIndex::new(&parts, Projection::IDENTITY);
        let d = index.distance(Point::new(5.0, 90.0)).unwrap();
        assert!((d - 10.0).abs() < 1e-9);
    }

    #[test]
    fn locate_measures_along_parts_in_order() {
        let parts = vec![
            line(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]),
            line(&[(20.0, 10.0), (30.0, 10.0)]),
        ];
        let index = SegmentIndex::new(&parts, Projection::IDENTITY);
        assert!((index.locate(Point::new(4.0, -3.0)).unwrap() - 4.0).abs() < 1e-9);
        assert!((index.locate(Point::new(12.0, 5.0)).unwrap() - 15.0).abs() < 1e-9);
        assert!((index.locate(Point::new(25.0, 12.0)).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn rmsd_of_exact_copy_is_zero() {
        let target = line(&[(0.0, 0.0), (500.0, 0.0), (1000.0, 0.0)]);
        let index = SegmentIndex::new(std::slice::from_ref(&target), Projection::IDENTITY);
        assert!(index.rmsd(&target).unwrap() < 1e-9);
    }

    #[test]
    fn rmsd_of_offset_copy_is_offset() {
        let target = line(&[(0.0, 0.0), (1000.0, 0.0)]);
        let offset = line(&[(0.0, 50.0), (1000.0, 50.0)]);
        let index = SegmentIndex::new(std::slice::from_ref(&target), Projection::IDENTITY);
        assert!((index.rmsd(&offset).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rmsd_on_empty_index_is_none() {
        let index = SegmentIndex::new(&[], Projection::IDENTITY);
        assert!(index.is_empty());
        assert!(index.rmsd(&line(&[(0.0, 0.0), (1.0, 0.0)])).is_none());
    }
}
