//! Shared types for the conflation engine.
//!
//! Records in this module are plain serializable values. Geometry is held
//! as [`Point`]/[`Polyline`] and converted to `geo` types at the boundary
//! of the modules that need geometric algorithms.

use serde::{Deserialize, Serialize};

use crate::assign::DisputePolicy;
use crate::geometry::CoordinateSystem;
use crate::store::StoreError;

/// A 2D point: longitude/latitude in degrees, or easting/northing in
/// metres, depending on [`CoordinateSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Longitude or easting.
    pub x: f64,
    /// Latitude or northing.
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point in coordinate units.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point in coordinate units.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Convert to a `geo::Coord`.
    #[must_use]
    pub const fn to_coord(self) -> geo::Coord<f64> {
        geo::Coord {
            x: self.x,
            y: self.y,
        }
    }

    /// Convert from a `geo::Coord`.
    #[must_use]
    pub const fn from_coord(c: geo::Coord<f64>) -> Self {
        Self::new(c.x, c.y)
    }
}

/// A sequence of connected points forming a linestring.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polyline(Vec<Point>);

impl Polyline {
    /// Create a new polyline from a vector of points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Returns `true` if the polyline has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of points in the polyline.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the first point, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Point> {
        self.0.first()
    }

    /// Returns the last point, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Point> {
        self.0.last()
    }

    /// Returns a slice of all points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Consumes the polyline and returns the underlying vector of points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.0
    }

    /// `true` when the polyline has at least one segment.
    #[must_use]
    pub fn is_linear(&self) -> bool {
        self.0.len() >= 2
    }

    /// Convert to a `geo::LineString`.
    #[must_use]
    pub fn to_line_string(&self) -> geo::LineString<f64> {
        geo::LineString::new(self.0.iter().map(|p| p.to_coord()).collect())
    }

    /// Convert from a `geo::LineString`.
    #[must_use]
    pub fn from_line_string(line: &geo::LineString<f64>) -> Self {
        Self(line.coords().map(|c| Point::from_coord(*c)).collect())
    }
}

/// A half-open measured range `[start, end)` along a reference geometry.
///
/// Offsets are in the same units as [`ReferenceGeometry::length`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Offset where the range begins.
    pub start: f64,
    /// Offset where the range ends. Never less than `start`.
    pub end: f64,
}

impl Section {
    /// Create a section, swapping the bounds if they are reversed.
    #[must_use]
    pub fn new(start: f64, end: f64) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Measured length of the section.
    #[must_use]
    pub fn length(self) -> f64 {
        self.end - self.start
    }

    /// Midpoint offset.
    #[must_use]
    pub fn midpoint(self) -> f64 {
        (self.start + self.end) / 2.0
    }

    /// Whether the two ranges share a stretch of positive length.
    ///
    /// Ranges that only touch at a boundary do not overlap.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely within this section.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The shared stretch of the two ranges, if it has positive length.
    #[must_use]
    pub fn intersection(self, other: Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Self { start, end })
    }

    /// Clamp both bounds into `[0, length]`.
    #[must_use]
    pub fn clamp_to(self, length: f64) -> Self {
        let upper = length.max(0.0);
        Self {
            start: self.start.clamp(0.0, upper),
            end: self.end.clamp(0.0, upper),
        }
    }

    /// The parts of this section not covered by any of `cuts`.
    ///
    /// Pieces are returned in ascending order. `cuts` may overlap each
    /// other and may extend past this section.
    #[must_use]
    pub fn subtract(self, cuts: &[Self]) -> Vec<Self> {
        let mut ordered: Vec<Self> = cuts
            .iter()
            .filter_map(|c| c.intersection(self))
            .collect();
        ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut pieces = Vec::new();
        let mut cursor = self.start;
        for cut in ordered {
            if cut.start > cursor {
                pieces.push(Self {
                    start: cursor,
                    end: cut.start,
                });
            }
            cursor = cursor.max(cut.end);
        }
        if cursor < self.end {
            pieces.push(Self {
                start: cursor,
                end: self.end,
            });
        }
        pieces
    }
}

/// A canonical reference street segment. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGeometry {
    /// Reference id (e.g. a SharedStreets reference id).
    pub id: String,
    /// Id of the underlying geometry shared by forward/back references.
    #[serde(default)]
    pub geometry_id: Option<String>,
    /// Declared length. Section offsets are measured against this.
    pub length: f64,
    /// Whether the street is traversable in one direction only.
    #[serde(default)]
    pub one_way: bool,
    /// Geometry, used when slicing assigned sections for export.
    #[serde(default)]
    pub geometry: Polyline,
}

/// An edge of the network being conflated. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMapEdge {
    /// Edge id in the target network.
    pub id: String,
    /// Edge length in metres.
    pub length: f64,
    /// Whether the edge is traversable in one direction only.
    #[serde(default)]
    pub one_way: bool,
    /// Geometry; more than one part when the edge is a multi-linestring.
    pub geometry: Vec<Polyline>,
}

/// One traversal of a target edge within a [`TargetMapPath`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    /// The traversed edge.
    pub edge_id: String,
    /// `false` when the path runs against the edge's digitized direction.
    pub is_forward: bool,
}

/// An ordered sequence of target edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMapPath {
    /// Path id.
    pub id: u64,
    /// Edges in traversal order.
    pub steps: Vec<PathStep>,
}

/// A slice of a reference geometry hypothesized to correspond to a
/// target edge, produced by an external map matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// The matched reference.
    pub reference_id: String,
    /// Matched range along the reference; the whole reference when absent.
    #[serde(default)]
    pub section: Option<Section>,
    /// Candidate geometry, digitized in the reference's direction.
    pub geometry: Polyline,
}

/// All match candidates for one edge of one target map path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCandidates {
    /// Owning path.
    pub path_id: u64,
    /// Position of the edge within the path.
    pub path_edge_idx: usize,
    /// Whether the path traverses the edge in its digitized direction.
    pub is_forward: bool,
    /// The target edge.
    pub edge: TargetMapEdge,
    /// Candidates in matcher order. The index is the candidate id.
    pub candidates: Vec<MatchCandidate>,
}

/// One candidate selected into a [`ChosenMatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenSegment {
    /// Index of the candidate within [`EdgeCandidates::candidates`].
    pub candidate_idx: usize,
    /// The matched reference.
    pub reference_id: String,
    /// Claimed range along the reference.
    pub section: Section,
    /// Measured candidate length in metres.
    pub length: f64,
    /// First point of the candidate geometry.
    pub from: Point,
    /// Last point of the candidate geometry.
    pub to: Point,
}

/// The selected decomposition of match candidates for one target edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenMatch {
    /// Owning path.
    pub path_id: u64,
    /// Position of the edge within the path.
    pub path_edge_idx: usize,
    /// Target edge id.
    pub edge_id: String,
    /// Whether the path traverses the edge in its digitized direction.
    pub is_forward: bool,
    /// Chosen candidates, in chain order.
    pub segments: Vec<ChosenSegment>,
    /// Merged chosen geometry; one part unless the chains are disjoint.
    pub geometry: Vec<Polyline>,
    /// Length of the target edge in metres.
    pub target_edge_length: f64,
    /// Length of the merged chosen geometry in metres.
    pub merged_length: f64,
    /// `merged_length - target_edge_length`.
    pub length_difference: f64,
    /// `merged_length / target_edge_length`, or 0 for a zero-length edge.
    pub length_ratio: f64,
}

/// Flat ChosenMatch row, one per chosen segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChosenMatchRow {
    pub path_id: u64,
    pub path_edge_idx: usize,
    pub edge_id: String,
    pub is_forward: bool,
    pub edge_shst_match_idx: usize,
    pub shst_reference_id: String,
    pub section_start: f64,
    pub section_end: f64,
}

impl ChosenMatch {
    /// Key of this match in the chosen-match table.
    #[must_use]
    pub const fn key(&self) -> EdgeKey {
        EdgeKey {
            path_id: self.path_id,
            path_edge_idx: self.path_edge_idx,
        }
    }

    /// One row per chosen segment.
    #[must_use]
    pub fn rows(&self) -> Vec<ChosenMatchRow> {
        self.segments
            .iter()
            .map(|s| ChosenMatchRow {
                path_id: self.path_id,
                path_edge_idx: self.path_edge_idx,
                edge_id: self.edge_id.clone(),
                is_forward: self.is_forward,
                edge_shst_match_idx: s.candidate_idx,
                shst_reference_id: s.reference_id.clone(),
                section_start: s.section.start,
                section_end: s.section.end,
            })
            .collect()
    }
}

/// Identifies one edge slot of one target map path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub path_id: u64,
    pub path_edge_idx: usize,
}

/// Identifies one chosen segment: a single claim on a reference section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    pub path_id: u64,
    pub path_edge_idx: usize,
    pub candidate_idx: usize,
}

/// A chosen match competing for a disputed reference section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claimant {
    pub path_id: u64,
    pub path_edge_idx: usize,
    pub edge_id: String,
    pub is_forward: bool,
    /// Candidate index within the edge (`edgeShstMatchIdx`).
    pub candidate_idx: usize,
    /// The claimant's full claimed range.
    pub section: Section,
    /// Whether the start boundary may shrink without disconnecting the path.
    pub start_trimmable: bool,
    /// Whether the end boundary may shrink without disconnecting the path.
    pub end_trimmable: bool,
}

impl Claimant {
    /// The claim this claimant stands for.
    #[must_use]
    pub const fn key(&self) -> ClaimKey {
        ClaimKey {
            path_id: self.path_id,
            path_edge_idx: self.path_edge_idx,
            candidate_idx: self.candidate_idx,
        }
    }
}

/// A reference section claimed by chosen matches of more than one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    /// Sequential id, unique within one run.
    pub id: u64,
    /// The disputed reference.
    pub reference_id: String,
    /// Geometry id of the reference, when known.
    pub geometry_id: Option<String>,
    /// Hull of the overlapping stretches.
    pub section: Section,
    /// At least two claimants, ordered by [`ClaimKey`].
    pub claimants: Vec<Claimant>,
}

/// Flat Dispute row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRow {
    pub dispute_id: u64,
    pub reference_geometry_id: Option<String>,
    pub shst_reference_id: String,
    pub disputed_section_start: f64,
    pub disputed_section_end: f64,
}

/// Flat Claimant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimantRow {
    pub dispute_id: u64,
    pub path_id: u64,
    pub path_edge_idx: usize,
    pub edge_id: String,
    pub is_forward: bool,
    pub edge_shst_match_idx: usize,
    pub section_start: f64,
    pub section_end: f64,
}

impl Dispute {
    /// The dispute row.
    #[must_use]
    pub fn row(&self) -> DisputeRow {
        DisputeRow {
            dispute_id: self.id,
            reference_geometry_id: self.geometry_id.clone(),
            shst_reference_id: self.reference_id.clone(),
            disputed_section_start: self.section.start,
            disputed_section_end: self.section.end,
        }
    }

    /// One row per claimant.
    #[must_use]
    pub fn claimant_rows(&self) -> Vec<ClaimantRow> {
        self.claimants
            .iter()
            .map(|c| ClaimantRow {
                dispute_id: self.id,
                path_id: c.path_id,
                path_edge_idx: c.path_edge_idx,
                edge_id: c.edge_id.clone(),
                is_forward: c.is_forward,
                edge_shst_match_idx: c.candidate_idx,
                section_start: c.section.start,
                section_end: c.section.end,
            })
            .collect()
    }
}

/// Final, conflict-free assignment of a reference section to a target edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedMatch {
    pub shst_reference_id: String,
    pub target_map_edge_id: String,
    pub is_forward: bool,
    pub section_start: f64,
    pub section_end: f64,
    /// Path the assignment came from.
    pub path_id: u64,
    /// Position of the edge within that path.
    pub path_edge_idx: usize,
}

impl AssignedMatch {
    /// The assigned range.
    #[must_use]
    pub fn section(&self) -> Section {
        Section::new(self.section_start, self.section_end)
    }
}

/// Configuration for a conflation run.
///
/// All parameters have defaults; [`validate`](Self::validate) rejects
/// values the engine cannot work with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflationConfig {
    /// How input coordinates are interpreted.
    pub coordinate_system: CoordinateSystem,

    /// Coordinate distance under which two chosen segment endpoints are
    /// treated as connected.
    pub snap_tolerance: f64,

    /// Assigned sub-ranges shorter than this are dropped as slivers.
    pub min_assigned_length: f64,

    /// How disputed sections are awarded when trimmability does not
    /// decide.
    pub dispute_policy: DisputePolicy,
}

impl ConflationConfig {
    /// Default [`snap_tolerance`](Self::snap_tolerance).
    pub const DEFAULT_SNAP_TOLERANCE: f64 = 1e-9;

    /// Default [`min_assigned_length`](Self::min_assigned_length).
    pub const DEFAULT_MIN_ASSIGNED_LENGTH: f64 = 0.001;

    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`ConflationError::InvalidConfig`] if a tolerance is
    /// negative or not finite.
    pub fn validate(&self) -> Result<(), ConflationError> {
        if !self.snap_tolerance.is_finite() || self.snap_tolerance < 0.0 {
            return Err(ConflationError::InvalidConfig(format!(
                "snap_tolerance must be finite and >= 0, got {}",
                self.snap_tolerance
            )));
        }
        if !self.min_assigned_length.is_finite() || self.min_assigned_length < 0.0 {
            return Err(ConflationError::InvalidConfig(format!(
                "min_assigned_length must be finite and >= 0, got {}",
                self.min_assigned_length
            )));
        }
        Ok(())
    }
}

impl Default for ConflationConfig {
    fn default() -> Self {
        Self {
            coordinate_system: CoordinateSystem::default(),
            snap_tolerance: Self::DEFAULT_SNAP_TOLERANCE,
            min_assigned_length: Self::DEFAULT_MIN_ASSIGNED_LENGTH,
            dispute_policy: DisputePolicy::default(),
        }
    }
}

/// Errors that abort a conflation stage.
///
/// Data-integrity problems in individual records are not errors; they
/// are logged and the record is skipped or marked unmatched.
#[derive(Debug, thiserror::Error)]
pub enum ConflationError {
    /// Run configuration is invalid.
    #[error("invalid conflation configuration: {0}")]
    InvalidConfig(String),

    /// The blackboard rejected an operation.
    #[error("blackboard error: {0}")]
    Store(#[from] StoreError),

    /// The same path edge slot appeared twice in one run.
    #[error("duplicate candidates for path {path_id} edge {path_edge_idx}")]
    DuplicateEdge { path_id: u64, path_edge_idx: usize },

    /// Shortest-path reconstruction failed on a match subgraph.
    #[error("shortest path reconstruction failed: {0}")]
    ShortestPath(String),
}
