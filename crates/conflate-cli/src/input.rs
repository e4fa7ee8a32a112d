//! Input readers: GeoJSON references and target edges, NDJSON candidate
//! records, and JSON path definitions.
//!
//! Malformed files are errors. Individual records with unusable geometry
//! are kept with empty geometry and left to the engine, which logs and
//! skips them.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use conflate_engine::geometry::{Projection, polyline_length};
use conflate_engine::types::{MatchCandidate, PathStep, TargetMapEdge};
use conflate_engine::{
    CoordinateSystem, EdgeCandidates, LinearGeometry, Point, Polyline, ReferenceGeometry, Section,
    TargetMapPath,
};
use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One line of the candidates file: a path edge and its matches.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateRecord {
    target_map_path_edge: Feature,
    #[serde(default)]
    shst_matches: Vec<Feature>,
}

/// A path definition as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    pub id: u64,
    pub edges: Vec<StepRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub edge_id: String,
    #[serde(default = "forward")]
    pub is_forward: bool,
}

const fn forward() -> bool {
    true
}

impl From<PathRecord> for TargetMapPath {
    fn from(record: PathRecord) -> Self {
        Self {
            id: record.id,
            steps: record
                .edges
                .into_iter()
                .map(|s| PathStep {
                    edge_id: s.edge_id,
                    is_forward: s.is_forward,
                })
                .collect(),
        }
    }
}

impl From<&TargetMapPath> for PathRecord {
    fn from(path: &TargetMapPath) -> Self {
        Self {
            id: path.id,
            edges: path
                .steps
                .iter()
                .map(|s| StepRecord {
                    edge_id: s.edge_id.clone(),
                    is_forward: s.is_forward,
                })
                .collect(),
        }
    }
}

/// Read a GeoJSON FeatureCollection.
pub fn read_features(path: &Path) -> Result<Vec<Feature>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let collection: FeatureCollection = serde_json::from_str(&text)
        .with_context(|| format!("parsing {} as a GeoJSON FeatureCollection", path.display()))?;
    Ok(collection.features)
}

/// Linear geometry of a feature; `None` for missing or non-linear
/// geometry.
pub fn linear_geometry(feature: &Feature) -> Result<Option<LinearGeometry>> {
    let Some(geometry) = &feature.geometry else {
        return Ok(None);
    };
    Ok(match &geometry.value {
        Value::LineString(line) => Some(LinearGeometry::LineString(polyline(line)?)),
        Value::MultiLineString(lines) => Some(LinearGeometry::MultiLineString(
            lines.iter().map(|l| polyline(l)).collect::<Result<_>>()?,
        )),
        _ => None,
    })
}

fn polyline(positions: &[Vec<f64>]) -> Result<Polyline> {
    positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(Point::new(*x, *y)),
            _ => bail!("position {p:?} has fewer than two coordinates"),
        })
        .collect::<Result<Vec<_>>>()
        .map(Polyline::new)
}

fn parts(geometry: Option<LinearGeometry>) -> Vec<Polyline> {
    match geometry {
        Some(LinearGeometry::LineString(line)) => vec![line],
        Some(LinearGeometry::MultiLineString(parts)) => parts,
        None => Vec::new(),
    }
}

fn measured_length(parts: &[Polyline], system: CoordinateSystem) -> f64 {
    let projection = Projection::for_points(system, parts.iter().flat_map(Polyline::points));
    parts.iter().map(|p| polyline_length(p, projection)).sum()
}

fn string_property(feature: &Feature, key: &str) -> Option<String> {
    feature
        .property(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

fn feature_id(feature: &Feature) -> Option<String> {
    match &feature.id {
        Some(Id::String(s)) => Some(s.clone()),
        Some(Id::Number(n)) => Some(n.to_string()),
        None => None,
    }
}

/// Read reference geometries from a FeatureCollection.
///
/// The id comes from the `id` property (or the feature id), the length
/// from `length` (or the measured geometry).
pub fn read_references(path: &Path, system: CoordinateSystem) -> Result<Vec<ReferenceGeometry>> {
    let mut references = Vec::new();
    for (idx, feature) in read_features(path)?.iter().enumerate() {
        let Some(id) = string_property(feature, "id").or_else(|| feature_id(feature)) else {
            bail!("{}: reference feature {idx} has no id", path.display());
        };
        let geometry = parts(linear_geometry(feature).with_context(|| format!("reference {id}"))?);
        if geometry.len() > 1 {
            warn!(reference_id = %id, parts = geometry.len(), "reference is multi-part; using the first part");
        }
        let geometry = geometry.into_iter().next().unwrap_or_default();
        if !geometry.is_linear() {
            warn!(reference_id = %id, "reference has no linear geometry");
        }
        let length = feature
            .property("length")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(|| measured_length(std::slice::from_ref(&geometry), system));
        references.push(ReferenceGeometry {
            geometry_id: string_property(feature, "geometryId"),
            one_way: feature
                .property("oneWay")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            id,
            length,
            geometry,
        });
    }
    debug!(path = %path.display(), references = references.len(), "read references");
    Ok(references)
}

/// Read target map edges from a FeatureCollection.
pub fn read_edges(path: &Path, system: CoordinateSystem) -> Result<Vec<TargetMapEdge>> {
    read_features(path)?
        .iter()
        .enumerate()
        .map(|(idx, feature)| {
            let id = string_property(feature, "id")
                .or_else(|| feature_id(feature))
                .unwrap_or_else(|| idx.to_string());
            edge_from_feature(feature, id, system)
        })
        .collect()
}

fn edge_from_feature(feature: &Feature, id: String, system: CoordinateSystem) -> Result<TargetMapEdge> {
    let geometry = parts(linear_geometry(feature).with_context(|| format!("edge {id}"))?);
    let length = feature
        .property("length")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or_else(|| measured_length(&geometry, system));
    Ok(TargetMapEdge {
        one_way: feature
            .property("oneWay")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        id,
        length,
        geometry,
    })
}

/// Read newline-delimited candidate records.
pub fn read_candidates(path: &Path, system: CoordinateSystem) -> Result<Vec<EdgeCandidates>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut edges = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: CandidateRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid candidate record", path.display(), line_no + 1))?;
        edges.push(
            candidates_from_record(record, system)
                .with_context(|| format!("{}:{}", path.display(), line_no + 1))?,
        );
    }
    debug!(path = %path.display(), edges = edges.len(), "read candidates");
    Ok(edges)
}

fn candidates_from_record(record: CandidateRecord, system: CoordinateSystem) -> Result<EdgeCandidates> {
    let feature = &record.target_map_path_edge;
    let Some(path_id) = feature.property("targetMapPathId").and_then(serde_json::Value::as_u64) else {
        bail!("targetMapPathId is missing or not an unsigned integer");
    };
    let Some(path_edge_idx) = feature
        .property("targetMapPathIdx")
        .and_then(serde_json::Value::as_u64)
        .and_then(|i| usize::try_from(i).ok())
    else {
        bail!("targetMapPathIdx is missing or not an unsigned integer");
    };
    let id = string_property(feature, "targetMapEdgeId")
        .or_else(|| feature_id(feature))
        .unwrap_or_else(|| format!("{path_id}:{path_edge_idx}"));
    let is_forward = feature
        .property("isForward")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true);
    let edge = edge_from_feature(feature, id, system)?;

    let mut candidates = Vec::with_capacity(record.shst_matches.len());
    for (idx, m) in record.shst_matches.iter().enumerate() {
        let Some(reference_id) = string_property(m, "shstReferenceId") else {
            bail!("match {idx} has no shstReferenceId");
        };
        let section = match m.property("section") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let bounds: [f64; 2] = serde_json::from_value(value.clone())
                    .with_context(|| format!("match {idx}: section must be [start, end]"))?;
                Some(Section::new(bounds[0], bounds[1]))
            }
        };
        let geometry = parts(linear_geometry(m).with_context(|| format!("match {idx}"))?);
        candidates.push(MatchCandidate {
            reference_id,
            section,
            geometry: geometry.into_iter().next().unwrap_or_default(),
        });
    }

    Ok(EdgeCandidates {
        path_id,
        path_edge_idx,
        is_forward,
        edge,
        candidates,
    })
}

/// Read path definitions: a JSON array of `{id, edges: [{edgeId, isForward}]}`.
pub fn read_paths(path: &Path) -> Result<Vec<TargetMapPath>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let records: Vec<PathRecord> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(records.into_iter().map(TargetMapPath::from).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn candidate_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "c.ndjson",
            concat!(
                r#"{"targetMapPathEdge":{"type":"Feature","properties":{"targetMapPathId":3,"targetMapPathIdx":1,"targetMapEdgeId":"e7","isForward":false},"#,
                r#""geometry":{"type":"LineString","coordinates":[[0,0],[3,4]]}},"#,
                r#""shstMatches":[{"type":"Feature","properties":{"shstReferenceId":"R","section":[10,5]},"#,
                r#""geometry":{"type":"LineString","coordinates":[[0,0],[3,4]]}}]}"#,
                "\n\n"
            ),
        );
        let edges = read_candidates(&path, CoordinateSystem::Planar).unwrap();
        assert_eq!(edges.len(), 1);
        let e = &edges[0];
        assert_eq!((e.path_id, e.path_edge_idx, e.is_forward), (3, 1, false));
        assert_eq!(e.edge.id, "e7");
        assert!((e.edge.length - 5.0).abs() < 1e-12);
        assert_eq!(e.candidates[0].section, Some(Section::new(5.0, 10.0)));
    }

    #[test]
    fn missing_path_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "c.ndjson",
            r#"{"targetMapPathEdge":{"type":"Feature","properties":{},"geometry":null},"shstMatches":[]}"#,
        );
        let err = read_candidates(&path, CoordinateSystem::Planar).unwrap_err();
        assert!(format!("{err:#}").contains("targetMapPathId"));
    }

    #[test]
    fn references_fall_back_to_feature_id_and_measured_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "r.geojson",
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","id":"R1","properties":{"oneWay":true},"geometry":{"type":"LineString","coordinates":[[0,0],[0,2]]}}]}"#,
        );
        let refs = read_references(&path, CoordinateSystem::Planar).unwrap();
        assert_eq!(refs[0].id, "R1");
        assert!(refs[0].one_way);
        assert!((refs[0].length - 2.0).abs() < 1e-12);
    }

    #[test]
    fn path_definitions_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "p.json", r#"[{"id":4,"edges":[{"edgeId":"a"},{"edgeId":"b","isForward":false}]}]"#);
        let paths = read_paths(&path).unwrap();
        assert_eq!(paths[0].steps.len(), 2);
        assert!(paths[0].steps[0].is_forward);
        assert!(!paths[0].steps[1].is_forward);
        assert_eq!(PathRecord::from(&paths[0]).edges[1].edge_id, "b");
    }
}
