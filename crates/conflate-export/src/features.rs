//! GeoJSON serializers.
//!
//! Sections are rendered by slicing the reference geometry: a section
//! `[start, end]` maps to the fractions `start / length` and
//! `end / length` of the reference's measured line. Records whose
//! reference is unknown or has no usable geometry are still emitted,
//! with a `null` geometry, so the feature count always matches the
//! record count.

use std::collections::BTreeMap;

use conflate_engine::geometry::{Projection, slice_along};
use conflate_engine::{
    AssignedMatch, ChosenMatch, CoordinateSystem, Dispute, Polyline, ReferenceGeometry, Section,
};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value, feature::Id};
use serde::Serialize;
use serde_json::json;

use crate::ExportError;

/// GeoJSON geometry for one or more polylines.
///
/// A single part becomes a `LineString`, several parts a
/// `MultiLineString`. Parts with fewer than two points are dropped;
/// `None` if nothing is left.
#[must_use]
pub fn line_geometry(parts: &[Polyline]) -> Option<Geometry> {
    let mut lines: Vec<Vec<Vec<f64>>> = parts
        .iter()
        .filter(|p| p.is_linear())
        .map(|p| p.points().iter().map(|pt| vec![pt.x, pt.y]).collect())
        .collect();
    match lines.len() {
        0 => None,
        1 => lines.pop().map(|line| Geometry::new(Value::LineString(line))),
        _ => Some(Geometry::new(Value::MultiLineString(lines))),
    }
}

/// The stretch of `reference` covered by `section`.
fn reference_slice(
    reference: &ReferenceGeometry,
    section: Section,
    system: CoordinateSystem,
) -> Option<Polyline> {
    if !reference.geometry.is_linear() {
        return None;
    }
    let (start, end) = if reference.length > 0.0 {
        (section.start / reference.length, section.end / reference.length)
    } else {
        (0.0, 1.0)
    };
    let projection = Projection::for_points(system, reference.geometry.points());
    let slice = slice_along(&reference.geometry, start, end, projection);
    slice.is_linear().then_some(slice)
}

fn section_geometry(
    references: &BTreeMap<String, ReferenceGeometry>,
    reference_id: &str,
    section: Section,
    system: CoordinateSystem,
) -> Option<Geometry> {
    references
        .get(reference_id)
        .and_then(|r| reference_slice(r, section, system))
        .and_then(|slice| line_geometry(std::slice::from_ref(&slice)))
}

fn properties<T: Serialize>(row: &T) -> Result<JsonObject, ExportError> {
    Ok(serde_json::from_value(serde_json::to_value(row)?)?)
}

fn feature(id: Option<u64>, geometry: Option<Geometry>, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry,
        id: id.map(|n| Id::Number(n.into())),
        properties: Some(properties),
        foreign_members: None,
    }
}

const fn collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// One feature per assigned match, sliced from its reference.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if a row cannot be converted to
/// properties.
pub fn assigned_to_geojson(
    assigned: &[AssignedMatch],
    references: &BTreeMap<String, ReferenceGeometry>,
    system: CoordinateSystem,
) -> Result<FeatureCollection, ExportError> {
    let features = assigned
        .iter()
        .map(|m| {
            let geometry = section_geometry(references, &m.shst_reference_id, m.section(), system);
            Ok(feature(None, geometry, properties(m)?))
        })
        .collect::<Result<_, ExportError>>()?;
    Ok(collection(features))
}

/// One feature per chosen match, carrying the merged chosen geometry,
/// coverage metadata, and the per-segment rows under `segments`.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if a row cannot be converted.
pub fn chosen_to_geojson<'a>(
    chosen: impl IntoIterator<Item = &'a ChosenMatch>,
) -> Result<FeatureCollection, ExportError> {
    let features = chosen
        .into_iter()
        .map(|m| {
            let props = json!({
                "targetMapPathId": m.path_id,
                "targetMapPathIdx": m.path_edge_idx,
                "targetMapEdgeId": m.edge_id,
                "isForward": m.is_forward,
                "targetEdgeLength": m.target_edge_length,
                "mergedLength": m.merged_length,
                "lengthDifference": m.length_difference,
                "lengthRatio": m.length_ratio,
                "segments": m.rows(),
            });
            Ok(feature(None, line_geometry(&m.geometry), serde_json::from_value(props)?))
        })
        .collect::<Result<_, ExportError>>()?;
    Ok(collection(features))
}

/// One feature per dispute, sliced from the disputed reference, with the
/// claimant rows under `claimants`.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if a row cannot be converted.
pub fn disputes_to_geojson(
    disputes: &[Dispute],
    references: &BTreeMap<String, ReferenceGeometry>,
    system: CoordinateSystem,
) -> Result<FeatureCollection, ExportError> {
    let features = disputes
        .iter()
        .map(|d| {
            let mut props = properties(&d.row())?;
            let claimants = d
                .claimants
                .iter()
                .zip(d.claimant_rows())
                .map(|(c, row)| {
                    let mut entry = properties(&row)?;
                    entry.insert("startTrimmable".to_owned(), json!(c.start_trimmable));
                    entry.insert("endTrimmable".to_owned(), json!(c.end_trimmable));
                    Ok(serde_json::Value::Object(entry))
                })
                .collect::<Result<Vec<_>, ExportError>>()?;
            props.insert("claimants".to_owned(), serde_json::Value::Array(claimants));
            let geometry = section_geometry(references, &d.reference_id, d.section, system);
            Ok(feature(Some(d.id), geometry, props))
        })
        .collect::<Result<_, ExportError>>()?;
    Ok(collection(features))
}
