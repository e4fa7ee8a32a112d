//! Trimmability analysis.
//!
//! A claimant's boundary is trimmable when shrinking the claim at that
//! boundary cannot open a gap in its path. That holds when no segment
//! of the same or an adjacent path edge meets the boundary point, or
//! when every segment meeting it lies on the same reference and overlaps
//! the claim, so it already carries the path past the boundary.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::types::{ChosenMatch, ClaimKey, Claimant, Dispute, EdgeKey, Point, Section};

/// A chosen segment located within its path.
#[derive(Debug, Clone)]
struct PathSegment {
    key: ClaimKey,
    reference_id: String,
    section: Section,
    from: Point,
    to: Point,
}

/// Set `start_trimmable`/`end_trimmable` on every claimant.
///
/// Points closer than `snap_tolerance` count as touching.
pub fn annotate_trimmability(
    disputes: &mut [Dispute],
    chosen: &BTreeMap<EdgeKey, ChosenMatch>,
    snap_tolerance: f64,
) {
    let by_path = segments_by_path(chosen);
    let mut trimmable = 0_usize;
    for dispute in disputes.iter_mut() {
        for claimant in &mut dispute.claimants {
            let Some(segments) = by_path.get(&claimant.path_id) else {
                warn!(
                    dispute_id = dispute.id,
                    path_id = claimant.path_id,
                    "claimant path has no chosen match"
                );
                continue;
            };
            let (start, end) = boundary_flags(claimant, segments, snap_tolerance);
            claimant.start_trimmable = start;
            claimant.end_trimmable = end;
            trimmable += usize::from(start) + usize::from(end);
        }
    }
    debug!(
        disputes = disputes.len(),
        trimmable_boundaries = trimmable,
        "annotated trimmability"
    );
}

fn segments_by_path(chosen: &BTreeMap<EdgeKey, ChosenMatch>) -> HashMap<u64, Vec<PathSegment>> {
    let mut by_path: HashMap<u64, Vec<PathSegment>> = HashMap::new();
    for m in chosen.values() {
        let entry = by_path.entry(m.path_id).or_default();
        entry.extend(m.segments.iter().map(|s| PathSegment {
            key: ClaimKey {
                path_id: m.path_id,
                path_edge_idx: m.path_edge_idx,
                candidate_idx: s.candidate_idx,
            },
            reference_id: s.reference_id.clone(),
            section: s.section,
            from: s.from,
            to: s.to,
        }));
    }
    by_path
}

/// `(start_trimmable, end_trimmable)` for one claimant.
fn boundary_flags(claimant: &Claimant, segments: &[PathSegment], snap_tolerance: f64) -> (bool, bool) {
    let key = claimant.key();
    let Some(own) = segments.iter().find(|s| s.key == key) else {
        warn!(?key, "claimant has no chosen segment");
        return (false, false);
    };

    let reference_id = own.reference_id.as_str();
    let neighbours: Vec<&PathSegment> = segments
        .iter()
        .filter(|s| s.key != key && s.key.path_edge_idx.abs_diff(key.path_edge_idx) <= 1)
        .collect();

    let free_at = |point: Point| {
        neighbours
            .iter()
            .filter(|s| {
                s.from.distance(point) <= snap_tolerance || s.to.distance(point) <= snap_tolerance
            })
            .all(|s| s.reference_id == reference_id && s.section.overlaps(claimant.section))
    };
    (free_at(own.from), free_at(own.to))
}
