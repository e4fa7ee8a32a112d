//! Match assignment: resolve disputes into a non-overlapping result.
//!
//! # Arbitration
//!
//! Every claimant ends up with one contiguous range of its claim. A claim
//! lying strictly inside another path's claim yields entirely, since the
//! outer claim cannot give up the middle of its range. The remaining
//! claimants are chained by start offset, and each overlapping neighbour
//! pair settles one handover boundary inside its overlap. Each side of the
//! pair is classified by where the overlap falls on its claim:
//!
//! | side      | may yield when                         |
//! |-----------|----------------------------------------|
//! | start     | `start_trimmable`                      |
//! | end       | `end_trimmable`                        |
//! | whole     | both flags                             |
//! | interior  | never (yielding would split the claim) |
//!
//! A side that may not yield is a "needer". A lone needer keeps the whole
//! overlap. With no needers the [`DisputePolicy::both_trimmable`] rule
//! decides; with two the [`DisputePolicy::neither_trimmable`] rule does.
//! Boundaries only move forward along the chain, so a claimant squeezed
//! between its neighbours can lose everything but is never split.
//!
//! A final sweep per reference clips anything still overlapping (claims
//! of the same path are never disputed), so the output ranges for every
//! reference are pairwise disjoint.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dispute::{Claim, claims_by_reference};
use crate::types::{AssignedMatch, ChosenMatch, ClaimKey, Claimant, Dispute, EdgeKey, Section};

/// How an overlap is settled between equally placed neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TieBreak {
    /// The overlap is split at its midpoint; the claim starting earlier
    /// keeps the first half.
    #[default]
    Midpoint,
    /// The longest claim wins; ties go to the lowest claim key.
    LongestClaim,
    /// The lowest claim key (path id, then edge index) wins.
    FirstPath,
}

/// Arbitration rules for disputes that trimmability does not settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputePolicy {
    /// Rule when every claimant may yield.
    pub both_trimmable: TieBreak,
    /// Rule when more than one claimant cannot yield.
    pub neither_trimmable: TieBreak,
}

impl Default for DisputePolicy {
    fn default() -> Self {
        Self {
            both_trimmable: TieBreak::Midpoint,
            neither_trimmable: TieBreak::LongestClaim,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Start,
    End,
    Whole,
    Interior,
}

impl Side {
    fn of(claim: Section, disputed: Section) -> Self {
        let at_start = disputed.start <= claim.start;
        let at_end = disputed.end >= claim.end;
        match (at_start, at_end) {
            (true, true) => Self::Whole,
            (true, false) => Self::Start,
            (false, true) => Self::End,
            (false, false) => Self::Interior,
        }
    }

    const fn can_yield(self, claimant: &Claimant) -> bool {
        match self {
            Self::Start => claimant.start_trimmable,
            Self::End => claimant.end_trimmable,
            Self::Whole => claimant.start_trimmable && claimant.end_trimmable,
            Self::Interior => false,
        }
    }
}

/// Build the final assignment from chosen matches and annotated disputes.
///
/// Pieces shorter than `min_assigned_length` left over after a claimant
/// yields are dropped. Output is ordered by reference id, then start.
#[must_use]
pub fn assign_matches(
    chosen: &BTreeMap<EdgeKey, ChosenMatch>,
    disputes: &[Dispute],
    policy: DisputePolicy,
    min_assigned_length: f64,
) -> Vec<AssignedMatch> {
    let mut lost: HashMap<ClaimKey, Vec<Section>> = HashMap::new();
    for dispute in disputes {
        for (key, section) in arbitrate(dispute, policy) {
            lost.entry(key).or_default().push(section);
        }
    }

    let mut assigned = Vec::new();
    for (reference_id, claims) in claims_by_reference(chosen.values()) {
        let mut pieces: Vec<(Section, &Claim)> = Vec::new();
        for claim in &claims {
            match lost.get(&claim.key) {
                None => pieces.push((claim.section, claim)),
                Some(cuts) => pieces.extend(
                    claim
                        .section
                        .subtract(cuts)
                        .into_iter()
                        .filter(|p| p.length() >= min_assigned_length && p.length() > 0.0)
                        .map(|p| (p, claim)),
                ),
            }
        }
        pieces.sort_by(|a, b| {
            a.0.start
                .total_cmp(&b.0.start)
                .then_with(|| a.1.key.cmp(&b.1.key))
        });

        let mut cursor = f64::NEG_INFINITY;
        for (piece, claim) in pieces {
            let section = if piece.start < cursor {
                warn!(
                    reference_id = %reference_id,
                    path_id = claim.key.path_id,
                    path_edge_idx = claim.key.path_edge_idx,
                    start = piece.start,
                    end = piece.end,
                    clipped_to = cursor,
                    "overlapping claims after arbitration; clipping"
                );
                Section::new(cursor.min(piece.end), piece.end)
            } else {
                piece
            };
            if section.length() <= 0.0 {
                continue;
            }
            cursor = cursor.max(section.end);
            assigned.push(AssignedMatch {
                shst_reference_id: reference_id.clone(),
                target_map_edge_id: claim.edge_id.clone(),
                is_forward: claim.is_forward,
                section_start: section.start,
                section_end: section.end,
                path_id: claim.key.path_id,
                path_edge_idx: claim.key.path_edge_idx,
            });
        }
    }

    debug!(
        disputes = disputes.len(),
        yielding_claims = lost.len(),
        assigned = assigned.len(),
        "assigned matches"
    );
    assigned
}

/// The sub-ranges each claimant loses in one dispute.
///
/// A claim strictly inside another path's claim yields entirely. The rest
/// form a chain ordered by start (and so by end); every claimant keeps one
/// contiguous range between the boundaries settled with its neighbours.
fn arbitrate(dispute: &Dispute, policy: DisputePolicy) -> Vec<(ClaimKey, Section)> {
    let mut order: Vec<&Claimant> = dispute.claimants.iter().collect();
    order.sort_by(|a, b| {
        a.section
            .start
            .total_cmp(&b.section.start)
            .then_with(|| a.section.end.total_cmp(&b.section.end))
            .then_with(|| a.key().cmp(&b.key()))
    });

    let mut losses = Vec::new();
    let mut chain: Vec<&Claimant> = Vec::new();
    for c in order {
        let inside = |same_path: bool| {
            chain
                .iter()
                .any(|d| d.section.end > c.section.end && (d.path_id == c.path_id) == same_path)
        };
        if inside(false) {
            losses.push((c.key(), c.section));
        } else if !inside(true) {
            // Same-path containment is left to the final sweep.
            chain.push(c);
        }
    }

    let mut floor = f64::NEG_INFINITY;
    for (i, c) in chain.iter().enumerate() {
        let ceiling = chain
            .get(i + 1)
            .map_or(c.section.end, |next| boundary(c, next, policy).max(floor));
        let kept_start = c.section.start.max(floor);
        let kept_end = c.section.end.min(ceiling);
        if kept_end > kept_start {
            let kept = Section::new(kept_start, kept_end);
            losses.extend(c.section.subtract(&[kept]).into_iter().map(|p| (c.key(), p)));
        } else {
            losses.push((c.key(), c.section));
        }
        floor = floor.max(ceiling);
    }
    losses
}

/// Where the claim of `a` hands over to `b`, which starts no earlier and
/// ends no earlier.
///
/// The result lies inside their overlap: its end when `a` keeps the
/// overlap, its start when `b` does.
fn boundary(a: &Claimant, b: &Claimant, policy: DisputePolicy) -> f64 {
    let Some(overlap) = a.section.intersection(b.section) else {
        return a.section.end;
    };
    if a.path_id == b.path_id {
        return overlap.end;
    }

    let a_yields = Side::of(a.section, overlap).can_yield(a);
    let b_yields = Side::of(b.section, overlap).can_yield(b);
    let rule = match (a_yields, b_yields) {
        (false, true) => return overlap.end,
        (true, false) => return overlap.start,
        (true, true) => policy.both_trimmable,
        (false, false) => policy.neither_trimmable,
    };
    let a_keeps = match rule {
        TieBreak::Midpoint => return overlap.midpoint(),
        TieBreak::LongestClaim => b
            .section
            .length()
            .total_cmp(&a.section.length())
            .then_with(|| a.key().cmp(&b.key()))
            .is_lt(),
        TieBreak::FirstPath => a.key() < b.key(),
    };
    if a_keeps { overlap.end } else { overlap.start }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{ChosenSegment, Point};

    fn chosen(path_id: u64, reference_id: &str, start: f64, end: f64) -> ChosenMatch {
        ChosenMatch {
            path_id,
            path_edge_idx: 0,
            edge_id: format!("edge-{path_id}"),
            is_forward: true,
            segments: vec![ChosenSegment {
                candidate_idx: 0,
                reference_id: reference_id.to_owned(),
                section: Section::new(start, end),
                length: end - start,
                from: Point::default(),
                to: Point::default(),
            }],
            geometry: Vec::new(),
            target_edge_length: 0.0,
            merged_length: 0.0,
            length_difference: 0.0,
            length_ratio: 0.0,
        }
    }

    fn claimant(path_id: u64, start: f64, end: f64, trim: (bool, bool)) -> Claimant {
        Claimant {
            path_id,
            path_edge_idx: 0,
            edge_id: format!("edge-{path_id}"),
            is_forward: true,
            candidate_idx: 0,
            section: Section::new(start, end),
            start_trimmable: trim.0,
            end_trimmable: trim.1,
        }
    }

    /// Path 0 claims R [0,100], path 1 claims R [50,150].
    fn scenario(a_trim: (bool, bool), b_trim: (bool, bool), policy: DisputePolicy) -> Vec<(u64, f64, f64)> {
        let table: BTreeMap<EdgeKey, ChosenMatch> = [chosen(0, "R", 0.0, 100.0), chosen(1, "R", 50.0, 150.0)]
            .into_iter()
            .map(|m| (m.key(), m))
            .collect();
        let dispute = Dispute {
            id: 0,
            reference_id: "R".to_owned(),
            geometry_id: None,
            section: Section::new(50.0, 100.0),
            claimants: vec![claimant(0, 0.0, 100.0, a_trim), claimant(1, 50.0, 150.0, b_trim)],
        };
        assign_matches(&table, &[dispute], policy, 0.001)
            .into_iter()
            .map(|m| (m.path_id, m.section_start, m.section_end))
            .collect()
    }

    #[test]
    fn end_trimmable_claim_yields() {
        let out = scenario((false, true), (false, false), DisputePolicy::default());
        assert_eq!(out, [(0, 0.0, 50.0), (1, 50.0, 150.0)]);
    }

    #[test]
    fn start_trimmable_claim_yields() {
        let out = scenario((false, false), (true, false), DisputePolicy::default());
        assert_eq!(out, [(0, 0.0, 100.0), (1, 100.0, 150.0)]);
    }

    #[test]
    fn both_trimmable_splits_at_midpoint() {
        let out = scenario((true, true), (true, true), DisputePolicy::default());
        assert_eq!(out, [(0, 0.0, 75.0), (1, 75.0, 150.0)]);
    }

    #[test]
    fn neither_trimmable_longest_claim_then_first_path() {
        let out = scenario((false, false), (false, false), DisputePolicy::default());
        assert_eq!(out, [(0, 0.0, 100.0), (1, 100.0, 150.0)]);
    }

    #[test]
    fn policy_rules_are_configurable() {
        let policy = DisputePolicy {
            both_trimmable: TieBreak::FirstPath,
            neither_trimmable: TieBreak::Midpoint,
        };
        assert_eq!(
            scenario((true, true), (true, true), policy),
            [(0, 0.0, 100.0), (1, 100.0, 150.0)]
        );
        assert_eq!(
            scenario((false, false), (false, false), policy),
            [(0, 0.0, 75.0), (1, 75.0, 150.0)]
        );
    }

    #[test]
    fn undisputed_claims_are_kept_whole() {
        let table: BTreeMap<EdgeKey, ChosenMatch> = [chosen(0, "R", 0.0, 40.0), chosen(1, "S", 0.0, 0.0005)]
            .into_iter()
            .map(|m| (m.key(), m))
            .collect();
        let out = assign_matches(&table, &[], DisputePolicy::default(), 0.001);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].section(), Section::new(0.0, 40.0));
        assert_eq!(out[1].shst_reference_id, "S");
    }

    #[test]
    fn contained_claim_with_interior_dispute_keeps_its_range() {
        // Path 1 sits inside path 0; for path 0 the dispute is interior.
        let table: BTreeMap<EdgeKey, ChosenMatch> = [chosen(0, "R", 0.0, 100.0), chosen(1, "R", 40.0, 60.0)]
            .into_iter()
            .map(|m| (m.key(), m))
            .collect();
        let dispute = Dispute {
            id: 0,
            reference_id: "R".to_owned(),
            geometry_id: None,
            section: Section::new(40.0, 60.0),
            claimants: vec![
                claimant(0, 0.0, 100.0, (true, true)),
                claimant(1, 40.0, 60.0, (true, true)),
            ],
        };
        let out = assign_matches(&table, &[dispute], DisputePolicy::default(), 0.001);
        let ranges: Vec<_> = out.iter().map(|m| (m.path_id, m.section_start, m.section_end)).collect();
        assert_eq!(ranges, [(0, 0.0, 100.0)]);
    }

    #[test]
    fn same_path_overlap_is_clipped() {
        let mut m = chosen(0, "R", 0.0, 60.0);
        m.segments.push(ChosenSegment {
            candidate_idx: 1,
            reference_id: "R".to_owned(),
            section: Section::new(40.0, 100.0),
            length: 60.0,
            from: Point::default(),
            to: Point::default(),
        });
        let table = BTreeMap::from([(m.key(), m)]);
        let out = assign_matches(&table, &[], DisputePolicy::default(), 0.001);
        let ranges: Vec<_> = out.iter().map(|m| (m.section_start, m.section_end)).collect();
        assert_eq!(ranges, [(0.0, 60.0), (60.0, 100.0)]);
    }

    #[test]
    fn every_trimmability_permutation() {
        // (path 0 flags, path 1 flags, boundary). Path 0 can only yield at
        // its end and path 1 only at its start, so the other flag never
        // matters.
        let t = true;
        let f = false;
        let cases = [
            ((f, f), (f, f), 100.0),
            ((f, f), (f, t), 100.0),
            ((f, f), (t, f), 100.0),
            ((f, f), (t, t), 100.0),
            ((t, f), (f, f), 100.0),
            ((t, f), (f, t), 100.0),
            ((t, f), (t, f), 100.0),
            ((t, f), (t, t), 100.0),
            ((f, t), (f, f), 50.0),
            ((f, t), (f, t), 50.0),
            ((f, t), (t, f), 75.0),
            ((f, t), (t, t), 75.0),
            ((t, t), (f, f), 50.0),
            ((t, t), (f, t), 50.0),
            ((t, t), (t, f), 75.0),
            ((t, t), (t, t), 75.0),
        ];
        for (a, b, split) in cases {
            let out = scenario(a, b, DisputePolicy::default());
            assert_eq!(out, [(0, 0.0, split), (1, split, 150.0)], "a={a:?} b={b:?}");
        }
    }

    fn three_way(trim: [(bool, bool); 3]) -> Vec<(u64, f64, f64)> {
        let table: BTreeMap<EdgeKey, ChosenMatch> = [
            chosen(0, "R", 0.0, 100.0),
            chosen(1, "R", 50.0, 150.0),
            chosen(2, "R", 90.0, 200.0),
        ]
        .into_iter()
        .map(|m| (m.key(), m))
        .collect();
        let dispute = Dispute {
            id: 0,
            reference_id: "R".to_owned(),
            geometry_id: None,
            section: Section::new(50.0, 150.0),
            claimants: vec![
                claimant(0, 0.0, 100.0, trim[0]),
                claimant(1, 50.0, 150.0, trim[1]),
                claimant(2, 90.0, 200.0, trim[2]),
            ],
        };
        assign_matches(&table, &[dispute], DisputePolicy::default(), 0.001)
            .into_iter()
            .map(|m| (m.path_id, m.section_start, m.section_end))
            .collect()
    }

    #[test]
    fn three_way_dispute_hands_over_in_order() {
        let out = three_way([(true, true); 3]);
        assert_eq!(out, [(0, 0.0, 75.0), (1, 75.0, 120.0), (2, 120.0, 200.0)]);
    }

    #[test]
    fn squeezed_claimant_yields_whole_rather_than_splitting() {
        let out = three_way([(false, false), (true, true), (false, false)]);
        assert_eq!(out, [(0, 0.0, 100.0), (2, 100.0, 200.0)]);
    }

    #[test]
    fn annotated_three_way_dispute_keeps_one_piece_per_claim() {
        use crate::dispute::identify_disputes;
        use crate::trim::annotate_trimmability;

        let table: BTreeMap<EdgeKey, ChosenMatch> = [
            chosen(0, "R", 0.0, 100.0),
            chosen(1, "R", 50.0, 150.0),
            chosen(2, "R", 90.0, 200.0),
        ]
        .into_iter()
        .map(|m| (m.key(), m))
        .collect();
        let mut disputes = identify_disputes(&table, &BTreeMap::new());
        annotate_trimmability(&mut disputes, &table, 0.5);
        let out = assign_matches(&table, &disputes, DisputePolicy::default(), 0.001);

        let paths: std::collections::BTreeSet<u64> = out.iter().map(|m| m.path_id).collect();
        assert_eq!(paths.len(), out.len(), "a claim came back in pieces: {out:?}");
        for pair in out.windows(2) {
            assert!(pair[0].section_end <= pair[1].section_start, "{out:?}");
        }
        let covered: f64 = out.iter().map(|m| m.section().length()).sum();
        assert!((covered - 200.0).abs() < 1e-9);
    }
}
