//! Dispute identification.
//!
//! A dispute is a stretch of one reference geometry claimed by chosen
//! segments of two or more different target map paths. Overlaps between
//! claims are clustered so that every overlapping pair of claims lands
//! in exactly one dispute.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{ChosenMatch, ClaimKey, Claimant, Dispute, EdgeKey, ReferenceGeometry, Section};

/// One chosen segment viewed as a claim on its reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub key: ClaimKey,
    pub edge_id: String,
    pub is_forward: bool,
    pub reference_id: String,
    pub section: Section,
}

impl Claim {
    /// Claimant record for this claim, with trimmability not yet known.
    #[must_use]
    pub fn claimant(&self) -> Claimant {
        Claimant {
            path_id: self.key.path_id,
            path_edge_idx: self.key.path_edge_idx,
            edge_id: self.edge_id.clone(),
            is_forward: self.is_forward,
            candidate_idx: self.key.candidate_idx,
            section: self.section,
            start_trimmable: false,
            end_trimmable: false,
        }
    }
}

/// Every chosen segment as a claim, grouped by reference id.
///
/// Within a reference, claims are ordered by section start, then key.
#[must_use]
pub fn claims_by_reference<'a>(
    chosen: impl IntoIterator<Item = &'a ChosenMatch>,
) -> BTreeMap<String, Vec<Claim>> {
    let mut by_reference: BTreeMap<String, Vec<Claim>> = BTreeMap::new();
    for m in chosen {
        for segment in &m.segments {
            by_reference
                .entry(segment.reference_id.clone())
                .or_default()
                .push(Claim {
                    key: ClaimKey {
                        path_id: m.path_id,
                        path_edge_idx: m.path_edge_idx,
                        candidate_idx: segment.candidate_idx,
                    },
                    edge_id: m.edge_id.clone(),
                    is_forward: m.is_forward,
                    reference_id: segment.reference_id.clone(),
                    section: segment.section,
                });
        }
    }
    for claims in by_reference.values_mut() {
        claims.sort_by(|a, b| {
            a.section
                .start
                .total_cmp(&b.section.start)
                .then_with(|| a.key.cmp(&b.key))
        });
    }
    by_reference
}

/// Find every disputed stretch across all chosen matches.
///
/// Disputes are ordered by reference id, then section start, and numbered
/// sequentially from zero. Claimants within a dispute are ordered by
/// claim key. Trimmability flags are left unset.
#[must_use]
pub fn identify_disputes(
    chosen: &BTreeMap<EdgeKey, ChosenMatch>,
    references: &BTreeMap<String, ReferenceGeometry>,
) -> Vec<Dispute> {
    let mut disputes = Vec::new();
    for (reference_id, claims) in claims_by_reference(chosen.values()) {
        let geometry_id = references
            .get(&reference_id)
            .and_then(|r| r.geometry_id.clone());
        for (section, members) in overlap_clusters(&claims) {
            let mut claimants: Vec<Claimant> = members.iter().map(|&i| claims[i].claimant()).collect();
            claimants.sort_by_key(Claimant::key);
            disputes.push(Dispute {
                id: 0,
                reference_id: reference_id.clone(),
                geometry_id: geometry_id.clone(),
                section,
                claimants,
            });
        }
    }
    for (dispute, id) in disputes.iter_mut().zip(0_u64..) {
        dispute.id = id;
    }
    debug!(disputes = disputes.len(), "identified disputes");
    disputes
}

/// Cluster the cross-path overlaps among `claims` on one reference.
///
/// Returns each cluster's hull and the indices of the claims involved.
fn overlap_clusters(claims: &[Claim]) -> Vec<(Section, Vec<usize>)> {
    let mut overlaps: Vec<(Section, usize, usize)> = Vec::new();
    for (i, a) in claims.iter().enumerate() {
        for (j, b) in claims.iter().enumerate().skip(i + 1) {
            if a.key.path_id == b.key.path_id {
                continue;
            }
            if let Some(shared) = a.section.intersection(b.section) {
                overlaps.push((shared, i, j));
            }
        }
    }
    overlaps.sort_by(|x, y| {
        x.0.start
            .total_cmp(&y.0.start)
            .then_with(|| x.0.end.total_cmp(&y.0.end))
    });

    let mut clusters: Vec<(Section, Vec<usize>)> = Vec::new();
    for (shared, i, j) in overlaps {
        match clusters.last_mut() {
            Some((hull, members)) if shared.start < hull.end => {
                hull.end = hull.end.max(shared.end);
                members.extend([i, j]);
            }
            _ => clusters.push((shared, vec![i, j])),
        }
    }
    for (_, members) in &mut clusters {
        members.sort_unstable();
        members.dedup();
    }
    clusters
}
