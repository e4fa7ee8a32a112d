//! Per-edge match subgraphs.
//!
//! Each target map edge gets a weighted directed graph whose nodes are
//! the distinct candidate endpoints and whose edges are the candidates
//! themselves. A candidate's weight is its measured length times its
//! RMSD against the target edge, so cheap chains are both short and
//! geometrically faithful.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

use crate::geometry::{CoordKey, Projection, SegmentIndex, dedup_consecutive, polyline_length};
use crate::types::{EdgeCandidates, Point};

/// A candidate as an edge of the match subgraph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateEdge {
    /// Index into [`EdgeCandidates::candidates`].
    pub candidate_idx: usize,
    /// Measured candidate length in metres.
    pub length: f64,
    /// RMSD in metres against the target edge.
    pub rmsd: f64,
    /// `length * rmsd`.
    pub weight: f64,
}

/// Weighted graph of the competing candidates for one target edge.
#[derive(Debug, Clone)]
pub struct MatchSubgraph {
    /// Nodes are candidate endpoints, edges are candidates.
    pub graph: DiGraph<Point, CandidateEdge>,
    /// Frame in which lengths and RMSD were measured.
    pub projection: Projection,
}

/// Build the match subgraph for one target edge.
///
/// Returns `None` when the edge has no usable candidates. Candidates
/// with fewer than two distinct points are skipped with a warning.
#[must_use]
pub fn build_subgraph(edge: &EdgeCandidates, projection: Projection) -> Option<MatchSubgraph> {
    let index = SegmentIndex::new(&edge.edge.geometry, projection);
    if index.is_empty() {
        warn!(
            path_id = edge.path_id,
            path_edge_idx = edge.path_edge_idx,
            edge_id = %edge.edge.id,
            "target edge has no segments; weighting candidates by length only"
        );
    }

    let mut graph: DiGraph<Point, CandidateEdge> = DiGraph::new();
    let mut nodes: HashMap<CoordKey, NodeIndex> = HashMap::new();
    let mut node = |graph: &mut DiGraph<Point, CandidateEdge>, p: Point| {
        *nodes
            .entry(CoordKey::from_point(p))
            .or_insert_with(|| graph.add_node(p))
    };

    for (candidate_idx, candidate) in edge.candidates.iter().enumerate() {
        let (Some(&from), Some(&to)) = (candidate.geometry.first(), candidate.geometry.last()) else {
            warn!(
                edge_id = %edge.edge.id,
                candidate_idx,
                reference_id = %candidate.reference_id,
                "skipping candidate with empty geometry"
            );
            continue;
        };
        if dedup_consecutive(candidate.geometry.points()).len() < 2 {
            warn!(
                edge_id = %edge.edge.id,
                candidate_idx,
                reference_id = %candidate.reference_id,
                points = ?candidate.geometry.points(),
                "skipping degenerate candidate"
            );
            continue;
        }

        let length = polyline_length(&candidate.geometry, projection);
        let rmsd = index.rmsd(&candidate.geometry).unwrap_or(1.0);
        let a = node(&mut graph, from);
        let b = node(&mut graph, to);
        graph.add_edge(
            a,
            b,
            CandidateEdge {
                candidate_idx,
                length,
                rmsd,
                weight: length * rmsd,
            },
        );
    }

    if graph.edge_count() == 0 {
        debug!(
            path_id = edge.path_id,
            path_edge_idx = edge.path_edge_idx,
            "no usable candidates"
        );
        return None;
    }
    Some(MatchSubgraph { graph, projection })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{MatchCandidate, Polyline, TargetMapEdge};

    fn line(points: &[(f64, f64)]) -> Polyline {
        Polyline::new(points.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    fn candidate(reference_id: &str, points: &[(f64, f64)]) -> MatchCandidate {
        MatchCandidate {
            reference_id: reference_id.to_owned(),
            section: None,
            geometry: line(points),
        }
    }

    fn edge_with(candidates: Vec<MatchCandidate>) -> EdgeCandidates {
        EdgeCandidates {
            path_id: 1,
            path_edge_idx: 0,
            is_forward: true,
            edge: TargetMapEdge {
                id: "e".to_owned(),
                length: 100.0,
                one_way: true,
                geometry: vec![line(&[(0.0, 0.0), (100.0, 0.0)])],
            },
            candidates,
        }
    }

    #[test]
    fn shared_endpoints_become_shared_nodes() {
        let edge = edge_with(vec![
            candidate("r1", &[(0.0, 0.0), (50.0, 0.0)]),
            candidate("r2", &[(50.0, 0.0), (100.0, 0.0)]),
        ]);
        let sub = build_subgraph(&edge, Projection::IDENTITY).unwrap();
        assert_eq!(sub.graph.node_count(), 3);
        assert_eq!(sub.graph.edge_count(), 2);
    }

    #[test]
    fn weight_is_length_times_rmsd() {
        let edge = edge_with(vec![candidate("r1", &[(0.0, 10.0), (100.0, 10.0)])]);
        let sub = build_subgraph(&edge, Projection::IDENTITY).unwrap();
        let w = sub.graph.edge_weights().next().unwrap();
        assert!((w.length - 100.0).abs() < 1e-9);
        assert!((w.rmsd - 10.0).abs() < 1e-9);
        assert!((w.weight - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn exact_copy_has_zero_weight() {
        let edge = edge_with(vec![candidate("r1", &[(0.0, 0.0), (100.0, 0.0)])]);
        let sub = build_subgraph(&edge, Projection::IDENTITY).unwrap();
        assert!(sub.graph.edge_weights().next().unwrap().weight.abs() < 1e-12);
    }

    #[test]
    fn degenerate_candidates_are_skipped() {
        let edge = edge_with(vec![
            candidate("empty", &[]),
            candidate("point", &[(5.0, 5.0), (5.0, 5.0)]),
            candidate("ok", &[(0.0, 0.0), (100.0, 0.0)]),
        ]);
        let sub = build_subgraph(&edge, Projection::IDENTITY).unwrap();
        assert_eq!(sub.graph.edge_count(), 1);
        assert_eq!(sub.graph.edge_weights().next().unwrap().candidate_idx, 2);
    }

    #[test]
    fn no_usable_candidates_yields_none() {
        assert!(build_subgraph(&edge_with(Vec::new()), Projection::IDENTITY).is_none());
        let edge = edge_with(vec![candidate("point", &[(1.0, 1.0)])]);
        assert!(build_subgraph(&edge, Projection::IDENTITY).is_none());
    }
}
