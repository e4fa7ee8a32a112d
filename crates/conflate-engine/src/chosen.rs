//! Chosen-path construction.
//!
//! For each connected component of an edge's match subgraph, Dijkstra
//! finds the cheapest candidate chain from every source to every
//! reachable sink. The chains found from one source are merged into one
//! chosen path. Components that cover the same stretch of the target
//! edge compete, and only the one with the lowest length-weighted RMSD
//! survives. Chosen paths that merge into a single linestring are then
//! unioned. The result is the edge's [`ChosenMatch`].

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use tracing::{debug, warn};

use crate::geometry::{CoordKey, CoordinateSystem, Projection, SegmentIndex, polyline_length};
use crate::linemerge::merge_parts;
use crate::subgraph::{CandidateEdge, MatchSubgraph, build_subgraph};
use crate::types::{
    ChosenMatch, ChosenSegment, ConflationError, EdgeCandidates, Point, Polyline,
    ReferenceGeometry, Section,
};

type MatchGraph = DiGraph<Point, CandidateEdge>;

/// Candidates reached from one source, and their merged geometry.
#[derive(Debug, Clone)]
struct ChosenPath {
    candidates: Vec<usize>,
    geometry: Vec<Polyline>,
}

/// The chosen paths of one connected component, scored against the
/// target edge.
struct ComponentChoice {
    paths: Vec<ChosenPath>,
    /// Stretch of the target edge the component's candidates cover.
    span: Option<Section>,
    /// Length-weighted RMSD of the component's candidates.
    cost: f64,
}

/// Choose the best decomposition of `edge`'s candidates.
///
/// Returns `Ok(None)` when the edge has no usable candidates.
///
/// # Errors
///
/// Returns [`ConflationError::ShortestPath`] if a Dijkstra chain cannot
/// be reconstructed.
pub fn choose_match(
    edge: &EdgeCandidates,
    references: &BTreeMap<String, ReferenceGeometry>,
    system: CoordinateSystem,
) -> Result<Option<ChosenMatch>, ConflationError> {
    let projection = Projection::for_points(
        system,
        edge.edge
            .geometry
            .iter()
            .chain(edge.candidates.iter().map(|c| &c.geometry))
            .flat_map(Polyline::points),
    );
    let Some(subgraph) = build_subgraph(edge, projection) else {
        return Ok(None);
    };

    let target = SegmentIndex::new(&edge.edge.geometry, projection);
    let paths = union_mergeable(choose_paths(edge, &subgraph, &target)?);
    let mut candidates: Vec<usize> = Vec::new();
    for path in &paths {
        for &idx in &path.candidates {
            if !candidates.contains(&idx) {
                candidates.push(idx);
            }
        }
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let parts: Vec<Polyline> = candidates
        .iter()
        .map(|&idx| edge.candidates[idx].geometry.clone())
        .collect();
    let geometry = merge_parts(&parts);
    let segments: Vec<ChosenSegment> = candidates
        .iter()
        .map(|&idx| chosen_segment(edge, idx, references, projection))
        .collect();

    let target_edge_length = if edge.edge.length.is_finite() && edge.edge.length > 0.0 {
        edge.edge.length
    } else {
        edge.edge
            .geometry
            .iter()
            .map(|part| polyline_length(part, projection))
            .sum()
    };
    let merged_length: f64 = geometry
        .iter()
        .map(|part| polyline_length(part, projection))
        .sum();
    let length_ratio = if target_edge_length > 0.0 {
        merged_length / target_edge_length
    } else {
        0.0
    };

    debug!(
        path_id = edge.path_id,
        path_edge_idx = edge.path_edge_idx,
        candidates = edge.candidates.len(),
        chosen = segments.len(),
        parts = geometry.len(),
        "chose match"
    );

    Ok(Some(ChosenMatch {
        path_id: edge.path_id,
        path_edge_idx: edge.path_edge_idx,
        edge_id: edge.edge.id.clone(),
        is_forward: edge.is_forward,
        segments,
        geometry,
        target_edge_length,
        merged_length,
        length_difference: merged_length - target_edge_length,
        length_ratio,
    }))
}

/// One chosen path per (component, source), for the components that
/// survive [`select_components`].
fn choose_paths(
    edge: &EdgeCandidates,
    subgraph: &MatchSubgraph,
    target: &SegmentIndex,
) -> Result<Vec<ChosenPath>, ConflationError> {
    let graph = &subgraph.graph;
    let global_sources = terminals(graph, graph.node_indices(), Direction::Incoming);
    let global_sinks = terminals(graph, graph.node_indices(), Direction::Outgoing);

    let mut choices = Vec::new();
    for component in components(graph) {
        let mut sources = terminals(graph, component.iter().copied(), Direction::Incoming);
        if sources.is_empty() {
            sources.clone_from(&global_sources);
        }
        let mut sinks = terminals(graph, component.iter().copied(), Direction::Outgoing);
        if sinks.is_empty() {
            sinks.clone_from(&global_sinks);
        }

        let mut found = chains_from(edge, graph, &sources, &sinks)?;
        if found.is_empty() {
            // Wholly cyclic: walk from the lowest node to every other.
            let (&first, rest) = component
                .split_first()
                .ok_or_else(|| ConflationError::ShortestPath("empty component".to_owned()))?;
            found = chains_from(edge, graph, &[first], rest)?;
        }
        choices.push(score(edge, graph, target, found));
    }
    Ok(select_components(choices))
}

fn score(
    edge: &EdgeCandidates,
    graph: &MatchGraph,
    target: &SegmentIndex,
    paths: Vec<ChosenPath>,
) -> ComponentChoice {
    let chosen: HashSet<usize> = paths
        .iter()
        .flat_map(|p| p.candidates.iter().copied())
        .collect();
    let (weight, length) = graph
        .edge_weights()
        .filter(|w| chosen.contains(&w.candidate_idx))
        .fold((0.0, 0.0), |(w, l), e| (w + e.weight, l + e.length));
    let cost = if length > 0.0 { weight / length } else { f64::INFINITY };

    let offsets: Vec<f64> = chosen
        .iter()
        .flat_map(|&idx| edge.candidates[idx].geometry.points())
        .filter_map(|&p| target.locate(p))
        .collect();
    let span = offsets
        .iter()
        .copied()
        .reduce(f64::min)
        .zip(offsets.iter().copied().reduce(f64::max))
        .map(|(start, end)| Section::new(start, end));

    ComponentChoice { paths, span, cost }
}

/// Drop every component that covers the same stretch of the target as a
/// better-fitting one. Survivors keep their component order.
fn select_components(choices: Vec<ComponentChoice>) -> Vec<ChosenPath> {
    let mut order: Vec<usize> = (0..choices.len()).collect();
    order.sort_by(|&a, &b| {
        choices[a]
            .cost
            .total_cmp(&choices[b].cost)
            .then_with(|| a.cmp(&b))
    });

    let mut kept: Vec<usize> = Vec::new();
    for i in order {
        match kept.iter().find(|&&k| competes(choices[i].span, choices[k].span)) {
            Some(&k) => debug!(
                component = i,
                cost = choices[i].cost,
                kept = k,
                kept_cost = choices[k].cost,
                "dropping component covering the same stretch as a better fit"
            ),
            None => kept.push(i),
        }
    }

    choices
        .into_iter()
        .enumerate()
        .filter(|(i, _)| kept.contains(i))
        .flat_map(|(_, c)| c.paths)
        .collect()
}

/// Whether two spans share more than half of the shorter one.
fn competes(a: Option<Section>, b: Option<Section>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    a.intersection(b)
        .is_some_and(|shared| shared.length() > 0.5 * a.length().min(b.length()))
}

/// Run Dijkstra from each source and collect the chains to its sinks.
fn chains_from(
    edge: &EdgeCandidates,
    graph: &MatchGraph,
    sources: &[NodeIndex],
    sinks: &[NodeIndex],
) -> Result<Vec<ChosenPath>, ConflationError> {
    let mut paths = Vec::new();
    for &source in sources {
        let costs: HashMap<NodeIndex, f64> = dijkstra(graph, source, None, |e| e.weight().weight)
            .into_iter()
            .collect();
        let mut candidates: Vec<usize> = Vec::new();
        for &sink in sinks {
            if sink == source || !costs.contains_key(&sink) {
                continue;
            }
            for e in shortest_chain(graph, &costs, source, sink)? {
                let idx = graph[e].candidate_idx;
                if !candidates.contains(&idx) {
                    candidates.push(idx);
                }
            }
        }
        if candidates.is_empty() {
            continue;
        }
        let parts: Vec<Polyline> = candidates
            .iter()
            .map(|&idx| edge.candidates[idx].geometry.clone())
            .collect();
        paths.push(ChosenPath {
            candidates,
            geometry: merge_parts(&parts),
        });
    }
    Ok(paths)
}

/// Reconstruct the cheapest edge chain from `source` to `sink`.
///
/// Walks back from `sink`, stepping to a predecessor whose cost plus the
/// edge weight equals the current cost. The cheapest such predecessor
/// wins, then the lowest edge index.
fn shortest_chain(
    graph: &MatchGraph,
    costs: &HashMap<NodeIndex, f64>,
    source: NodeIndex,
    sink: NodeIndex,
) -> Result<Vec<EdgeIndex>, ConflationError> {
    let mut visited = HashSet::from([sink]);
    let mut chain = Vec::new();
    let mut current = sink;
    while current != source {
        let current_cost = costs.get(&current).copied().unwrap_or(f64::INFINITY);
        let tolerance = 1e-9 * current_cost.abs().max(1.0);
        let step = graph
            .edges_directed(current, Direction::Incoming)
            .filter(|e| !visited.contains(&e.source()))
            .filter_map(|e| {
                let prev_cost = costs.get(&e.source()).copied()?;
                ((prev_cost + e.weight().weight - current_cost).abs() <= tolerance)
                    .then_some((prev_cost, e.id(), e.source()))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let Some((_, edge_id, prev)) = step else {
            return Err(ConflationError::ShortestPath(format!(
                "reconstruction stalled at node {current:?} \
                 (source={source:?}, sink={sink:?}, chain len so far={})",
                chain.len()
            )));
        };
        chain.push(edge_id);
        visited.insert(prev);
        current = prev;
    }
    chain.reverse();
    Ok(chain)
}

/// Nodes among `nodes` with no edges in `direction` (ignoring self-loops).
fn terminals(
    graph: &MatchGraph,
    nodes: impl Iterator<Item = NodeIndex>,
    direction: Direction,
) -> Vec<NodeIndex> {
    nodes
        .filter(|&n| graph.neighbors_directed(n, direction).all(|m| m == n))
        .collect()
}

/// Weakly connected components, each sorted, ordered by lowest node.
fn components(graph: &MatchGraph) -> Vec<Vec<NodeIndex>> {
    let mut uf = UnionFind::<usize>::new(graph.node_count());
    for e in graph.edge_references() {
        uf.union(e.source().index(), e.target().index());
    }
    let mut groups: BTreeMap<usize, Vec<NodeIndex>> = BTreeMap::new();
    for n in graph.node_indices() {
        groups.entry(uf.find(n.index())).or_default().push(n);
    }
    let mut out: Vec<Vec<NodeIndex>> = groups.into_values().collect();
    out.sort_by_key(|c| c.first().copied());
    out
}

/// Merge chosen paths pairwise while their combined geometry reduces to
/// a single linestring.
fn union_mergeable(mut paths: Vec<ChosenPath>) -> Vec<ChosenPath> {
    'restart: loop {
        for i in 0..paths.len() {
            for j in i + 1..paths.len() {
                let parts: Vec<Polyline> = paths[i]
                    .geometry
                    .iter()
                    .chain(&paths[j].geometry)
                    .cloned()
                    .collect();
                let merged = merge_parts(&parts);
                if merged.len() != 1 {
                    continue;
                }

                let other = paths.remove(j);
                let other_leads = start_key(&other.geometry).is_some()
                    && start_key(&merged) == start_key(&other.geometry);
                let target = &mut paths[i];
                let (mut candidates, tail) = if other_leads {
                    (other.candidates, std::mem::take(&mut target.candidates))
                } else {
                    (std::mem::take(&mut target.candidates), other.candidates)
                };
                for idx in tail {
                    if !candidates.contains(&idx) {
                        candidates.push(idx);
                    }
                }
                target.candidates = candidates;
                target.geometry = merged;
                continue 'restart;
            }
        }
        return paths;
    }
}

fn start_key(geometry: &[Polyline]) -> Option<CoordKey> {
    geometry
        .first()
        .and_then(Polyline::first)
        .map(|p| CoordKey::from_point(*p))
}

fn chosen_segment(
    edge: &EdgeCandidates,
    idx: usize,
    references: &BTreeMap<String, ReferenceGeometry>,
    projection: Projection,
) -> ChosenSegment {
    let candidate = &edge.candidates[idx];
    let length = polyline_length(&candidate.geometry, projection);
    let section = match references.get(&candidate.reference_id) {
        Some(reference) => {
            let declared = candidate
                .section
                .unwrap_or_else(|| Section::new(0.0, reference.length));
            let clamped = declared.clamp_to(reference.length);
            if clamped != declared {
                warn!(
                    reference_id = %candidate.reference_id,
                    reference_length = reference.length,
                    start = declared.start,
                    end = declared.end,
                    "candidate section outside reference; clamped"
                );
            }
            clamped
        }
        None => {
            warn!(
                reference_id = %candidate.reference_id,
                edge_id = %edge.edge.id,
                "candidate names an unknown reference"
            );
            candidate
                .section
                .unwrap_or_else(|| Section::new(0.0, length))
        }
    };

    ChosenSegment {
        candidate_idx: idx,
        reference_id: candidate.reference_id.clone(),
        section,
        length,
        from: candidate.geometry.first().copied().unwrap_or_default(),
        to: candidate.geometry.last().copied().unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{MatchCandidate, TargetMapEdge};

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

    fn edge_with(target: &[(f64, f64)], candidates: Vec<MatchCandidate>) -> EdgeCandidates {
        let geometry = line(target);
        EdgeCandidates {
            path_id: 7,
            path_edge_idx: 2,
            is_forward: true,
            edge: TargetMapEdge {
                id: "edge".to_owned(),
                length: polyline_length(&geometry, Projection::IDENTITY),
                one_way: true,
                geometry: vec![geometry],
            },
            candidates,
        }
    }

    fn reference(id: &str, length: f64) -> (String, ReferenceGeometry) {
        (
            id.to_owned(),
            ReferenceGeometry {
                id: id.to_owned(),
                geometry_id: None,
                length,
                one_way: false,
                geometry: Polyline::default(),
            },
        )
    }

    fn chosen_indices(m: &ChosenMatch) -> Vec<usize> {
        m.segments.iter().map(|s| s.candidate_idx).collect()
    }

    #[test]
    fn exact_copy_beats_offset_candidate() {
        let edge = edge_with(
            &[(0.0, 0.0), (1000.0, 0.0)],
            vec![
                candidate("offset", &[(0.0, 50.0), (1000.0, 50.0)]),
                candidate("exact", &[(0.0, 0.0), (1000.0, 0.0)]),
            ],
        );
        let refs = BTreeMap::from([reference("offset", 1000.0), reference("exact", 1000.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [1]);
        assert_eq!(chosen.segments[0].reference_id, "exact");
        assert!(chosen.length_difference.abs() < 1e-9);
    }

    #[test]
    fn connected_detour_loses_to_exact_copy() {
        let edge = edge_with(
            &[(0.0, 0.0), (1000.0, 0.0)],
            vec![
                candidate("offset", &[(0.0, 0.0), (0.0, 50.0), (1000.0, 50.0), (1000.0, 0.0)]),
                candidate("exact", &[(0.0, 0.0), (1000.0, 0.0)]),
            ],
        );
        let chosen = choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [1]);
    }

    #[test]
    fn competing_components_keep_the_better_fit_per_stretch() {
        // Two rival copies of the first half, one copy of the second half
        // that does not touch either of them.
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![
                candidate("far", &[(0.0, 20.0), (45.0, 20.0)]),
                candidate("near", &[(0.0, 2.0), (45.0, 2.0)]),
                candidate("tail", &[(55.0, 5.0), (100.0, 5.0)]),
            ],
        );
        let chosen = choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [1, 2]);
    }

    #[test]
    fn unique_chain_is_taken_unconditionally() {
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![
                candidate("b", &[(50.0, 30.0), (100.0, 30.0)]),
                candidate("a", &[(0.0, 30.0), (50.0, 30.0)]),
            ],
        );
        let refs = BTreeMap::from([reference("a", 50.0), reference("b", 50.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [1, 0]);
        assert_eq!(chosen.geometry.len(), 1);
        assert_eq!(chosen.geometry[0].len(), 3);
    }

    #[test]
    fn metadata_describes_coverage() {
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![candidate("a", &[(0.0, 0.0), (80.0, 0.0)])],
        );
        let refs = BTreeMap::from([reference("a", 80.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.path_id, 7);
        assert_eq!(chosen.path_edge_idx, 2);
        assert!((chosen.target_edge_length - 100.0).abs() < 1e-9);
        assert!((chosen.merged_length - 80.0).abs() < 1e-9);
        assert!((chosen.length_difference + 20.0).abs() < 1e-9);
        assert!((chosen.length_ratio - 0.8).abs() < 1e-9);
        assert_eq!(chosen.segments[0].from, Point::new(0.0, 0.0));
        assert_eq!(chosen.segments[0].to, Point::new(80.0, 0.0));
    }

    #[test]
    fn missing_section_spans_whole_reference() {
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![candidate("a", &[(0.0, 0.0), (100.0, 0.0)])],
        );
        let refs = BTreeMap::from([reference("a", 120.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.segments[0].section, Section::new(0.0, 120.0));
    }

    #[test]
    fn section_is_clamped_to_reference() {
        let mut c = candidate("a", &[(0.0, 0.0), (100.0, 0.0)]);
        c.section = Some(Section::new(-5.0, 130.0));
        let edge = edge_with(&[(0.0, 0.0), (100.0, 0.0)], vec![c]);
        let refs = BTreeMap::from([reference("a", 120.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.segments[0].section, Section::new(0.0, 120.0));
    }

    #[test]
    fn unknown_reference_uses_measured_length() {
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![candidate("ghost", &[(0.0, 0.0), (60.0, 0.0)])],
        );
        let chosen = choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.segments[0].section, Section::new(0.0, 60.0));
    }

    #[test]
    fn no_candidates_is_unmatched() {
        let edge = edge_with(&[(0.0, 0.0), (100.0, 0.0)], Vec::new());
        assert!(
            choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn disjoint_components_are_both_kept() {
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![
                candidate("a", &[(0.0, 0.0), (40.0, 0.0)]),
                candidate("b", &[(60.0, 0.0), (100.0, 0.0)]),
            ],
        );
        let refs = BTreeMap::from([reference("a", 40.0), reference("b", 40.0)]);
        let chosen = choose_match(&edge, &refs, CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [0, 1]);
        assert_eq!(chosen.geometry.len(), 2);
    }

    #[test]
    fn cyclic_candidates_still_yield_a_match() {
        let edge = edge_with(
            &[(0.0, 0.0), (10.0, 0.0)],
            vec![
                candidate("a", &[(0.0, 0.0), (10.0, 0.0)]),
                candidate("b", &[(10.0, 0.0), (10.0, 10.0)]),
                candidate("c", &[(10.0, 10.0), (0.0, 0.0)]),
            ],
        );
        let chosen = choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [0, 1]);
    }

    #[test]
    fn cheaper_of_two_parallel_chains_is_chosen() {
        // a->b->c along the target versus a detour a->d->c.
        let edge = edge_with(
            &[(0.0, 0.0), (100.0, 0.0)],
            vec![
                candidate("detour1", &[(0.0, 0.0), (50.0, 40.0)]),
                candidate("detour2", &[(50.0, 40.0), (100.0, 0.0)]),
                candidate("near1", &[(0.0, 0.0), (50.0, 1.0)]),
                candidate("near2", &[(50.0, 1.0), (100.0, 0.0)]),
            ],
        );
        let chosen = choose_match(&edge, &BTreeMap::new(), CoordinateSystem::Planar)
            .unwrap()
            .unwrap();
        assert_eq!(chosen_indices(&chosen), [2, 3]);
    }
}
