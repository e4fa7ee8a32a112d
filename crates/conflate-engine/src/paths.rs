//! Acyclic path enumeration and target map path construction.
//!
//! [`enumerate_paths`] decomposes any directed graph into maximal,
//! node-disjoint root-to-leaf paths. Roots are chosen by the longest
//! shortest-path distance they can reach (a longest-path heuristic), and
//! each walk prefers the successor that keeps the most distance ahead of
//! it. Every node lands in exactly one path.
//!
//! [`build_target_map_paths`] applies the enumerator to a network of
//! target map edges joined end-to-start.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::floyd_warshall;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

use crate::geometry::CoordKey;
use crate::types::{PathStep, TargetMapEdge, TargetMapPath};

/// All-pairs distances keyed by node pair. Missing pairs are unreachable.
type Distances = HashMap<(NodeIndex, NodeIndex), f64>;

/// Decompose `graph` into maximal node-disjoint paths.
///
/// `weight` gives each edge's non-negative length; negative values are
/// treated as zero. Paths are returned in extraction order, longest
/// reach first.
pub fn enumerate_paths<N, E, F>(graph: &DiGraph<N, E>, mut weight: F) -> Vec<Vec<NodeIndex>>
where
    F: FnMut(&E) -> f64,
{
    let distances: Distances = match floyd_warshall(graph, |e| weight(e.weight()).max(0.0)) {
        Ok(all) => all
            .into_iter()
            .filter(|(_, d)| d.is_finite() && *d < f64::MAX)
            .collect(),
        Err(_) => {
            warn!("path enumeration: negative cycle reported, ranking roots by index");
            HashMap::new()
        }
    };

    let reach: Vec<f64> = graph
        .node_indices()
        .map(|n| {
            graph
                .node_indices()
                .filter_map(|m| distances.get(&(n, m)).copied())
                .fold(0.0, f64::max)
        })
        .collect();

    let has_predecessor = |n: NodeIndex| {
        graph
            .neighbors_directed(n, Direction::Incoming)
            .any(|p| p != n)
    };

    let mut roots: Vec<NodeIndex> = graph.node_indices().collect();
    roots.sort_by(|&a, &b| {
        reach[b.index()]
            .total_cmp(&reach[a.index()])
            .then_with(|| has_predecessor(a).cmp(&has_predecessor(b)))
            .then_with(|| a.cmp(&b))
    });

    let mut visited = vec![false; graph.node_count()];
    let mut paths = Vec::new();
    for root in roots {
        if visited[root.index()] {
            continue;
        }
        visited[root.index()] = true;
        let mut path = vec![root];
        let mut current = root;
        loop {
            let ahead = |n: NodeIndex| {
                distances.get(&(root, n)).copied().unwrap_or(0.0) + reach[n.index()]
            };
            let next = graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| !visited[n.index()])
                .min_by(|&a, &b| ahead(b).total_cmp(&ahead(a)).then_with(|| a.cmp(&b)));
            let Some(next) = next else { break };
            visited[next.index()] = true;
            path.push(next);
            current = next;
        }
        paths.push(path);
    }
    paths
}

/// Derive target map paths from a network of edges.
///
/// Edge `a` continues into edge `b` when `a`'s last coordinate equals
/// `b`'s first. An edge never continues into its own reverse twin.
/// Path ids are assigned sequentially in extraction order.
#[must_use]
pub fn build_target_map_paths(edges: &[TargetMapEdge]) -> Vec<TargetMapPath> {
    let endpoints: Vec<Option<(CoordKey, CoordKey)>> = edges.iter().map(edge_endpoints).collect();

    let mut graph: DiGraph<usize, f64> = DiGraph::with_capacity(edges.len(), edges.len());
    let nodes: Vec<NodeIndex> = (0..edges.len()).map(|i| graph.add_node(i)).collect();

    let mut by_start: HashMap<CoordKey, Vec<usize>> = HashMap::new();
    for (i, ends) in endpoints.iter().enumerate() {
        match ends {
            Some((start, _)) => by_start.entry(*start).or_default().push(i),
            None => warn!(edge_id = %edges[i].id, "target map edge has no geometry"),
        }
    }

    for (a, ends) in endpoints.iter().enumerate() {
        let Some((a_start, a_end)) = ends else { continue };
        for &b in by_start.get(a_end).map_or(&[][..], Vec::as_slice) {
            let reverse_twin = endpoints[b].is_some_and(|(_, b_end)| b_end == *a_start);
            if b != a && !reverse_twin {
                graph.add_edge(nodes[a], nodes[b], edges[b].length);
            }
        }
    }

    let paths: Vec<TargetMapPath> = enumerate_paths(&graph, |w| *w)
        .into_iter()
        .zip(0_u64..)
        .map(|(nodes, id)| TargetMapPath {
            id,
            steps: nodes
                .into_iter()
                .map(|n| PathStep {
                    edge_id: edges[graph[n]].id.clone(),
                    is_forward: true,
                })
                .collect(),
        })
        .collect();

    debug!(
        edges = edges.len(),
        joins = graph.edge_count(),
        paths = paths.len(),
        "built target map paths"
    );
    paths
}

fn edge_endpoints(edge: &TargetMapEdge) -> Option<(CoordKey, CoordKey)> {
    let first = edge.geometry.iter().find_map(|part| part.first())?;
    let last = edge.geometry.iter().rev().find_map(|part| part.last())?;
    Some((CoordKey::from_point(*first), CoordKey::from_point(*last)))
}
