//! LineMerge: reduce arbitrary linear geometry to maximal simple
//! linestrings.
//!
//! # Algorithm overview
//!
//! 1. **Decompose:** split every part into unit (two-point) edges in
//!    input order and build a directed multigraph keyed by exact
//!    coordinate equality. Edge weights carry the input order.
//! 2. **Components:** split the graph into weakly connected components
//!    via `UnionFind`.
//! 3. **Rank:** per component, compute a depth-first preorder from the
//!    source nodes (in-degree 0), or from the lowest-id node when the
//!    component is a pure cycle. Successors are visited in input order.
//! 4. **Chain:** sort edges by `(rank(tail), rank(head), order)` and
//!    greedily extend the path that ends at each edge's tail, or start a
//!    new path.
//! 5. **Splice:** paths that end where they start are cycles. Each cycle
//!    is rotated to the first node it shares with a non-cyclic path and
//!    inserted there. Cycles that share no node remain standalone.
//!
//! A lone `LineString` is returned as-is after consecutive-duplicate
//! removal, so merging a single linestring always round-trips.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use tracing::{debug, warn};

use crate::geometry::{CoordKey, dedup_consecutive};
use crate::types::{Point, Polyline};

/// Linear input to [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinearGeometry {
    /// A single linestring.
    LineString(Polyline),
    /// Any number of parts, possibly touching, possibly cyclic.
    MultiLineString(Vec<Polyline>),
}

/// Merge linear geometry into maximal simple linestrings.
///
/// Every input segment appears in exactly one output path. Empty input
/// yields an empty result.
#[must_use]
pub fn merge(geometry: &LinearGeometry) -> Vec<Polyline> {
    match geometry {
        LinearGeometry::LineString(line) => {
            let points = dedup_consecutive(line.points());
            if points.is_empty() {
                warn!("linemerge: empty linestring");
                return Vec::new();
            }
            vec![Polyline::new(points)]
        }
        LinearGeometry::MultiLineString(parts) => merge_parts(parts),
    }
}

/// Merge the parts of a multi-linestring.
///
/// See the [module documentation](self) for the algorithm.
#[must_use]
pub fn merge_parts(parts: &[Polyline]) -> Vec<Polyline> {
    let unit = UnitGraph::build(parts);
    if unit.graph.edge_count() == 0 {
        warn!(parts = parts.len(), "linemerge: no segments in input");
        return Vec::new();
    }

    let mut out = Vec::new();
    for component in unit.components() {
        let ranks = unit.preorder_ranks(&component);
        let chains = unit.chain(&component, &ranks);
        let paths = splice_cycles(chains);
        out.extend(paths.iter().map(|nodes| unit.emit(nodes)));
    }
    debug!(
        parts = parts.len(),
        segments = unit.graph.edge_count(),
        paths = out.len(),
        "linemerge complete"
    );
    out
}

/// Directed multigraph of unit edges. Edge weights are input order.
struct UnitGraph {
    graph: DiGraph<Point, usize>,
    nodes: HashMap<CoordKey, NodeIndex>,
}

/// A weakly connected component: its nodes in ascending id order.
struct Component {
    nodes: Vec<NodeIndex>,
}

impl UnitGraph {
    fn build(parts: &[Polyline]) -> Self {
        let mut unit = Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        };
        let mut order = 0;
        for part in parts {
            let points = dedup_consecutive(part.points());
            for w in points.windows(2) {
                let tail = unit.node(w[0]);
                let head = unit.node(w[1]);
                unit.graph.add_edge(tail, head, order);
                order += 1;
            }
        }
        unit
    }

    fn node(&mut self, p: Point) -> NodeIndex {
        let graph = &mut self.graph;
        *self
            .nodes
            .entry(CoordKey::from_point(p))
            .or_insert_with(|| graph.add_node(p))
    }

    /// Components ordered by the earliest input edge they contain.
    fn components(&self) -> Vec<Component> {
        let mut uf = UnionFind::<usize>::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            uf.union(edge.source().index(), edge.target().index());
        }

        let mut groups: BTreeMap<usize, Vec<NodeIndex>> = BTreeMap::new();
        for node in self.graph.node_indices() {
            groups.entry(uf.find(node.index())).or_default().push(node);
        }

        let mut components: Vec<(usize, Component)> = groups
            .into_values()
            .filter_map(|nodes| {
                let first_edge = nodes
                    .iter()
                    .flat_map(|&n| self.graph.edges_directed(n, Direction::Outgoing))
                    .map(|e| *e.weight())
                    .min()?;
                Some((first_edge, Component { nodes }))
            })
            .collect();
        components.sort_by_key(|(first_edge, _)| *first_edge);
        components.into_iter().map(|(_, c)| c).collect()
    }

    /// Depth-first preorder rank of every node in the component.
    fn preorder_ranks(&self, component: &Component) -> HashMap<NodeIndex, usize> {
        let sources: Vec<NodeIndex> = component
            .nodes
            .iter()
            .copied()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        let mut ranks = HashMap::with_capacity(component.nodes.len());
        // Sources first; the remaining nodes catch pure cycles and cyclic
        // parts unreachable from any source.
        for &root in sources.iter().chain(&component.nodes) {
            if ranks.contains_key(&root) {
                continue;
            }
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                if ranks.contains_key(&node) {
                    continue;
                }
                ranks.insert(node, ranks.len());
                let mut successors: Vec<(usize, NodeIndex)> = self
                    .graph
                    .edges_directed(node, Direction::Outgoing)
                    .map(|e| (*e.weight(), e.target()))
                    .collect();
                successors.sort_unstable();
                stack.extend(successors.into_iter().rev().map(|(_, n)| n));
            }
        }
        ranks
    }

    /// Greedily chain the component's edges into node sequences.
    fn chain(
        &self,
        component: &Component,
        ranks: &HashMap<NodeIndex, usize>,
    ) -> Vec<Vec<NodeIndex>> {
        let rank = |n: NodeIndex| ranks.get(&n).copied().unwrap_or(usize::MAX);

        let mut edges: Vec<(usize, usize, usize, NodeIndex, NodeIndex)> = component
            .nodes
            .iter()
            .flat_map(|&n| self.graph.edges_directed(n, Direction::Outgoing))
            .map(|e| {
                (
                    rank(e.source()),
                    rank(e.target()),
                    *e.weight(),
                    e.source(),
                    e.target(),
                )
            })
            .collect();
        edges.sort_unstable();

        let mut chains: Vec<Vec<NodeIndex>> = Vec::new();
        let mut open_ends: HashMap<NodeIndex, BTreeSet<usize>> = HashMap::new();
        for (_, _, _, tail, head) in edges {
            let extend = open_ends.get_mut(&tail).and_then(BTreeSet::pop_first);
            let chain_idx = if let Some(idx) = extend {
                chains[idx].push(head);
                idx
            } else {
                chains.push(vec![tail, head]);
                chains.len() - 1
            };
            open_ends.entry(head).or_default().insert(chain_idx);
        }
        chains
    }

    fn emit(&self, nodes: &[NodeIndex]) -> Polyline {
        let points: Vec<Point> = nodes.iter().map(|&n| self.graph[n]).collect();
        Polyline::new(dedup_consecutive(&points))
    }
}

fn is_cycle(chain: &[NodeIndex]) -> bool {
    chain.len() > 2 && chain.first() == chain.last()
}

/// Splice cyclic chains into the first non-cyclic chain sharing a node.
///
/// Repeats until no cycle can be placed, since a splice can make a
/// path adjacent to a cycle that was not adjacent before.
fn splice_cycles(chains: Vec<Vec<NodeIndex>>) -> Vec<Vec<NodeIndex>> {
    let (mut paths, mut cycles): (Vec<_>, Vec<_>) = chains.into_iter().partition(|c| !is_cycle(c));

    loop {
        let mut remaining = Vec::with_capacity(cycles.len());
        let before = cycles.len();
        for cycle in cycles {
            if !splice_into(&mut paths, &cycle) {
                remaining.push(cycle);
            }
        }
        cycles = remaining;
        if cycles.is_empty() || cycles.len() == before {
            break;
        }
    }

    paths.extend(cycles);
    paths
}

/// Try to insert `cycle` into one of `paths`. Returns `true` on success.
fn splice_into(paths: &mut [Vec<NodeIndex>], cycle: &[NodeIndex]) -> bool {
    let ring = &cycle[..cycle.len() - 1];
    for path in paths.iter_mut() {
        let found = path
            .iter()
            .enumerate()
            .find_map(|(pos, n)| ring.iter().position(|c| c == n).map(|cpos| (pos, cpos)));
        if let Some((pos, cpos)) = found {
            // Rotate the ring to start at the shared node, then walk it
            // back to that node.
            let rotated = ring[cpos + 1..]
                .iter()
                .chain(&ring[..=cpos])
                .copied()
                .collect::<Vec<_>>();
            path.splice(pos + 1..pos + 1, rotated);
            return true;
        }
    }
    false
}
