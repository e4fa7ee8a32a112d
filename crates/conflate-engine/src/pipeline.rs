//! Staged conflation: advance stage-by-stage, inspecting the blackboard
//! between stages.
//!
//! ```rust
//! # use conflate_engine::{ConflationConfig, ConflationError, MemoryBlackboard, Pipeline};
//! # use conflate_engine::types::{EdgeCandidates, ReferenceGeometry, TargetMapPath};
//! # fn run(
//! #     references: Vec<ReferenceGeometry>,
//! #     paths: &[TargetMapPath],
//! #     candidates: Vec<EdgeCandidates>,
//! # ) -> Result<(), ConflationError> {
//! let result = Pipeline::new(MemoryBlackboard::new(), ConflationConfig::default())
//!     .load_references(references)?
//!     .choose_matches(paths, candidates)?
//!     .identify_disputes()?
//!     .assign()?
//!     .into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state. Every
//! write runs inside a blackboard transaction: chosen matches commit
//! once per target map path, disputes and assignments once per stage.
//! A failing stage rolls back its open transaction and returns the
//! error, so the blackboard holds only fully committed work.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assign::assign_matches;
use crate::chosen::choose_match;
use crate::diagnostics::{Clock, RunDiagnostics, RunSummary, StageDiagnostics, StageMetrics, SystemClock};
use crate::dispute::identify_disputes;
use crate::geometry::CoordinateSystem;
use crate::store::{Blackboard, Tables, TransactionMode};
use crate::trim::annotate_trimmability;
use crate::types::{
    AssignedMatch, ChosenMatch, ConflationConfig, ConflationError, Dispute, EdgeCandidates, EdgeKey,
    ReferenceGeometry, TargetMapPath,
};

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflationResult {
    /// Final non-overlapping assignment, ordered by reference then start.
    pub assigned: Vec<AssignedMatch>,
    /// Disputes found, with annotated claimants.
    pub disputes: Vec<Dispute>,
    /// Chosen matches in path/edge order.
    pub chosen: Vec<ChosenMatch>,
    /// Path edge slots without a chosen match.
    pub unmatched: Vec<EdgeKey>,
    /// Timing and counts per stage.
    pub diagnostics: RunDiagnostics,
}

/// State shared by every stage.
struct Context<B> {
    store: B,
    config: ConflationConfig,
    clock: Box<dyn Clock>,
    started: Duration,
}

impl<B: Blackboard> Context<B> {
    fn elapsed_since(&self, start: Duration) -> Duration {
        self.clock.now().saturating_sub(start)
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any work has been done.
///
/// Call [`load_references`](Self::load_references) to continue.
#[must_use = "pipeline stages are consumed by advancing — call .load_references() to continue"]
pub struct Pending<B> {
    ctx: Context<B>,
}

impl<B: Blackboard> Pending<B> {
    /// The blackboard.
    pub const fn store(&self) -> &B {
        &self.ctx.store
    }

    /// Validate the configuration and upsert `references` into the
    /// blackboard in one exclusive transaction.
    ///
    /// References with a negative or non-finite length are skipped.
    ///
    /// # Errors
    ///
    /// [`ConflationError::InvalidConfig`] for an unusable configuration,
    /// or a store error if the transaction fails.
    pub fn load_references(
        mut self,
        references: Vec<ReferenceGeometry>,
    ) -> Result<ReferencesLoaded<B>, ConflationError> {
        self.ctx.config.validate()?;
        let start = self.ctx.clock.now();

        let loaded = self
            .ctx
            .store
            .transaction(TransactionMode::Exclusive, |tables| {
                let mut loaded = 0;
                for reference in references {
                    if !reference.length.is_finite() || reference.length < 0.0 {
                        warn!(
                            reference_id = %reference.id,
                            length = reference.length,
                            "skipping reference with invalid length"
                        );
                        continue;
                    }
                    tables.references.insert(reference.id.clone(), reference);
                    loaded += 1;
                }
                Ok::<_, ConflationError>(loaded)
            })?;

        let total = self.ctx.store.tables().references.len();
        info!(loaded, total, "loaded references");
        let load = StageDiagnostics {
            duration: self.ctx.elapsed_since(start),
            metrics: StageMetrics::LoadReferences { loaded, total },
        };
        Ok(ReferencesLoaded { ctx: self.ctx, load })
    }
}

// ───────────────────── Stage 1: ReferencesLoaded ─────────────────────

/// Pipeline state after reference geometries are on the blackboard.
///
/// Call [`choose_matches`](Self::choose_matches) to continue.
#[must_use = "pipeline stages are consumed by advancing — call .choose_matches() to continue"]
pub struct ReferencesLoaded<B> {
    ctx: Context<B>,
    load: StageDiagnostics,
}

/// Counts from choosing one path.
#[derive(Debug, Default, Clone, Copy)]
struct PathOutcome {
    edges: usize,
    matched: usize,
    unmatched: usize,
    segments: usize,
}

impl PathOutcome {
    fn add(&mut self, other: Self) {
        self.edges += other.edges;
        self.matched += other.matched;
        self.unmatched += other.unmatched;
        self.segments += other.segments;
    }
}

impl<B: Blackboard> ReferencesLoaded<B> {
    /// The blackboard.
    pub const fn store(&self) -> &B {
        &self.ctx.store
    }

    /// Choose a match for every path edge slot and persist the results.
    ///
    /// Slots come from `paths` and from the candidates' own
    /// `(path_id, path_edge_idx)`. A defined slot without candidates is
    /// recorded as unmatched. Each path's previous chosen and unmatched
    /// rows are replaced inside one exclusive transaction per path.
    ///
    /// # Errors
    ///
    /// [`ConflationError::DuplicateEdge`] if two candidate groups share a
    /// slot (checked before anything is written), or any error from
    /// match construction or the store. Paths committed before the error
    /// stay committed.
    pub fn choose_matches(
        mut self,
        paths: &[TargetMapPath],
        candidates: Vec<EdgeCandidates>,
    ) -> Result<MatchesChosen<B>, ConflationError> {
        let start = self.ctx.clock.now();
        let candidate_count: usize = candidates.iter().map(|e| e.candidates.len()).sum();

        let mut slots: BTreeMap<u64, BTreeMap<usize, EdgeCandidates>> = BTreeMap::new();
        for edge in candidates {
            let by_idx = slots.entry(edge.path_id).or_default();
            if by_idx.contains_key(&edge.path_edge_idx) {
                return Err(ConflationError::DuplicateEdge {
                    path_id: edge.path_id,
                    path_edge_idx: edge.path_edge_idx,
                });
            }
            by_idx.insert(edge.path_edge_idx, edge);
        }
        let defined: BTreeMap<u64, &TargetMapPath> = paths.iter().map(|p| (p.id, p)).collect();
        let path_ids: BTreeSet<u64> = slots.keys().chain(defined.keys()).copied().collect();

        let system = self.ctx.config.coordinate_system;
        let mut totals = PathOutcome::default();
        for &path_id in &path_ids {
            let path = defined.get(&path_id).copied();
            let edges = slots.remove(&path_id).unwrap_or_default();
            let outcome = self
                .ctx
                .store
                .transaction(TransactionMode::Exclusive, |tables| {
                    choose_path(tables, path_id, path, edges, system)
                })?;
            debug!(
                path_id,
                edges = outcome.edges,
                matched = outcome.matched,
                "committed path"
            );
            totals.add(outcome);
        }

        info!(
            paths = path_ids.len(),
            matched = totals.matched,
            unmatched = totals.unmatched,
            "chose matches"
        );
        let choose = StageDiagnostics {
            duration: self.ctx.elapsed_since(start),
            metrics: StageMetrics::ChooseMatches {
                paths: path_ids.len(),
                edges: totals.edges,
                matched: totals.matched,
                unmatched: totals.unmatched,
                candidates: candidate_count,
                chosen_segments: totals.segments,
            },
        };
        Ok(MatchesChosen {
            ctx: self.ctx,
            load: self.load,
            choose,
            paths: path_ids.len(),
        })
    }
}

fn choose_path(
    tables: &mut Tables,
    path_id: u64,
    path: Option<&TargetMapPath>,
    mut edges: BTreeMap<usize, EdgeCandidates>,
    system: CoordinateSystem,
) -> Result<PathOutcome, ConflationError> {
    tables.clear_path(path_id);
    let mut outcome = PathOutcome::default();

    if let Some(path) = path {
        for (path_edge_idx, step) in path.steps.iter().enumerate() {
            if let Some(edge) = edges.remove(&path_edge_idx) {
                if edge.edge.id != step.edge_id {
                    warn!(
                        path_id,
                        path_edge_idx,
                        expected = %step.edge_id,
                        found = %edge.edge.id,
                        "candidate edge id differs from path definition"
                    );
                }
                outcome.add(choose_edge(tables, &edge, system)?);
            } else {
                debug!(path_id, path_edge_idx, edge_id = %step.edge_id, "no candidates for edge");
                tables.unmatched.insert(EdgeKey {
                    path_id,
                    path_edge_idx,
                });
                outcome.add(PathOutcome {
                    edges: 1,
                    unmatched: 1,
                    ..PathOutcome::default()
                });
            }
        }
    }
    for edge in edges.into_values() {
        outcome.add(choose_edge(tables, &edge, system)?);
    }
    Ok(outcome)
}

fn choose_edge(
    tables: &mut Tables,
    edge: &EdgeCandidates,
    system: CoordinateSystem,
) -> Result<PathOutcome, ConflationError> {
    let key = EdgeKey {
        path_id: edge.path_id,
        path_edge_idx: edge.path_edge_idx,
    };
    Ok(match choose_match(edge, &tables.references, system)? {
        Some(chosen) => {
            let segments = chosen.segments.len();
            tables.chosen.insert(key, chosen);
            PathOutcome {
                edges: 1,
                matched: 1,
                unmatched: 0,
                segments,
            }
        }
        None => {
            tables.unmatched.insert(key);
            PathOutcome {
                edges: 1,
                matched: 0,
                unmatched: 1,
                segments: 0,
            }
        }
    })
}

// ─────────────────────── Stage 2: MatchesChosen ──────────────────────

/// Pipeline state after chosen matches are persisted.
///
/// Call [`identify_disputes`](Self::identify_disputes) to continue.
#[must_use = "pipeline stages are consumed by advancing — call .identify_disputes() to continue"]
pub struct MatchesChosen<B> {
    ctx: Context<B>,
    load: StageDiagnostics,
    choose: StageDiagnostics,
    paths: usize,
}

impl<B: Blackboard> MatchesChosen<B> {
    /// The blackboard.
    pub const fn store(&self) -> &B {
        &self.ctx.store
    }

    /// Chosen matches on the blackboard.
    #[must_use]
    pub fn chosen(&self) -> &BTreeMap<EdgeKey, ChosenMatch> {
        &self.ctx.store.tables().chosen
    }

    /// Find disputes across all chosen matches, annotate trimmability,
    /// and replace the disputes table.
    ///
    /// # Errors
    ///
    /// A store error if the transaction fails.
    pub fn identify_disputes(mut self) -> Result<DisputesIdentified<B>, ConflationError> {
        let start = self.ctx.clock.now();
        let snap_tolerance = self.ctx.config.snap_tolerance;

        self.ctx
            .store
            .transaction(TransactionMode::Deferred, |tables| {
                let mut disputes = identify_disputes(&tables.chosen, &tables.references);
                annotate_trimmability(&mut disputes, &tables.chosen, snap_tolerance);
                tables.disputes = disputes;
                Ok::<_, ConflationError>(())
            })?;

        let disputes = &self.ctx.store.tables().disputes;
        let claimants = disputes.iter().map(|d| d.claimants.len()).sum();
        let disputed_references = disputes
            .iter()
            .map(|d| d.reference_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let trimmable_boundaries = disputes
            .iter()
            .flat_map(|d| &d.claimants)
            .map(|c| usize::from(c.start_trimmable) + usize::from(c.end_trimmable))
            .sum();
        info!(disputes = disputes.len(), claimants, "identified disputes");

        let identify = StageDiagnostics {
            duration: self.ctx.elapsed_since(start),
            metrics: StageMetrics::IdentifyDisputes {
                disputes: disputes.len(),
                claimants,
                disputed_references,
                trimmable_boundaries,
            },
        };
        Ok(DisputesIdentified {
            ctx: self.ctx,
            load: self.load,
            choose: self.choose,
            identify,
            paths: self.paths,
        })
    }
}

// ───────────────────── Stage 3: DisputesIdentified ───────────────────

/// Pipeline state after disputes are persisted.
///
/// Call [`assign`](Self::assign) to continue.
#[must_use = "pipeline stages are consumed by advancing — call .assign() to continue"]
pub struct DisputesIdentified<B> {
    ctx: Context<B>,
    load: StageDiagnostics,
    choose: StageDiagnostics,
    identify: StageDiagnostics,
    paths: usize,
}

impl<B: Blackboard> DisputesIdentified<B> {
    /// The blackboard.
    pub const fn store(&self) -> &B {
        &self.ctx.store
    }

    /// Disputes on the blackboard.
    #[must_use]
    pub fn disputes(&self) -> &[Dispute] {
        &self.ctx.store.tables().disputes
    }

    /// Arbitrate disputes and replace the assigned table in one
    /// exclusive transaction.
    ///
    /// # Errors
    ///
    /// A store error if the transaction fails; the previous assignment
    /// is left in place.
    pub fn assign(mut self) -> Result<Assigned<B>, ConflationError> {
        let start = self.ctx.clock.now();
        let policy = self.ctx.config.dispute_policy;
        let min_assigned_length = self.ctx.config.min_assigned_length;

        self.ctx
            .store
            .transaction(TransactionMode::Exclusive, |tables| {
                tables.assigned =
                    assign_matches(&tables.chosen, &tables.disputes, policy, min_assigned_length);
                Ok::<_, ConflationError>(())
            })?;

        let assigned = &self.ctx.store.tables().assigned;
        let references = assigned
            .iter()
            .map(|m| m.shst_reference_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let assigned_length = assigned.iter().map(|m| m.section().length()).sum();
        info!(assigned = assigned.len(), references, "assigned matches");

        let assign = StageDiagnostics {
            duration: self.ctx.elapsed_since(start),
            metrics: StageMetrics::Assign {
                assigned: assigned.len(),
                references,
                assigned_length,
            },
        };
        Ok(Assigned {
            ctx: self.ctx,
            load: self.load,
            choose: self.choose,
            identify: self.identify,
            assign,
            paths: self.paths,
        })
    }
}

// ───────────────────────── Stage 4: Assigned ─────────────────────────

/// Pipeline state after assignment, the final stage.
///
/// Call [`into_result`](Self::into_result) or
/// [`into_parts`](Self::into_parts) to extract the results.
#[must_use = "call .into_result() to extract the ConflationResult"]
pub struct Assigned<B> {
    ctx: Context<B>,
    load: StageDiagnostics,
    choose: StageDiagnostics,
    identify: StageDiagnostics,
    assign: StageDiagnostics,
    paths: usize,
}

impl<B: Blackboard> Assigned<B> {
    /// The blackboard.
    pub const fn store(&self) -> &B {
        &self.ctx.store
    }

    /// Final assignment on the blackboard.
    #[must_use]
    pub fn assigned(&self) -> &[AssignedMatch] {
        &self.ctx.store.tables().assigned
    }

    /// Diagnostics for the run so far.
    #[must_use]
    pub fn diagnostics(&self) -> RunDiagnostics {
        let tables = self.ctx.store.tables();
        RunDiagnostics {
            load_references: self.load.clone(),
            choose_matches: self.choose.clone(),
            identify_disputes: self.identify.clone(),
            assign: self.assign.clone(),
            total_duration: self.ctx.elapsed_since(self.ctx.started),
            summary: RunSummary {
                references: tables.references.len(),
                paths: self.paths,
                matched_edges: tables.chosen.len(),
                unmatched_edges: tables.unmatched.len(),
                disputes: tables.disputes.len(),
                assigned: tables.assigned.len(),
            },
        }
    }

    /// Consume the pipeline and return the results and the blackboard.
    pub fn into_parts(self) -> (B, ConflationResult) {
        let diagnostics = self.diagnostics();
        let tables = self.ctx.store.tables();
        let result = ConflationResult {
            assigned: tables.assigned.clone(),
            disputes: tables.disputes.clone(),
            chosen: tables.chosen.values().cloned().collect(),
            unmatched: tables.unmatched.iter().copied().collect(),
            diagnostics,
        };
        (self.ctx.store, result)
    }

    /// Consume the pipeline and return the results.
    #[must_use]
    pub fn into_result(self) -> ConflationResult {
        self.into_parts().1
    }
}

/// Entry point for a staged conflation run.
pub struct Pipeline;

impl Pipeline {
    /// Start a run against `store`, timed with a [`SystemClock`].
    ///
    /// No work is performed until a stage method is called.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<B: Blackboard>(store: B, config: ConflationConfig) -> Pending<B> {
        Self::with_clock(store, config, Box::new(SystemClock::new()))
    }

    /// Start a run whose diagnostics read time from `clock`.
    pub fn with_clock<B: Blackboard>(
        store: B,
        config: ConflationConfig,
        clock: Box<dyn Clock>,
    ) -> Pending<B> {
        let started = clock.now();
        Pending {
            ctx: Context {
                store,
                config,
                clock,
                started,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::store::{MemoryBlackboard, StoreError, StoreResult};
    use crate::types::{MatchCandidate, PathStep, Point, Polyline, Section, TargetMapEdge};

    /// Advances one millisecond per reading.
    struct StepClock(Cell<u64>);

    impl Clock for StepClock {
        fn now(&self) -> Duration {
            let t = self.0.get();
            self.0.set(t + 1);
            Duration::from_millis(t)
        }
    }

    /// Fails the commit of the `fail_at`-th transaction (zero-based).
    struct FailingBlackboard {
        inner: MemoryBlackboard,
        commits: usize,
        fail_at: usize,
    }

    impl Blackboard for FailingBlackboard {
        fn tables(&self) -> &Tables {
            self.inner.tables()
        }
        fn begin(&mut self, mode: TransactionMode) -> StoreResult<()> {
            self.inner.begin(mode)
        }
        fn commit(&mut self) -> StoreResult<()> {
            let n = self.commits;
            self.commits += 1;
            if n == self.fail_at {
                self.inner.rollback()?;
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.commit()
        }
        fn rollback(&mut self) -> StoreResult<()> {
            self.inner.rollback()
        }
        fn tables_mut(&mut self) -> StoreResult<&mut Tables> {
            self.inner.tables_mut()
        }
        fn transaction_mode(&self) -> Option<TransactionMode> {
            self.inner.transaction_mode()
        }
    }

    fn line(points: &[(f64, f64)]) -> Polyline {
        Polyline::new(points.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    fn reference(id: &str, length: f64) -> ReferenceGeometry {
        ReferenceGeometry {
            id: id.to_owned(),
            geometry_id: None,
            length,
            one_way: true,
            geometry: line(&[(0.0, 0.0), (length, 0.0)]),
        }
    }

    fn edge(path_id: u64, idx: usize, section: (f64, f64), x: (f64, f64)) -> EdgeCandidates {
        EdgeCandidates {
            path_id,
            path_edge_idx: idx,
            is_forward: true,
            edge: TargetMapEdge {
                id: format!("p{path_id}e{idx}"),
                length: x.1 - x.0,
                one_way: true,
                geometry: vec![line(&[(x.0, 0.0), (x.1, 0.0)])],
            },
            candidates: vec![MatchCandidate {
                reference_id: "R".to_owned(),
                section: Some(Section::new(section.0, section.1)),
                geometry: line(&[(x.0, 0.0), (x.1, 0.0)]),
            }],
        }
    }

    fn planar() -> ConflationConfig {
        ConflationConfig {
            coordinate_system: CoordinateSystem::Planar,
            ..ConflationConfig::default()
        }
    }

    #[test]
    fn overlapping_paths_are_arbitrated() {
        let result = Pipeline::new(MemoryBlackboard::new(), planar())
            .load_references(vec![reference("R", 150.0)])
            .unwrap()
            .choose_matches(
                &[],
                vec![
                    edge(0, 0, (0.0, 100.0), (0.0, 100.0)),
                    edge(1, 0, (50.0, 150.0), (50.0, 150.0)),
                ],
            )
            .unwrap()
            .identify_disputes()
            .unwrap()
            .assign()
            .unwrap()
            .into_result();

        assert_eq!(result.chosen.len(), 2);
        assert_eq!(result.disputes.len(), 1);
        assert_eq!(result.disputes[0].section, Section::new(50.0, 100.0));
        // Both claims are whole paths, so both ends are free: midpoint split.
        let ranges: Vec<_> = result
            .assigned
            .iter()
            .map(|m| (m.path_id, m.section_start, m.section_end))
            .collect();
        assert_eq!(ranges, [(0, 0.0, 75.0), (1, 75.0, 150.0)]);
        assert_eq!(result.diagnostics.summary.assigned, 2);
    }

    #[test]
    fn defined_slot_without_candidates_is_unmatched() {
        let path = TargetMapPath {
            id: 4,
            steps: vec![
                PathStep {
                    edge_id: "p4e0".to_owned(),
                    is_forward: true,
                },
                PathStep {
                    edge_id: "missing".to_owned(),
                    is_forward: true,
                },
            ],
        };
        let chosen = Pipeline::new(MemoryBlackboard::new(), planar())
            .load_references(vec![reference("R", 100.0)])
            .unwrap()
            .choose_matches(&[path], vec![edge(4, 0, (0.0, 100.0), (0.0, 100.0))])
            .unwrap();
        assert_eq!(chosen.chosen().len(), 1);
        assert!(chosen.store().tables().unmatched.contains(&EdgeKey {
            path_id: 4,
            path_edge_idx: 1,
        }));
    }

    #[test]
    fn duplicate_slot_is_rejected_before_writing() {
        let err = Pipeline::new(MemoryBlackboard::new(), planar())
            .load_references(vec![reference("R", 100.0)])
            .unwrap()
            .choose_matches(
                &[],
                vec![
                    edge(0, 0, (0.0, 50.0), (0.0, 50.0)),
                    edge(0, 0, (50.0, 100.0), (50.0, 100.0)),
                ],
            )
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConflationError::DuplicateEdge {
                path_id: 0,
                path_edge_idx: 0
            }
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ConflationConfig {
            snap_tolerance: -1.0,
            ..ConflationConfig::default()
        };
        let err = Pipeline::new(MemoryBlackboard::new(), config)
            .load_references(Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, ConflationError::InvalidConfig(_)));
    }

    #[test]
    fn failed_commit_aborts_the_stage() {
        // Commit 0 loads references, commit 1 is path 0, commit 2 fails.
        let store = FailingBlackboard {
            inner: MemoryBlackboard::new(),
            commits: 0,
            fail_at: 2,
        };
        let loaded = Pipeline::new(store, planar())
            .load_references(vec![reference("R", 150.0)])
            .unwrap();
        let err = loaded
            .choose_matches(
                &[],
                vec![
                    edge(0, 0, (0.0, 100.0), (0.0, 100.0)),
                    edge(1, 0, (50.0, 150.0), (50.0, 150.0)),
                ],
            )
            .err()
            .unwrap();
        assert!(matches!(err, ConflationError::Store(StoreError::Io(_))));
    }

    #[test]
    fn rerun_replaces_previous_rows() {
        let (store, first) = Pipeline::new(MemoryBlackboard::new(), planar())
            .load_references(vec![reference("R", 150.0)])
            .unwrap()
            .choose_matches(
                &[],
                vec![
                    edge(0, 0, (0.0, 100.0), (0.0, 100.0)),
                    edge(1, 0, (50.0, 150.0), (50.0, 150.0)),
                ],
            )
            .unwrap()
            .identify_disputes()
            .unwrap()
            .assign()
            .unwrap()
            .into_parts();
        assert_eq!(first.disputes.len(), 1);

        // Path 1 now claims a disjoint stretch: the dispute disappears.
        let second = Pipeline::new(store, planar())
            .load_references(Vec::new())
            .unwrap()
            .choose_matches(&[], vec![edge(1, 0, (100.0, 150.0), (100.0, 150.0))])
            .unwrap()
            .identify_disputes()
            .unwrap()
            .assign()
            .unwrap()
            .into_result();
        assert!(second.disputes.is_empty());
        assert_eq!(second.chosen.len(), 2);
        assert_eq!(second.assigned.len(), 2);
    }

    #[test]
    fn diagnostics_use_the_supplied_clock() {
        let result = Pipeline::with_clock(
            MemoryBlackboard::new(),
            planar(),
            Box::new(StepClock(Cell::new(0))),
        )
        .load_references(vec![reference("R", 100.0)])
        .unwrap()
        .choose_matches(&[], vec![edge(0, 0, (0.0, 100.0), (0.0, 100.0))])
        .unwrap()
        .identify_disputes()
        .unwrap()
        .assign()
        .unwrap()
        .into_result();

        let d = &result.diagnostics;
        assert_eq!(d.load_references.duration, Duration::from_millis(1));
        assert!(d.total_duration >= Duration::from_millis(8));
        assert!(matches!(
            d.choose_matches.metrics,
            StageMetrics::ChooseMatches {
                paths: 1,
                matched: 1,
                unmatched: 0,
                ..
            }
        ));
        assert_eq!(d.summary.references, 1);
    }
}
