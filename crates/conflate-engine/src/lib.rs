//! conflate-engine: Conflation of a target street network onto reference
//! street geometries (sans-IO).
//!
//! Given map-matcher candidates for every edge of every target map path,
//! the engine runs:
//! load references -> choose matches -> identify disputes ->
//! annotate trimmability -> assign.
//!
//! Intermediate tables live on a transactional [`Blackboard`]. This crate
//! reads and writes no files except through [`FileBlackboard`]; format
//! conversion lives in `conflate-export` and the `conflate` CLI.

pub mod assign;
pub mod chosen;
pub mod diagnostics;
pub mod dispute;
pub mod geometry;
pub mod linemerge;
pub mod paths;
pub mod pipeline;
pub mod store;
pub mod subgraph;
pub mod trim;
pub mod types;

pub use assign::{DisputePolicy, TieBreak};
pub use diagnostics::{Clock, RunDiagnostics, SystemClock};
pub use geometry::CoordinateSystem;
pub use linemerge::LinearGeometry;
pub use pipeline::{ConflationResult, Pipeline};
pub use store::{Blackboard, FileBlackboard, MemoryBlackboard, StoreError, Tables, TransactionMode};
pub use types::{
    AssignedMatch, ChosenMatch, ConflationConfig, ConflationError, Dispute, EdgeCandidates,
    Point, Polyline, ReferenceGeometry, Section, TargetMapPath,
};

/// Run every conflation stage against `store`.
///
/// # Pipeline steps
///
/// 1. Validate `config` and upsert `references`
/// 2. Choose a match per path edge slot (one transaction per path)
/// 3. Identify disputes and annotate claimant trimmability
/// 4. Arbitrate disputes into the final assignment
///
/// Returns the blackboard along with the results so callers can keep
/// querying or close it.
///
/// # Errors
///
/// Returns the first stage error. Work committed by earlier stages (and
/// earlier paths within stage 2) stays on the blackboard.
pub fn conflate<B: Blackboard>(
    store: B,
    config: ConflationConfig,
    references: Vec<ReferenceGeometry>,
    paths: &[TargetMapPath],
    candidates: Vec<EdgeCandidates>,
) -> Result<(B, ConflationResult), ConflationError> {
    Ok(Pipeline::new(store, config)
        .load_references(references)?
        .choose_matches(paths, candidates)?
        .identify_disputes()?
        .assign()?
        .into_parts())
}
