//! Run diagnostics: timing and counts for each conflation stage.
//!
//! Every [`Pipeline`](crate::Pipeline) run collects diagnostics alongside
//! its results. Time is read through the [`Clock`] trait so callers (and
//! tests) decide where timestamps come from.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Monotonic time source.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// A clock whose origin is the moment of creation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Diagnostics collected from a single conflation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Stage 1: reference geometry loading.
    pub load_references: StageDiagnostics,
    /// Stage 2: chosen-match construction and persistence.
    pub choose_matches: StageDiagnostics,
    /// Stage 3: dispute identification and trimmability.
    pub identify_disputes: StageDiagnostics,
    /// Stage 4: arbitration and assignment.
    pub assign: StageDiagnostics,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: RunSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    LoadReferences {
        /// References supplied to this run.
        loaded: usize,
        /// References on the blackboard afterwards.
        total: usize,
    },
    ChooseMatches {
        /// Target map paths processed.
        paths: usize,
        /// Path edge slots considered.
        edges: usize,
        /// Slots that received a chosen match.
        matched: usize,
        /// Slots with no usable candidate.
        unmatched: usize,
        /// Candidates supplied across all slots.
        candidates: usize,
        /// Chosen segments across all matches.
        chosen_segments: usize,
    },
    IdentifyDisputes {
        /// Disputes found.
        disputes: usize,
        /// Claimant records across all disputes.
        claimants: usize,
        /// Distinct references with at least one dispute.
        disputed_references: usize,
        /// Claimant boundaries flagged trimmable.
        trimmable_boundaries: usize,
    },
    Assign {
        /// Assigned match rows.
        assigned: usize,
        /// Distinct references with an assignment.
        references: usize,
        /// Sum of assigned section lengths.
        assigned_length: f64,
    },
}

/// High-level counts for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub references: usize,
    pub paths: usize,
    pub matched_edges: usize,
    pub unmatched_edges: usize,
    pub disputes: usize,
    pub assigned: usize,
}

impl RunDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Conflation Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "References: {}  |  Paths: {}",
            self.summary.references, self.summary.paths,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Load References", &self.load_references),
            ("Choose Matches", &self.choose_matches),
            ("Identify Disputes", &self.identify_disputes),
            ("Assign", &self.assign),
        ];
        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Matched: {}  |  Unmatched: {}  |  Disputes: {}  |  Assigned: {}",
            self.summary.matched_edges,
            self.summary.unmatched_edges,
            self.summary.disputes,
            self.summary.assigned,
        ));

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::LoadReferences { loaded, total } => {
            format!("{loaded} loaded, {total} on blackboard")
        }
        StageMetrics::ChooseMatches {
            paths,
            edges,
            matched,
            unmatched,
            candidates,
            chosen_segments,
        } => format!(
            "{paths} paths, {edges} edges ({matched} matched, {unmatched} unmatched), {candidates} candidates -> {chosen_segments} segments",
        ),
        StageMetrics::IdentifyDisputes {
            disputes,
            claimants,
            disputed_references,
            trimmable_boundaries,
        } => format!(
            "{disputes} disputes on {disputed_references} refs, {claimants} claimants, {trimmable_boundaries} trimmable ends",
        ),
        StageMetrics::Assign {
            assigned,
            references,
            assigned_length,
        } => format!("{assigned} rows on {references} refs, length={assigned_length:.1}"),
    }
}
