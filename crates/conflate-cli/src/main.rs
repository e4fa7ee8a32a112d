//! conflate: command-line driver for the conflation engine.
//!
//! Reads reference geometries and map-matcher candidates, runs the full
//! pipeline against a file-backed blackboard, writes GeoJSON and/or CSV
//! outputs, and prints per-stage diagnostics.
//!
//! # Usage
//!
//! ```text
//! conflate run --references refs.geojson --candidates matches.ndjson \
//!     --blackboard bb.json --out-dir out/ [--format geojson|csv|both]
//! conflate linemerge lines.geojson
//! conflate paths edges.geojson
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod input;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use conflate_engine::linemerge::merge;
use conflate_engine::paths::build_target_map_paths;
use conflate_engine::{
    Blackboard, ConflationConfig, ConflationResult, CoordinateSystem, DisputePolicy,
    FileBlackboard, TieBreak, conflate,
};
use geojson::{Feature, FeatureCollection};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Conflate a target road network onto reference street geometries.
#[derive(Parser)]
#[command(name = "conflate", version)]
struct Cli {
    /// Log engine progress at debug level (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every conflation stage and write the results.
    Run(RunArgs),
    /// Merge each feature's linear geometry and print the result.
    Linemerge {
        /// GeoJSON FeatureCollection of LineString/MultiLineString features.
        input: PathBuf,
    },
    /// Derive target map paths from a network of edges and print them.
    Paths {
        /// GeoJSON FeatureCollection of target edges.
        edges: PathBuf,

        /// How input coordinates are interpreted.
        #[arg(long, value_enum, default_value_t = Coordinates::Wgs84)]
        coordinates: Coordinates,
    },
}

#[derive(Args)]
struct RunArgs {
    /// GeoJSON FeatureCollection of reference geometries.
    #[arg(long)]
    references: PathBuf,

    /// Newline-delimited JSON candidate records, one per path edge.
    #[arg(long)]
    candidates: PathBuf,

    /// JSON array of path definitions. Without it, paths are grouped
    /// from the candidate records.
    #[arg(long)]
    paths: Option<PathBuf>,

    /// Blackboard file; created if missing, updated in place.
    #[arg(long)]
    blackboard: PathBuf,

    /// Directory for output files.
    #[arg(long)]
    out_dir: PathBuf,

    /// Output formats to write.
    #[arg(long, value_enum, default_value_t = Format::Geojson)]
    format: Format,

    /// Print diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full conflation config as a JSON string.
    ///
    /// When provided, all other configuration flags are ignored.
    #[arg(long)]
    config_json: Option<String>,

    /// How input coordinates are interpreted.
    #[arg(long, value_enum, default_value_t = Coordinates::Wgs84)]
    coordinates: Coordinates,

    /// Coordinate distance under which segment endpoints connect.
    #[arg(long, default_value_t = ConflationConfig::DEFAULT_SNAP_TOLERANCE)]
    snap_tolerance: f64,

    /// Assigned sub-ranges shorter than this are dropped.
    #[arg(long, default_value_t = ConflationConfig::DEFAULT_MIN_ASSIGNED_LENGTH)]
    min_assigned_length: f64,

    /// Tie-break when every claimant may yield.
    #[arg(long, value_enum, default_value_t = Rule::Midpoint)]
    both_trimmable: Rule,

    /// Tie-break when several claimants cannot yield.
    #[arg(long, value_enum, default_value_t = Rule::LongestClaim)]
    neither_trimmable: Rule,
}

/// Output format selection.
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// GeoJSON FeatureCollections.
    Geojson,
    /// CSV row tables.
    Csv,
    /// Both GeoJSON and CSV.
    Both,
}

/// Coordinate system selection.
#[derive(Clone, Copy, ValueEnum)]
enum Coordinates {
    /// Longitude/latitude in degrees.
    Wgs84,
    /// Planar coordinates in metres.
    Planar,
}

impl From<Coordinates> for CoordinateSystem {
    fn from(c: Coordinates) -> Self {
        match c {
            Coordinates::Wgs84 => Self::Wgs84,
            Coordinates::Planar => Self::Planar,
        }
    }
}

/// Dispute tie-break selection.
#[derive(Clone, Copy, ValueEnum)]
enum Rule {
    /// Split two-way overlaps at their midpoint.
    Midpoint,
    /// Longest claim wins.
    LongestClaim,
    /// Lowest path id wins.
    FirstPath,
}

impl From<Rule> for TieBreak {
    fn from(r: Rule) -> Self {
        match r {
            Rule::Midpoint => Self::Midpoint,
            Rule::LongestClaim => Self::LongestClaim,
            Rule::FirstPath => Self::FirstPath,
        }
    }
}

/// Build a [`ConflationConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual flags are ignored.
fn config_from_args(args: &RunArgs) -> Result<ConflationConfig> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).context("parsing --config-json");
    }
    Ok(ConflationConfig {
        coordinate_system: args.coordinates.into(),
        snap_tolerance: args.snap_tolerance,
        min_assigned_length: args.min_assigned_length,
        dispute_policy: DisputePolicy {
            both_trimmable: args.both_trimmable.into(),
            neither_trimmable: args.neither_trimmable.into(),
        },
    })
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose > 0 {
            "conflate=debug,conflate_engine=debug"
        } else {
            "warn"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match &cli.command {
        Command::Run(args) => run(args),
        Command::Linemerge { input } => linemerge(input),
        Command::Paths { edges, coordinates } => paths(edges, (*coordinates).into()),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let config = config_from_args(args)?;
    let system = config.coordinate_system;

    let references = input::read_references(&args.references, system)?;
    let candidates = input::read_candidates(&args.candidates, system)?;
    let paths = args
        .paths
        .as_deref()
        .map(input::read_paths)
        .transpose()?
        .unwrap_or_default();
    info!(
        references = references.len(),
        edges = candidates.len(),
        paths = paths.len(),
        "inputs loaded"
    );

    let store = FileBlackboard::open(&args.blackboard)
        .with_context(|| format!("opening blackboard {}", args.blackboard.display()))?;
    let (store, result) =
        conflate(store, config, references, &paths, candidates).context("conflation failed")?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    write_outputs(&args.out_dir, args.format, &store, &result, system)?;
    store.close().context("closing blackboard")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result.diagnostics)?);
    } else {
        println!("{}", result.diagnostics.report());
    }
    Ok(())
}

fn write_file(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = contents.len(), "wrote output");
    Ok(())
}

fn write_outputs(
    dir: &Path,
    format: Format,
    store: &impl Blackboard,
    result: &ConflationResult,
    system: CoordinateSystem,
) -> Result<()> {
    if matches!(format, Format::Geojson | Format::Both) {
        let references = &store.tables().references;
        let assigned = conflate_export::assigned_to_geojson(&result.assigned, references, system)?;
        write_file(dir, "assigned.geojson", &serde_json::to_string(&assigned)?)?;
        let chosen = conflate_export::chosen_to_geojson(&result.chosen)?;
        write_file(dir, "chosen.geojson", &serde_json::to_string(&chosen)?)?;
        let disputes = conflate_export::disputes_to_geojson(&result.disputes, references, system)?;
        write_file(dir, "disputes.geojson", &serde_json::to_string(&disputes)?)?;
    }
    if matches!(format, Format::Csv | Format::Both) {
        write_file(dir, "assigned.csv", &conflate_export::assigned_csv(&result.assigned)?)?;
        write_file(dir, "chosen.csv", &conflate_export::chosen_csv(&result.chosen)?)?;
        write_file(dir, "disputes.csv", &conflate_export::disputes_csv(&result.disputes)?)?;
        write_file(dir, "claimants.csv", &conflate_export::claimants_csv(&result.disputes)?)?;
    }
    Ok(())
}

fn linemerge(path: &Path) -> Result<()> {
    let mut features = Vec::new();
    for feature in input::read_features(path)? {
        let Some(geometry) = input::linear_geometry(&feature)? else {
            tracing::warn!(id = ?feature.id, "skipping feature without linear geometry");
            continue;
        };
        features.push(Feature {
            geometry: conflate_export::line_geometry(&merge(&geometry)),
            ..feature
        });
    }
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    println!("{}", serde_json::to_string(&collection)?);
    Ok(())
}

fn paths(path: &Path, system: CoordinateSystem) -> Result<()> {
    let edges = input::read_edges(path, system)?;
    let records: Vec<input::PathRecord> = build_target_map_paths(&edges)
        .iter()
        .map(input::PathRecord::from)
        .collect();
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
