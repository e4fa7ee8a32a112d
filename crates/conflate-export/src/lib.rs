//! conflate-export: Pure format serializers (sans-IO)
//!
//! Converts conflation results into output formats: GeoJSON feature
//! collections (matched sections sliced out of their reference geometry)
//! and CSV row tables.

pub mod features;
pub mod table;

pub use features::{assigned_to_geojson, chosen_to_geojson, disputes_to_geojson, line_geometry};
pub use table::{assigned_csv, chosen_csv, claimants_csv, disputes_csv};

/// Errors from serializing conflation results.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// A record could not be converted to JSON properties.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A record could not be written as a CSV row.
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    /// The CSV buffer could not be flushed.
    #[error("CSV flush failed: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV writer produced invalid UTF-8.
    #[error("CSV output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
