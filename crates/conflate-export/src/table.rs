//! CSV row tables.
//!
//! Each function renders one table with a header row; column names are
//! the camelCase field names of the engine's row types.

use conflate_engine::{AssignedMatch, ChosenMatch, Dispute};
use serde::Serialize;

use crate::ExportError;

fn write_rows<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer.into_inner().map_err(csv::IntoInnerError::into_error)?;
    Ok(String::from_utf8(bytes)?)
}

/// One row per chosen segment.
///
/// # Errors
///
/// Returns an [`ExportError`] if a row cannot be written.
pub fn chosen_csv<'a>(
    chosen: impl IntoIterator<Item = &'a ChosenMatch>,
) -> Result<String, ExportError> {
    write_rows(chosen.into_iter().flat_map(ChosenMatch::rows))
}

/// One row per dispute.
///
/// # Errors
///
/// Returns an [`ExportError`] if a row cannot be written.
pub fn disputes_csv(disputes: &[Dispute]) -> Result<String, ExportError> {
    write_rows(disputes.iter().map(Dispute::row))
}

/// One row per dispute claimant.
///
/// # Errors
///
/// Returns an [`ExportError`] if a row cannot be written.
pub fn claimants_csv(disputes: &[Dispute]) -> Result<String, ExportError> {
    write_rows(disputes.iter().flat_map(Dispute::claimant_rows))
}

/// One row per assigned match.
///
/// # Errors
///
/// Returns an [`ExportError`] if a row cannot be written.
pub fn assigned_csv(assigned: &[AssignedMatch]) -> Result<String, ExportError> {
    write_rows(assigned)
}
