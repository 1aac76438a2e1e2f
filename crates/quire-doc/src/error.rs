//! Error types for document operations.

use thiserror::Error;

use quire_types::{CellId, WorksheetId};

/// Errors that can occur while applying an action to a notebook.
///
/// Every variant leaves the document exactly as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    /// No worksheet with this id.
    #[error("worksheet not found: {0}")]
    UnknownWorksheet(WorksheetId),

    /// No cell with this id in the given worksheet.
    ///
    /// Also raised when an `insertAfter` anchor does not exist.
    #[error("cell {cell_id} not found in worksheet {worksheet_id}")]
    UnknownCell {
        cell_id: CellId,
        worksheet_id: WorksheetId,
    },

    /// A cell with this id already exists in the target worksheet.
    #[error("cell {cell_id} already exists in worksheet {worksheet_id}")]
    DuplicateCell {
        cell_id: CellId,
        worksheet_id: WorksheetId,
    },

    /// The action kind is not a document edit.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
}

impl DocError {
    pub fn unknown_cell(cell_id: &CellId, worksheet_id: &WorksheetId) -> Self {
        DocError::UnknownCell {
            cell_id: cell_id.clone(),
            worksheet_id: worksheet_id.clone(),
        }
    }
}
