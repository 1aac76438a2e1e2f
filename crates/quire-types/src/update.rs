//! Server → client updates.
//!
//! Updates are the only channel through which clients learn of document
//! changes. Cell edits are delta-only: an append carries just the appended
//! outputs and a metadata merge carries just the merged keys, so every client
//! replays the same operation against its own copy.

use serde::{Deserialize, Serialize};

use crate::action::InsertPoint;
use crate::ids::{CellId, WorksheetId};
use crate::notebook::{Cell, CellOutput, Metadata, Notebook};

/// Delta for a single cell.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub worksheet_id: WorksheetId,
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<CellOutput>>,
    #[serde(default)]
    pub replace_outputs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub replace_metadata: bool,
}

impl CellUpdate {
    pub fn new(worksheet_id: WorksheetId, cell_id: CellId) -> Self {
        Self {
            worksheet_id,
            cell_id,
            ..Default::default()
        }
    }

    /// The update produced by clearing one cell's outputs.
    pub fn cleared(worksheet_id: WorksheetId, cell_id: CellId) -> Self {
        Self {
            outputs: Some(Vec::new()),
            replace_outputs: true,
            ..Self::new(worksheet_id, cell_id)
        }
    }
}

/// Server-originated description of an applied change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update")]
pub enum Update {
    /// The entire current notebook.
    #[serde(rename = "notebook.snapshot")]
    Snapshot { notebook: Notebook },

    /// Kernel state (`starting`, `idle`, `busy`, `dead`, ...).
    #[serde(rename = "notebook.sessionStatus", rename_all = "camelCase")]
    SessionStatus {
        kernel_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kernel_name: Option<String>,
    },

    /// Notebook-level attributes changed (currently its path).
    #[serde(rename = "notebook.metadata")]
    NotebookMetadata { path: String },

    #[serde(rename = "worksheet.addCell", rename_all = "camelCase")]
    AddCell {
        worksheet_id: WorksheetId,
        cell: Cell,
        #[serde(default)]
        insert_after: InsertPoint,
    },

    #[serde(rename = "worksheet.deleteCell", rename_all = "camelCase")]
    DeleteCell {
        worksheet_id: WorksheetId,
        cell_id: CellId,
    },

    #[serde(rename = "worksheet.moveCell", rename_all = "camelCase")]
    MoveCell {
        source_worksheet_id: WorksheetId,
        destination_worksheet_id: WorksheetId,
        cell_id: CellId,
        #[serde(default)]
        insert_after: InsertPoint,
    },

    #[serde(rename = "cell.update")]
    CellUpdate(CellUpdate),

    #[serde(rename = "composite", rename_all = "camelCase")]
    Composite { sub_updates: Vec<Update> },
}

impl Update {
    /// Wire discriminator of this update.
    pub fn kind(&self) -> &'static str {
        match self {
            Update::Snapshot { .. } => "notebook.snapshot",
            Update::SessionStatus { .. } => "notebook.sessionStatus",
            Update::NotebookMetadata { .. } => "notebook.metadata",
            Update::AddCell { .. } => "worksheet.addCell",
            Update::DeleteCell { .. } => "worksheet.deleteCell",
            Update::MoveCell { .. } => "worksheet.moveCell",
            Update::CellUpdate(_) => "cell.update",
            Update::Composite { .. } => "composite",
        }
    }

    /// Whether this update reflects a change to document content.
    ///
    /// Snapshots and kernel status carry no change and never trigger a write.
    pub fn is_mutation(&self) -> bool {
        match self {
            Update::Snapshot { .. } | Update::SessionStatus { .. } => false,
            Update::Composite { sub_updates } => sub_updates.iter().any(Update::is_mutation),
            _ => true,
        }
    }

    pub fn snapshot(notebook: Notebook) -> Self {
        Update::Snapshot { notebook }
    }

    pub fn session_status(kernel_state: impl Into<String>) -> Self {
        Update::SessionStatus {
            kernel_state: kernel_state.into(),
            kernel_name: None,
        }
    }
}

impl From<CellUpdate> for Update {
    fn from(value: CellUpdate) -> Self {
        Update::CellUpdate(value)
    }
}
