//! Client → server actions.
//!
//! An action is client intent: it is never mutated after decoding and it is
//! not itself a change notification. The authoritative result of applying an
//! action is the [`Update`](crate::update::Update) broadcast back to every
//! client, including the author.
//!
//! Wire form is a JSON object tagged by its `action` field:
//!
//! ```json
//! {"action": "worksheet.addCell", "worksheetId": "w", "cellId": "c",
//!  "type": "code", "source": "1+1", "insertAfter": null}
//! ```

use serde::{Deserialize, Serialize};

use crate::ids::{CellId, WorksheetId};
use crate::notebook::{CellKind, CellOutput, Metadata};

/// Errors decoding an action from the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The `action` discriminator names no known kind.
    #[error("unsupported action kind: {0}")]
    UnsupportedAction(String),

    /// The message has no string `action` field.
    #[error("message has no action discriminator")]
    MissingKind,

    /// A known kind with a payload that does not fit its shape.
    #[error("malformed {kind} action: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Insertion point
// ============================================================================

/// Where a new or moved cell lands in a worksheet.
///
/// On the wire this is `insertAfter`: `null` and a missing field both mean
/// [`InsertPoint::Head`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<CellId>", into = "Option<CellId>")]
pub enum InsertPoint {
    /// Position 0.
    #[default]
    Head,
    /// Immediately after the referenced cell.
    After(CellId),
}

impl InsertPoint {
    pub fn after(cell_id: impl Into<CellId>) -> Self {
        InsertPoint::After(cell_id.into())
    }

    pub fn anchor(&self) -> Option<&CellId> {
        match self {
            InsertPoint::Head => None,
            InsertPoint::After(id) => Some(id),
        }
    }
}

impl From<Option<CellId>> for InsertPoint {
    fn from(value: Option<CellId>) -> Self {
        match value {
            Some(id) => InsertPoint::After(id),
            None => InsertPoint::Head,
        }
    }
}

impl From<InsertPoint> for Option<CellId> {
    fn from(value: InsertPoint) -> Self {
        match value {
            InsertPoint::Head => None,
            InsertPoint::After(id) => Some(id),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Field-level edit of one cell. Every field but the address is optional.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCell {
    pub worksheet_id: WorksheetId,
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<CellOutput>>,
    /// `false`/absent appends `outputs`; `true` replaces the whole sequence.
    #[serde(default)]
    pub replace_outputs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// `false`/absent merges `metadata` key by key; `true` replaces it.
    #[serde(default)]
    pub replace_metadata: bool,
}

impl UpdateCell {
    /// An edit addressing one cell with nothing set yet.
    pub fn new(worksheet_id: WorksheetId, cell_id: CellId) -> Self {
        Self {
            worksheet_id,
            cell_id,
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn append_outputs(mut self, outputs: Vec<CellOutput>) -> Self {
        self.outputs = Some(outputs);
        self.replace_outputs = false;
        self
    }

    pub fn replace_outputs(mut self, outputs: Vec<CellOutput>) -> Self {
        self.outputs = Some(outputs);
        self.replace_outputs = true;
        self
    }

    pub fn merge_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self.replace_metadata = false;
        self
    }

    pub fn replace_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self.replace_metadata = true;
        self
    }
}

/// Client-requested operation on the notebook.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    #[serde(rename = "worksheet.addCell", rename_all = "camelCase")]
    AddCell {
        worksheet_id: WorksheetId,
        cell_id: CellId,
        #[serde(rename = "type")]
        kind: CellKind,
        #[serde(default)]
        source: String,
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
    UpdateCell(UpdateCell),

    #[serde(rename = "cell.clearOutput", rename_all = "camelCase")]
    ClearOutput {
        worksheet_id: WorksheetId,
        cell_id: CellId,
    },

    #[serde(rename = "cell.execute", rename_all = "camelCase")]
    ExecuteCell {
        worksheet_id: WorksheetId,
        cell_id: CellId,
    },

    #[serde(rename = "notebook.clearOutputs")]
    ClearOutputs,

    #[serde(rename = "notebook.executeCells")]
    ExecuteCells,

    /// Move the notebook to a new storage path.
    #[serde(rename = "notebook.rename")]
    Rename { path: String },

    /// Ordered sub-actions, applied in order.
    #[serde(rename = "composite", rename_all = "camelCase")]
    Composite { sub_actions: Vec<Action> },
}

impl Action {
    /// Every kind string the protocol knows.
    pub const KINDS: &'static [&'static str] = &[
        "worksheet.addCell",
        "worksheet.deleteCell",
        "worksheet.moveCell",
        "cell.update",
        "cell.clearOutput",
        "cell.execute",
        "notebook.clearOutputs",
        "notebook.executeCells",
        "notebook.rename",
        "composite",
    ];

    /// Wire discriminator of this action.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::AddCell { .. } => "worksheet.addCell",
            Action::DeleteCell { .. } => "worksheet.deleteCell",
            Action::MoveCell { .. } => "worksheet.moveCell",
            Action::UpdateCell(_) => "cell.update",
            Action::ClearOutput { .. } => "cell.clearOutput",
            Action::ExecuteCell { .. } => "cell.execute",
            Action::ClearOutputs => "notebook.clearOutputs",
            Action::ExecuteCells => "notebook.executeCells",
            Action::Rename { .. } => "notebook.rename",
            Action::Composite { .. } => "composite",
        }
    }

    /// Decode a wire message, separating unknown kinds from bad payloads.
    pub fn from_json(value: serde_json::Value) -> Result<Action, ProtocolError> {
        let kind = value
            .get("action")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingKind)?
            .to_string();

        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnsupportedAction(kind));
        }
        Self::check_nested_kinds(&value)?;

        serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
    }

    /// Surface an unknown kind at any composite depth by name instead of as
    /// a serde message.
    fn check_nested_kinds(value: &serde_json::Value) -> Result<(), ProtocolError> {
        let Some(subs) = value.get("subActions").and_then(serde_json::Value::as_array) else {
            return Ok(());
        };
        for sub in subs {
            if let Some(sub_kind) = sub.get("action").and_then(serde_json::Value::as_str) {
                if !Self::KINDS.contains(&sub_kind) {
                    return Err(ProtocolError::UnsupportedAction(sub_kind.to_string()));
                }
            }
            Self::check_nested_kinds(sub)?;
        }
        Ok(())
    }

    /// Decode one wire line.
    pub fn from_str_json(line: &str) -> Result<Action, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|source| ProtocolError::Malformed {
                kind: "<unparsed>".to_string(),
                source,
            })?;
        Self::from_json(value)
    }

    /// True for kinds the document state machine applies directly.
    pub fn is_document_edit(&self) -> bool {
        matches!(
            self,
            Action::AddCell { .. }
                | Action::DeleteCell { .. }
                | Action::MoveCell { .. }
                | Action::UpdateCell(_)
                | Action::ClearOutput { .. }
                | Action::ClearOutputs
        )
    }
}

impl From<UpdateCell> for Action {
    fn from(value: UpdateCell) -> Self {
        Action::UpdateCell(value)
    }
}
