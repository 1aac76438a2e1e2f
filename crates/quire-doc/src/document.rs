//! The authoritative notebook and the operations that mutate it.
//!
//! `apply` is synchronous and does no I/O. It either mutates the notebook and
//! returns the [`Update`] describing the change, or returns a [`DocError`] and
//! leaves the notebook untouched. Every reference is resolved before the
//! first write, so there is no partial application to undo.
//!
//! # Output and metadata semantics
//!
//! ```text
//! cell.update  outputs + replaceOutputs=false   append, update echoes only the appended outputs
//!              outputs + replaceOutputs=true    replace, update echoes the full new sequence
//!              metadata + replaceMetadata=false merge key by key, update echoes only the given keys
//!              metadata + replaceMetadata=true  replace wholesale
//! ```

use quire_types::{
    Action, Cell, CellId, CellUpdate, InsertPoint, Notebook, Update, UpdateCell, Worksheet,
    WorksheetId,
};

use crate::{DocError, Result};

/// A notebook plus the state machine that edits it.
#[derive(Clone, Debug)]
pub struct NotebookDocument {
    notebook: Notebook,

    /// Incremented on each successful mutation.
    version: u64,
}

impl NotebookDocument {
    /// Wrap an existing notebook.
    pub fn new(notebook: Notebook) -> Self {
        Self {
            notebook,
            version: 0,
        }
    }

    /// A document over [`Notebook::empty`].
    pub fn empty() -> Self {
        Self::new(Notebook::empty())
    }

    /// Apply one document edit.
    ///
    /// Session-level kinds (`cell.execute`, `notebook.executeCells`,
    /// `notebook.rename`, `composite`) are not edits and fail with
    /// [`DocError::UnsupportedAction`].
    pub fn apply(&mut self, action: &Action) -> Result<Update> {
        let result = match action {
            Action::AddCell {
                worksheet_id,
                cell_id,
                kind,
                source,
                insert_after,
            } => self.add_cell(
                worksheet_id,
                Cell::new(cell_id.clone(), *kind, source.clone()),
                insert_after,
            ),
            Action::DeleteCell {
                worksheet_id,
                cell_id,
            } => self.delete_cell(worksheet_id, cell_id),
            Action::MoveCell {
                source_worksheet_id,
                destination_worksheet_id,
                cell_id,
                insert_after,
            } => self.move_cell(
                source_worksheet_id,
                destination_worksheet_id,
                cell_id,
                insert_after,
            ),
            Action::UpdateCell(edit) => self.update_cell(edit),
            Action::ClearOutput {
                worksheet_id,
                cell_id,
            } => self.clear_output(worksheet_id, cell_id).map(Update::from),
            Action::ClearOutputs => Ok(self.clear_outputs()),
            Action::ExecuteCell { .. }
            | Action::ExecuteCells
            | Action::Rename { .. }
            | Action::Composite { .. } => {
                Err(DocError::UnsupportedAction(action.kind().to_string()))
            }
        };

        match &result {
            Ok(_) => self.version += 1,
            Err(e) => tracing::debug!(action = action.kind(), error = %e, "apply failed"),
        }
        result
    }

    /// Clone of the entire current notebook.
    pub fn snapshot(&self) -> Notebook {
        self.notebook.clone()
    }

    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    pub fn into_notebook(self) -> Notebook {
        self.notebook
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn worksheet(&self, worksheet_id: &WorksheetId) -> Result<&Worksheet> {
        self.notebook
            .worksheet(worksheet_id)
            .ok_or_else(|| DocError::UnknownWorksheet(worksheet_id.clone()))
    }

    /// Look up one cell, worksheet-scoped.
    pub fn cell(&self, cell_id: &CellId, worksheet_id: &WorksheetId) -> Result<&Cell> {
        self.worksheet(worksheet_id)?
            .cell(cell_id)
            .ok_or_else(|| DocError::unknown_cell(cell_id, worksheet_id))
    }

    /// Every code cell, worksheets in display order, cells in document flow.
    pub fn code_cells(&self) -> impl Iterator<Item = (&WorksheetId, &Cell)> {
        self.notebook
            .worksheets()
            .flat_map(|ws| ws.cells.iter().filter(|c| c.is_code()).map(move |c| (&ws.id, c)))
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn worksheet_mut(&mut self, worksheet_id: &WorksheetId) -> Result<&mut Worksheet> {
        self.notebook
            .worksheet_mut(worksheet_id)
            .ok_or_else(|| DocError::UnknownWorksheet(worksheet_id.clone()))
    }

    fn add_cell(
        &mut self,
        worksheet_id: &WorksheetId,
        cell: Cell,
        insert_after: &InsertPoint,
    ) -> Result<Update> {
        let worksheet = self.worksheet_mut(worksheet_id)?;
        if worksheet.index_of(&cell.id).is_some() {
            return Err(DocError::DuplicateCell {
                cell_id: cell.id,
                worksheet_id: worksheet_id.clone(),
            });
        }
        let index = insertion_index(worksheet, insert_after)?;
        worksheet.cells.insert(index, cell.clone());

        Ok(Update::AddCell {
            worksheet_id: worksheet_id.clone(),
            cell,
            insert_after: insert_after.clone(),
        })
    }

    fn delete_cell(&mut self, worksheet_id: &WorksheetId, cell_id: &CellId) -> Result<Update> {
        let worksheet = self.worksheet_mut(worksheet_id)?;
        let index = worksheet
            .index_of(cell_id)
            .ok_or_else(|| DocError::unknown_cell(cell_id, worksheet_id))?;
        worksheet.cells.remove(index);

        Ok(Update::DeleteCell {
            worksheet_id: worksheet_id.clone(),
            cell_id: cell_id.clone(),
        })
    }

    fn move_cell(
        &mut self,
        source_id: &WorksheetId,
        destination_id: &WorksheetId,
        cell_id: &CellId,
        insert_after: &InsertPoint,
    ) -> Result<Update> {
        let source_index = self
            .worksheet(source_id)?
            .index_of(cell_id)
            .ok_or_else(|| DocError::unknown_cell(cell_id, source_id))?;

        let destination = self.worksheet(destination_id)?;
        if source_id != destination_id && destination.index_of(cell_id).is_some() {
            return Err(DocError::DuplicateCell {
                cell_id: cell_id.clone(),
                worksheet_id: destination_id.clone(),
            });
        }
        // A cell cannot be anchored after itself: it is gone once removed.
        if insert_after.anchor() == Some(cell_id) {
            return Err(DocError::unknown_cell(cell_id, destination_id));
        }
        insertion_index(destination, insert_after)?;

        let cell = self.worksheet_mut(source_id)?.cells.remove(source_index);
        let destination = self.worksheet_mut(destination_id)?;
        let index = insertion_index(destination, insert_after)?;
        destination.cells.insert(index, cell);

        Ok(Update::MoveCell {
            source_worksheet_id: source_id.clone(),
            destination_worksheet_id: destination_id.clone(),
            cell_id: cell_id.clone(),
            insert_after: insert_after.clone(),
        })
    }

    fn update_cell(&mut self, edit: &UpdateCell) -> Result<Update> {
        let worksheet = self.worksheet_mut(&edit.worksheet_id)?;
        let cell = worksheet
            .cell_mut(&edit.cell_id)
            .ok_or_else(|| DocError::unknown_cell(&edit.cell_id, &edit.worksheet_id))?;

        let mut update = CellUpdate::new(edit.worksheet_id.clone(), edit.cell_id.clone());

        if let Some(source) = &edit.source {
            cell.source = source.clone();
            update.source = Some(source.clone());
        }

        if let Some(prompt) = &edit.prompt {
            cell.prompt = Some(prompt.clone());
            update.prompt = Some(prompt.clone());
        }

        if let Some(outputs) = &edit.outputs {
            if edit.replace_outputs {
                cell.outputs = outputs.clone();
            } else {
                cell.outputs.extend(outputs.iter().cloned());
            }
            update.outputs = Some(outputs.clone());
            update.replace_outputs = edit.replace_outputs;
        }

        if let Some(metadata) = &edit.metadata {
            if edit.replace_metadata {
                cell.metadata = metadata.clone();
            } else {
                for (key, value) in metadata {
                    cell.metadata.insert(key.clone(), value.clone());
                }
            }
            update.metadata = Some(metadata.clone());
            update.replace_metadata = edit.replace_metadata;
        }

        Ok(update.into())
    }

    fn clear_output(&mut self, worksheet_id: &WorksheetId, cell_id: &CellId) -> Result<CellUpdate> {
        let cell = self
            .worksheet_mut(worksheet_id)?
            .cell_mut(cell_id)
            .ok_or_else(|| DocError::unknown_cell(cell_id, worksheet_id))?;
        cell.outputs.clear();
        Ok(CellUpdate::cleared(worksheet_id.clone(), cell_id.clone()))
    }

    fn clear_outputs(&mut self) -> Update {
        let mut sub_updates = Vec::new();
        for worksheet in self.notebook.worksheets_mut() {
            for cell in worksheet.cells.iter_mut().filter(|c| c.is_code()) {
                cell.outputs.clear();
                sub_updates.push(CellUpdate::cleared(worksheet.id.clone(), cell.id.clone()).into());
            }
        }
        Update::Composite { sub_updates }
    }
}

impl Default for NotebookDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Notebook> for NotebookDocument {
    fn from(notebook: Notebook) -> Self {
        Self::new(notebook)
    }
}

/// Index at which a cell lands for the given insertion point.
fn insertion_index(worksheet: &Worksheet, insert_after: &InsertPoint) -> Result<usize> {
    match insert_after {
        InsertPoint::Head => Ok(0),
        InsertPoint::After(anchor) => worksheet
            .index_of(anchor)
            .map(|i| i + 1)
            .ok_or_else(|| DocError::unknown_cell(anchor, &worksheet.id)),
    }
}
