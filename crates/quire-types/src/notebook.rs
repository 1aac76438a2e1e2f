//! Notebook document model: notebooks, worksheets, cells and outputs.
//!
//! ```text
//! Notebook (NotebookId)
//!     └── worksheetIds: [WorksheetId]        ← display order, insertion order
//!     └── worksheets: {WorksheetId → Worksheet}
//!             └── cells: [Cell]              ← document flow, order significant
//!                     └── outputs: [CellOutput]   (code cells only)
//! ```
//!
//! The wire/persisted shape is camelCase JSON. `worksheetIds` and the keys of
//! `worksheets` must be the same set; [`Notebook::validate`] checks this for
//! documents that arrive from outside (storage, clients).

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{CellId, NotebookId, WorksheetId};

/// Free-form metadata attached to notebooks, worksheets and cells.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Alternate renderings of one output, keyed by MIME type.
///
/// Ordered so that serialized output is stable across writes.
pub type MimetypeBundle = BTreeMap<String, String>;

/// Default name for a freshly created worksheet.
pub const DEFAULT_WORKSHEET_NAME: &str = "Untitled Worksheet";

/// Plain-text MIME type, the rendering every output is expected to carry.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Invariant violations found while validating an externally supplied notebook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// An id in `worksheetIds` has no worksheet entry.
    #[error("worksheet id {0} is listed but has no worksheet")]
    MissingWorksheet(WorksheetId),

    /// A worksheet entry is not listed in `worksheetIds`.
    #[error("worksheet {0} is not listed in worksheetIds")]
    OrphanWorksheet(WorksheetId),

    /// A worksheet entry is keyed differently from its own id.
    #[error("worksheet keyed as {key} carries id {id}")]
    MismatchedWorksheetKey { key: WorksheetId, id: WorksheetId },

    /// `worksheetIds` lists the same worksheet twice.
    #[error("worksheet id {0} is listed more than once")]
    DuplicateWorksheet(WorksheetId),

    /// The notebook has no worksheets at all.
    #[error("notebook has no worksheets")]
    NoWorksheets,

    /// Two cells in one worksheet share an id.
    #[error("cell id {cell_id} appears twice in worksheet {worksheet_id}")]
    DuplicateCell {
        cell_id: CellId,
        worksheet_id: WorksheetId,
    },
}

// ============================================================================
// Kinds
// ============================================================================

/// What a cell holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum CellKind {
    /// Executable source; the only kind that carries outputs and a prompt.
    #[default]
    Code,
    /// Markdown prose.
    #[serde(alias = "md")]
    #[strum(serialize = "markdown", serialize = "md")]
    Markdown,
    /// Section heading; `metadata.level` selects the heading depth.
    Heading,
}

impl CellKind {
    /// Parse from string (case-insensitive, accepts `md`).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Heading => "heading",
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, CellKind::Code)
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stream an output came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum OutputKind {
    /// Value of the last expression (or rich display data).
    Result,
    Stdout,
    Stderr,
    /// Execution failure summary.
    Error,
}

impl OutputKind {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Result => "result",
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::Error => "error",
        }
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outputs and cells
// ============================================================================

/// One output of a code cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellOutput {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub mimetype_bundle: MimetypeBundle,
}

impl CellOutput {
    pub fn new(kind: OutputKind, mimetype_bundle: MimetypeBundle) -> Self {
        Self {
            kind,
            mimetype_bundle,
        }
    }

    /// Output carrying a single `text/plain` rendering.
    pub fn plain_text(kind: OutputKind, text: impl Into<String>) -> Self {
        let mut bundle = MimetypeBundle::new();
        bundle.insert(MIME_TEXT_PLAIN.to_string(), text.into());
        Self::new(kind, bundle)
    }

    /// The `text/plain` rendering, if present.
    pub fn text(&self) -> Option<&str> {
        self.mimetype_bundle.get(MIME_TEXT_PLAIN).map(String::as_str)
    }
}

/// A single notebook cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub id: CellId,
    #[serde(rename = "type")]
    pub kind: CellKind,
    #[serde(default)]
    pub source: String,
    /// Execution counter of the last completed run (code cells only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
}

impl Cell {
    /// Create a cell with the defaults appropriate to its kind.
    ///
    /// Heading cells start at level 1; everything else starts with empty
    /// metadata. No cell starts with outputs or a prompt.
    pub fn new(id: CellId, kind: CellKind, source: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        if kind == CellKind::Heading {
            metadata.insert("level".to_string(), serde_json::Value::from(1));
        }
        Self {
            id,
            kind,
            source: source.into(),
            prompt: None,
            metadata,
            outputs: Vec::new(),
        }
    }

    pub fn code(id: CellId, source: impl Into<String>) -> Self {
        Self::new(id, CellKind::Code, source)
    }

    pub fn markdown(id: CellId, source: impl Into<String>) -> Self {
        Self::new(id, CellKind::Markdown, source)
    }

    pub fn heading(id: CellId, source: impl Into<String>) -> Self {
        Self::new(id, CellKind::Heading, source)
    }

    pub fn is_code(&self) -> bool {
        self.kind.is_code()
    }
}

// ============================================================================
// Worksheets
// ============================================================================

/// An ordered container of cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worksheet {
    pub id: WorksheetId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub cells: Vec<Cell>,
}

impl Worksheet {
    pub fn new(id: WorksheetId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            metadata: Metadata::new(),
            cells: Vec::new(),
        }
    }

    /// Position of a cell by id (linear scan).
    pub fn index_of(&self, cell_id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| &c.id == cell_id)
    }

    pub fn cell(&self, cell_id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| &c.id == cell_id)
    }

    pub fn cell_mut(&mut self, cell_id: &CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| &c.id == cell_id)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ============================================================================
// Notebook
// ============================================================================

/// The whole authoritative document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notebook {
    pub id: NotebookId,
    #[serde(default)]
    pub metadata: Metadata,
    worksheet_ids: Vec<WorksheetId>,
    worksheets: IndexMap<WorksheetId, Worksheet>,
}

impl Notebook {
    /// A notebook with exactly one, empty, worksheet.
    pub fn empty() -> Self {
        let mut notebook = Self {
            id: NotebookId::new(),
            metadata: Metadata::new(),
            worksheet_ids: Vec::new(),
            worksheets: IndexMap::new(),
        };
        notebook.push_worksheet(Worksheet::new(WorksheetId::new(), DEFAULT_WORKSHEET_NAME));
        notebook
    }

    /// The empty notebook seeded with a heading, a markdown and a code cell.
    pub fn starter() -> Self {
        let mut notebook = Self::empty();
        if let Some(worksheet) = notebook.first_worksheet_mut() {
            worksheet
                .cells
                .push(Cell::heading(CellId::new(), "This is a heading"));
            worksheet
                .cells
                .push(Cell::markdown(CellId::new(), "You **can** write markdown here"));
            worksheet.cells.push(Cell::code(CellId::new(), ""));
        }
        notebook
    }

    /// Append a worksheet at the end of the display order.
    ///
    /// Replaces the content of an existing worksheet with the same id without
    /// changing its position.
    pub fn push_worksheet(&mut self, worksheet: Worksheet) {
        let id = worksheet.id.clone();
        if self.worksheets.insert(id.clone(), worksheet).is_none() {
            self.worksheet_ids.push(id);
        }
    }

    /// Worksheet ids in display order.
    pub fn worksheet_ids(&self) -> &[WorksheetId] {
        &self.worksheet_ids
    }

    pub fn worksheet(&self, id: &WorksheetId) -> Option<&Worksheet> {
        self.worksheets.get(id)
    }

    pub fn worksheet_mut(&mut self, id: &WorksheetId) -> Option<&mut Worksheet> {
        self.worksheets.get_mut(id)
    }

    /// Worksheets in display order.
    pub fn worksheets(&self) -> impl Iterator<Item = &Worksheet> {
        self.worksheet_ids
            .iter()
            .filter_map(|id| self.worksheets.get(id))
    }

    /// Worksheets in display order, mutably.
    pub fn worksheets_mut(&mut self) -> impl Iterator<Item = &mut Worksheet> {
        let order = &self.worksheet_ids;
        let mut by_position: Vec<(usize, &mut Worksheet)> = self
            .worksheets
            .values_mut()
            .filter_map(|ws| order.iter().position(|id| id == &ws.id).map(|pos| (pos, ws)))
            .collect();
        by_position.sort_by_key(|(pos, _)| *pos);
        by_position.into_iter().map(|(_, ws)| ws)
    }

    pub fn first_worksheet(&self) -> Option<&Worksheet> {
        self.worksheet_ids
            .first()
            .and_then(|id| self.worksheets.get(id))
    }

    pub fn first_worksheet_mut(&mut self) -> Option<&mut Worksheet> {
        let id = self.worksheet_ids.first()?.clone();
        self.worksheets.get_mut(&id)
    }

    pub fn worksheet_count(&self) -> usize {
        self.worksheet_ids.len()
    }

    /// Total cells across all worksheets.
    pub fn cell_count(&self) -> usize {
        self.worksheets.values().map(Worksheet::len).sum()
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.worksheet_ids.is_empty() && self.worksheets.is_empty() {
            return Err(ModelError::NoWorksheets);
        }

        let mut listed = HashSet::new();
        for id in &self.worksheet_ids {
            if !listed.insert(id) {
                return Err(ModelError::DuplicateWorksheet(id.clone()));
            }
            if !self.worksheets.contains_key(id) {
                return Err(ModelError::MissingWorksheet(id.clone()));
            }
        }

        for (key, worksheet) in &self.worksheets {
            if !listed.contains(key) {
                return Err(ModelError::OrphanWorksheet(key.clone()));
            }
            if key != &worksheet.id {
                return Err(ModelError::MismatchedWorksheetKey {
                    key: key.clone(),
                    id: worksheet.id.clone(),
                });
            }

            let mut seen = HashSet::new();
            for cell in &worksheet.cells {
                if !seen.insert(&cell.id) {
                    return Err(ModelError::DuplicateCell {
                        cell_id: cell.id.clone(),
                        worksheet_id: worksheet.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for Notebook {
    fn default() -> Self {
        Self::empty()
    }
}
