//! Shared document model and wire protocol for quire.
//!
//! This crate is the leaf everything else builds on: typed ids, the notebook
//! document model, and the action/update messages exchanged with clients. It
//! has **no internal quire dependencies** and performs no I/O.
//!
//! # Message Flow
//!
//! ```text
//! Client ──Action──▶ Session ──apply──▶ NotebookDocument
//!                       │                     │
//!                       ◀──────Update─────────┘
//!                       │
//!                       └──Update──▶ every connected client
//! ```
//!
//! # Key Types
//!
//! |------------------|------------------------------------------------|
//! | Type             | Purpose                                        |
//! |------------------|------------------------------------------------|
//! | [`Notebook`]     | Whole document (ordered worksheets)            |
//! | [`Worksheet`]    | Ordered cells                                  |
//! | [`Cell`]         | Source + outputs + metadata                    |
//! | [`CellOutput`]   | One output with alternate MIME renderings      |
//! | [`Action`]       | Client intent, tagged by `action`              |
//! | [`Update`]       | Applied change, tagged by `update`             |
//! | [`InsertPoint`]  | Head or after a given cell                     |
//! | [`CellRef`]      | Worksheet-scoped cell address                  |
//! |------------------|------------------------------------------------|

pub mod action;
pub mod ids;
pub mod notebook;
pub mod update;

// Re-export primary types at crate root for convenience.
pub use action::{Action, InsertPoint, ProtocolError, UpdateCell};
pub use ids::{CellId, CellRef, ConnectionId, NotebookId, RequestId, SessionId, WorksheetId};
pub use notebook::{
    Cell, CellKind, CellOutput, Metadata, MimetypeBundle, ModelError, Notebook, OutputKind,
    Worksheet, DEFAULT_WORKSHEET_NAME, MIME_TEXT_PLAIN,
};
pub use update::{CellUpdate, Update};
