//! Notebook document state machine for quire.
//!
//! [`NotebookDocument`] owns one [`Notebook`](quire_types::Notebook) and is the
//! only place document edits are applied. It performs no I/O and never
//! suspends, so a session can call it inline while holding its own lock.
//!
//! # Edit Semantics
//!
//! - **Lookups** are by exact id, always scoped to a worksheet
//! - **Bad references** are hard errors and leave the document untouched
//! - **Updates** are deltas: appends and merges echo only what was added

mod document;
mod error;

pub use document::NotebookDocument;
pub use error::DocError;

/// Result type for document operations.
pub type Result<T> = std::result::Result<T, DocError>;
