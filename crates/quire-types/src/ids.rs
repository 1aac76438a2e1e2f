//! Typed identifiers for notebooks, worksheets, cells, requests and sessions.
//!
//! Cell and worksheet ids are chosen by whoever creates the entity (clients
//! generate cell ids before sending `worksheet.addCell`), so every id here is
//! an opaque string rather than a UUID. `new()` mints a random UUIDv4 string
//! for server-side creation. The `short()` form is for log lines only and is
//! never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        #[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $T(String);

        impl $T {
            /// Mint a fresh random id (UUIDv4, hyphenated).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow the raw string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 8 characters, for human display only.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((idx, _)) => &self.0[..idx],
                    None => &self.0,
                }
            }

            /// Consume into the raw string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $T {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $T {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $T {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $T {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $T {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_typed_id!(NotebookId, "NotebookId");
impl_typed_id!(WorksheetId, "WorksheetId");
impl_typed_id!(CellId, "CellId");
impl_typed_id!(RequestId, "RequestId");
impl_typed_id!(ConnectionId, "ConnectionId");
impl_typed_id!(SessionId, "SessionId");

/// Worksheet-scoped address of a cell.
///
/// Cell ids are only unique within their worksheet, so every lookup carries
/// both halves.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellRef {
    pub cell_id: CellId,
    pub worksheet_id: WorksheetId,
}

impl CellRef {
    pub fn new(cell_id: CellId, worksheet_id: WorksheetId) -> Self {
        Self {
            cell_id,
            worksheet_id,
        }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worksheet_id.short(), self.cell_id.short())
    }
}
