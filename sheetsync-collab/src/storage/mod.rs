//! Persistent storage for spreadsheet documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   load / save    ┌────────────────┐
//! │ Session     │ ───────────────► │ DocumentStore  │
//! │ (in-memory) │  whole document  │ (trait)        │
//! └─────────────┘                  └───────┬────────┘
//!                                          │
//!                         ┌────────────────┴───────────────┐
//!                         ▼                                ▼
//!                  ┌──────────────┐                 ┌──────────────┐
//!                  │ XmlFileStore │                 │ MemoryStore  │
//!                  │ <uuid>.xml   │                 │ (tests)      │
//!                  └──────────────┘                 └──────────────┘
//!
//! ┌─────────────┐  name → (password, file)   spreadsheet_files.txt
//! │ Catalog     │ ─────────────────────────► append-only record table
//! └─────────────┘
//! ```
//!
//! Documents are always written in full; there is no incremental format.

pub mod catalog;
pub mod memory;
pub mod xml;

pub use catalog::{Catalog, CatalogError, Document};
pub use memory::MemoryStore;
pub use xml::{decode_spreadsheet, encode_spreadsheet, XmlFileStore};

use std::io;
use std::path::{Path, PathBuf};

use crate::cells::CellStore;

/// Whole-document persistence.
///
/// Implementations are called from session actors and from the catalog, so
/// they must be shareable across tasks.
pub trait DocumentStore: Send + Sync {
    /// Read the document at `path`.
    fn load(&self, path: &Path) -> Result<CellStore, StoreError>;

    /// Overwrite the document at `path` with `cells`.
    fn save(&self, path: &Path, cells: &CellStore) -> Result<(), StoreError>;

    /// Remove the document at `path`. Missing documents are not an error.
    fn discard(&self, path: &Path) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("encoding error: {0}")]
    Encode(String),
}

impl StoreError {
    /// Wrap an I/O error for `path`, folding `NotFound` into [`StoreError::Missing`].
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::Missing(path.to_path_buf())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}
