//! Document catalog: client-facing name → (password, persistence path).
//!
//! On disk the catalog is a flat, append-only record table:
//!
//! ```text
//! <blank line>
//! budget
//! hunter2
//! 3f2c9a0e5b6d4c1e8f7a6b5c4d3e2f10.xml
//! ```
//!
//! File names are relative to the documents directory.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocumentStore, StoreError};
use crate::cells::CellStore;

/// Durable identity of a spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub password: String,
    /// Where the document's XML lives.
    pub path: PathBuf,
}

/// Catalog errors. The `Display` text is what clients see in FAIL replies.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("File does not exist.")]
    NotFound(String),

    #[error("Password is invalid.")]
    BadPassword(String),

    #[error("File already exists.")]
    AlreadyExists(String),

    #[error("Invalid document name.")]
    InvalidName(String),

    #[error("Catalog I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// In-memory view of the catalog file, guarded by a single lock.
///
/// The write lock is held for the whole of [`Catalog::create`], so two
/// CREATEs for the same name can never both succeed.
pub struct Catalog {
    index_path: PathBuf,
    documents_dir: PathBuf,
    entries: RwLock<HashMap<String, Document>>,
}

impl Catalog {
    /// Load the catalog at `index_path`; a missing file means an empty catalog.
    ///
    /// The documents directory is created if needed.
    pub fn open(
        index_path: impl Into<PathBuf>,
        documents_dir: impl Into<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let index_path = index_path.into();
        let documents_dir = documents_dir.into();

        fs::create_dir_all(&documents_dir).map_err(|source| CatalogError::Io {
            path: documents_dir.clone(),
            source,
        })?;

        let text = match fs::read_to_string(&index_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: index_path,
                    source,
                })
            }
        };

        let mut entries = HashMap::new();
        for document in parse_records(&text, &documents_dir) {
            if entries.contains_key(&document.name) {
                log::warn!("Catalog lists {:?} twice; keeping the first record", document.name);
                continue;
            }
            entries.insert(document.name.clone(), document);
        }

        log::info!(
            "Catalog {} loaded: {} documents",
            index_path.display(),
            entries.len()
        );

        Ok(Self {
            index_path,
            documents_dir,
            entries: RwLock::new(entries),
        })
    }

    pub async fn lookup(&self, name: &str) -> Option<Document> {
        self.entries.read().await.get(name).cloned()
    }

    /// Resolve `name` and check `password`.
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<Document, CatalogError> {
        let document = self
            .lookup(name)
            .await
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))?;
        if document.password != password {
            return Err(CatalogError::BadPassword(name.to_string()));
        }
        Ok(document)
    }

    /// Register a new, empty document.
    ///
    /// Writes the empty document first and the catalog record second; if the
    /// record cannot be appended the fresh document file is discarded again.
    pub async fn create(
        &self,
        name: &str,
        password: &str,
        store: &dyn DocumentStore,
    ) -> Result<Document, CatalogError> {
        if !is_valid_name(name) || password.contains(['\n', '\r']) {
            return Err(CatalogError::InvalidName(name.to_string()));
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(CatalogError::AlreadyExists(name.to_string()));
        }

        let file_name = format!("{}.xml", Uuid::new_v4().simple());
        let path = self.documents_dir.join(&file_name);
        store.save(&path, &CellStore::new())?;

        if let Err(source) = self.append_record(name, password, &file_name) {
            if let Err(e) = store.discard(&path) {
                log::warn!("Could not remove orphaned document {}: {e}", path.display());
            }
            return Err(CatalogError::Io {
                path: self.index_path.clone(),
                source,
            });
        }

        let document = Document {
            name: name.to_string(),
            password: password.to_string(),
            path,
        };
        entries.insert(document.name.clone(), document.clone());
        log::info!("Created document {:?} at {}", name, document.path.display());
        Ok(document)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn append_record(&self, name: &str, password: &str, file_name: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)?;
        file.write_all(format!("\n{name}\n{password}\n{file_name}\n").as_bytes())?;
        file.sync_data()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['\n', '\r'])
}

/// Parse catalog text into documents.
///
/// Records are three consecutive lines (name, password, file). Blank lines
/// between records are skipped; the password line may itself be empty.
pub fn parse_records(text: &str, documents_dir: &Path) -> Vec<Document> {
    let mut documents = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        let (Some(password), Some(file)) = (lines.next(), lines.next()) else {
            log::warn!("Ignoring incomplete catalog record for {line:?}");
            break;
        };
        if file.trim().is_empty() {
            log::warn!("Ignoring catalog record for {line:?} without a document file");
            continue;
        }
        documents.push(Document {
            name: line.to_string(),
            password: password.to_string(),
            path: documents_dir.join(file.trim()),
        });
    }

    documents
}
