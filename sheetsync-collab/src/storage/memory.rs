//! Volatile [`DocumentStore`] for tests and benchmarks.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{DocumentStore, StoreError};
use crate::cells::CellStore;

/// Keeps documents in a map and counts successful saves.
///
/// Saves can be made to fail on demand to exercise persistence-error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<PathBuf, CellStore>>,
    saves: AtomicUsize,
    failed_saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `save` calls rejected by [`MemoryStore::set_fail_saves`].
    pub fn failed_save_count(&self) -> usize {
        self.failed_saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent `save` fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Seed a document without counting it as a save.
    pub fn insert(&self, path: impl Into<PathBuf>, cells: CellStore) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), cells);
    }

    /// Current persisted content of `path`.
    pub fn document(&self, path: &Path) -> Option<CellStore> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<CellStore, StoreError> {
        self.document(path)
            .ok_or_else(|| StoreError::Missing(path.to_path_buf()))
    }

    fn save(&self, path: &Path, cells: &CellStore) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::io(
                path,
                io::Error::other("simulated write failure"),
            ));
        }
        self.insert(path, cells.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn discard(&self, path: &Path) -> Result<(), StoreError> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        Ok(())
    }
}
