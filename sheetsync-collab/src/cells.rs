//! In-memory cell contents for one spreadsheet.
//!
//! A cell that is absent from the store and a cell with empty content are
//! the same thing: writing an empty string removes the entry.

use std::collections::BTreeMap;

/// Cell id → raw content. No formula evaluation happens here.
///
/// Backed by a `BTreeMap` so that snapshots (and therefore the persisted
/// XML and the JOIN payload) come out in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellStore {
    cells: BTreeMap<String, String>,
}

impl CellStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of `id`, or `""` if the cell is unset.
    pub fn get(&self, id: &str) -> &str {
        self.cells.get(id).map_or("", String::as_str)
    }

    /// Set `id` to `content`, returning the previous content (or `""`).
    ///
    /// Empty `content` removes the cell.
    pub fn set(&mut self, id: impl Into<String>, content: impl Into<String>) -> String {
        let id = id.into();
        let content = content.into();
        if content.is_empty() {
            return self.remove(&id);
        }
        self.cells.insert(id, content).unwrap_or_default()
    }

    /// Remove `id`, returning what it held (or `""`).
    pub fn remove(&mut self, id: &str) -> String {
        self.cells.remove(id).unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cells.contains_key(id)
    }

    /// All non-empty cells as owned `(id, content)` pairs, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.cells
            .iter()
            .map(|(id, content)| (id.clone(), content.clone()))
            .collect()
    }

    /// Borrowing iterator over `(id, content)`, sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(id, content)| (id.as_str(), content.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CellStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut store = Self::new();
        for (id, content) in iter {
            store.set(id, content);
        }
        store
    }
}
