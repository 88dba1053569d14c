//! LIFO history of prior cell contents since the last save.

/// One reversible mutation: `cell` held `prior` before it was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub cell: String,
    /// Empty when the cell was unset.
    pub prior: String,
}

/// Stack of [`UndoEntry`]. Popped entries are gone for good; there is no redo.
#[derive(Debug, Clone, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cell: impl Into<String>, prior: impl Into<String>) {
        self.entries.push(UndoEntry {
            cell: cell.into(),
            prior: prior.into(),
        });
    }

    /// Take the most recent entry.
    pub fn pop_last(&mut self) -> Option<UndoEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
