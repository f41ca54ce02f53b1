//! # Index Metadata
//!
//! The per-index state the engine needs from the catalog: the namespace
//! (for error messages), the key pattern (field names and directions), and
//! the root locator. The root is the only mutable field; rewriting it goes
//! through the journal like any page write, and the pager persists it in
//! the store header at commit.

use eyre::Result;

use crate::keys::{KeyOrdering, KeyPattern, KeyRef};
use crate::storage::{Journal, Locator, Pager};

#[derive(Debug)]
pub struct IndexMeta {
    namespace: String,
    pattern: KeyPattern,
    head: Locator,
}

impl IndexMeta {
    /// Metadata for a brand-new index with no root yet.
    pub fn new(namespace: impl Into<String>, pattern: KeyPattern) -> IndexMeta {
        IndexMeta {
            namespace: namespace.into(),
            pattern,
            head: Locator::NULL,
        }
    }

    /// Reattach to a persisted index, taking the root from the store
    /// header.
    pub fn open(pager: &Pager, namespace: impl Into<String>, pattern: KeyPattern) -> Result<IndexMeta> {
        Ok(IndexMeta {
            namespace: namespace.into(),
            pattern,
            head: pager.stored_head()?,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    pub fn ordering(&self) -> Result<KeyOrdering> {
        KeyOrdering::make(&self.pattern)
    }

    pub fn head(&self) -> Locator {
        self.head
    }

    /// Rewrite the root locator, declaring the intent first.
    pub fn set_head(&mut self, journal: &Journal, loc: Locator) {
        journal.note_meta();
        self.head = loc;
    }

    /// The user-visible duplicate key message. The format is fixed; client
    /// drivers parse it.
    pub fn dup_key_error(&self, key: KeyRef<'_>) -> String {
        format!(
            "E11000 duplicate key error index: {}  dup key: {}",
            self.namespace, key
        )
    }
}
