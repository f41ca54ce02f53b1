//! # Bulk Builder
//!
//! Builds a tree bottom-up from an externally sorted stream, far cheaper
//! than repeated top-down inserts: keys append into a chain of leaves, and
//! commit condenses the chain level by level until one bucket remains.
//!
//! ```text
//! addKey phase:    [leaf] -> [leaf] -> [leaf]        (temp_next chain)
//!
//! commit:          each chained bucket pops its last key up as a
//!                  separator; the popped key's old subtree becomes the
//!                  parent's down-pointer. Parents chain the same way,
//!                  and the process repeats until a single bucket is
//!                  left: the new root.
//! ```
//!
//! A bucket emptied by its pop is discarded and its `next_child` adopted
//! directly, so minimal chains don't leave single-key conduits behind.
//!
//! The builder owns the index root: it requires an index with no root yet
//! and writes the head only at commit. Dropping an uncommitted builder
//! rolls back by freeing the leaf chain.

use eyre::{ensure, Result};
use tracing::{debug, warn};

use crate::error::{codes, IndexError};
use crate::keys::{compare_keys, IndexKey};
use crate::meta::IndexMeta;
use crate::storage::{Journal, Locator, Pager};

use super::bucket::KEY_MAX;
use super::cursor::CursorRegistry;
use super::tree::Btree;

pub struct BtreeBuilder<'a> {
    tree: Btree<'a>,
    dups_allowed: bool,
    n: u64,
    key_last: Option<IndexKey>,
    first: Locator,
    cur: Locator,
    committed: bool,
}

impl<'a> BtreeBuilder<'a> {
    pub fn new(
        pager: &'a mut Pager,
        journal: &'a Journal,
        cursors: &'a CursorRegistry,
        meta: &'a mut IndexMeta,
        dups_allowed: bool,
    ) -> Result<BtreeBuilder<'a>> {
        ensure!(
            meta.head().is_null(),
            "bulk build requires an index with no root yet ({})",
            meta.namespace()
        );
        let mut tree = Btree::attach(pager, journal, cursors, meta)?;
        let first = tree.add_bucket()?;
        Ok(BtreeBuilder {
            tree,
            dups_allowed,
            n: 0,
            key_last: None,
            first,
            cur: first,
            committed: false,
        })
    }

    /// Append the next key of the sorted stream. Oversized keys are
    /// skipped with a warning; out-of-order input is a caller bug (code
    /// 10288); an equal key on a unique index fails the build.
    pub fn add_key(&mut self, key: &IndexKey, record: Locator) -> Result<()> {
        let order = *self.tree.ordering();

        if key.size() > KEY_MAX {
            warn!(
                namespace = self.tree.meta.namespace(),
                size = key.size(),
                key = %key,
                "key too large to index, skipping"
            );
            return Ok(());
        }

        if !self.dups_allowed {
            if let Some(last) = &self.key_last {
                match compare_keys(last.as_ref(), key.as_ref(), &order) {
                    std::cmp::Ordering::Greater => {
                        return Err(IndexError::assertion(
                            codes::BUILDER_KEY_ORDER,
                            "bad key order in bulk builder",
                        )
                        .into());
                    }
                    std::cmp::Ordering::Equal => {
                        return Err(IndexError::DuplicateKey {
                            message: self.tree.meta.dup_key_error(key.as_ref()),
                        }
                        .into());
                    }
                    std::cmp::Ordering::Less => {}
                }
            }
            self.key_last = Some(key.clone());
        }

        let record = record.with_used_bit();
        let pushed = self.tree.bucket_mut(self.cur)?.try_push_back(
            record,
            key.as_ref(),
            &order,
            Locator::NULL,
        )?;
        if !pushed {
            // leaf full: chain a fresh one and append there
            self.new_bucket()?;
            self.tree
                .bucket_mut(self.cur)?
                .push_back(record, key.as_ref(), &order, Locator::NULL)?;
        }
        self.n += 1;
        Ok(())
    }

    pub fn keys_added(&self) -> u64 {
        self.n
    }

    /// Condense the leaf chain upward and publish the root.
    pub fn commit(&mut self) -> Result<()> {
        let levels = self.build_next_level(self.first)?;
        self.committed = true;
        if levels > 1 {
            debug!(levels, "bulk build finished");
        }
        Ok(())
    }

    fn new_bucket(&mut self) -> Result<()> {
        let fresh = self.tree.add_bucket()?;
        self.tree.bucket_mut(self.cur)?.set_temp_next(fresh);
        self.cur = fresh;
        Ok(())
    }

    fn build_next_level(&mut self, start: Locator) -> Result<usize> {
        let order = *self.tree.ordering();
        let mut levels = 1usize;
        let mut loc = start;
        loop {
            if self.tree.bucket(loc)?.temp_next().is_null() {
                // a single bucket at this level: it is the root
                self.tree.meta.set_head(self.tree.journal, loc);
                break;
            }
            levels += 1;

            let up_start = self.tree.add_bucket()?;
            let mut up_loc = up_start;

            let mut xloc = loc;
            while !xloc.is_null() {
                let (record, key) = self.tree.bucket_mut(xloc)?.pop_back()?;
                let (keep_x, x_next_child, next_loc) = {
                    let x = self.tree.bucket(xloc)?;
                    (x.n() != 0, x.next_child(), x.temp_next())
                };
                // the popped key's old subtree (now in x's next_child) is
                // the separator's left pointer; a drained donor is dropped
                // and its subtree adopted directly
                let keep_loc = if keep_x { xloc } else { x_next_child };

                let pushed = self.tree.bucket_mut(up_loc)?.try_push_back(
                    record,
                    key.as_ref(),
                    &order,
                    keep_loc,
                )?;
                if !pushed {
                    let fresh = self.tree.add_bucket()?;
                    self.tree.bucket_mut(up_loc)?.set_temp_next(fresh);
                    up_loc = fresh;
                    self.tree
                        .bucket_mut(up_loc)?
                        .push_back(record, key.as_ref(), &order, keep_loc)?;
                }

                if keep_x {
                    self.tree.bucket_mut(xloc)?.set_parent(up_loc);
                } else {
                    if !x_next_child.is_null() {
                        self.tree.bucket_mut(x_next_child)?.set_parent(up_loc);
                    }
                    self.tree.dealloc_bucket(xloc)?;
                }
                xloc = next_loc;
            }

            loc = up_start;
        }
        Ok(levels)
    }
}

impl Drop for BtreeBuilder<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        debug!("rolling back partially built index");
        let mut x = self.first;
        while !x.is_null() {
            let next = match self.tree.bucket(x) {
                Ok(b) => b.temp_next(),
                Err(e) => {
                    tracing::error!(error = %e, "rollback: unreadable chain bucket");
                    break;
                }
            };
            if let Err(e) = self.tree.dealloc_bucket(x) {
                tracing::error!(error = %e, "rollback: failed to free bucket");
                break;
            }
            x = next;
        }
        debug_assert!(self.tree.meta.head().is_null());
    }
}
