//! # Tree Operations
//!
//! The B-tree proper: search, insertion with recursive split/promote,
//! deletion with merge and rebalance, and the non-recursive inter-bucket
//! cursor step. All navigation is by locator; a bucket view is borrowed
//! from the pager for the duration of one step and never held across a
//! mutation that could split, merge, or repack a page. Anything that must
//! survive such a mutation (a promoted separator, a pending insert) is
//! copied to an owned key first.
//!
//! ## Shape of the tree
//!
//! Keys live in every bucket, not only in leaves. A slot's `prev_child`
//! subtree holds keys strictly less than the slot's key; `next_child`
//! holds keys greater than the last slot. Within one bucket either every
//! slot has a subtree or none does, except for tombstoned separators whose
//! subtree already merged away.
//!
//! Duplicate keys are ordered by record locator, so even a million equal
//! keys bisect cleanly.
//!
//! ## Deletion strategy
//!
//! Only slots without a subtree are removed physically. A separator key
//! with live subtrees is tombstoned (used bit cleared) and reclaimed by a
//! later pack or merge. After a physical removal the bucket tries to merge
//! with a neighbor; a merge that empties the parent pulls the parent out
//! of the tree (`replace_with_next_child`), which is also how the tree
//! loses height. The root is never deallocated: deleting its last key
//! leaves an empty root bucket, and the next insert reuses it.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::error::{codes, IndexError};
use crate::keys::{compare_keys, IndexKey, KeyOrdering, KeyRef};
use crate::meta::IndexMeta;
use crate::storage::{Journal, Locator, Pager, BUCKET_SIZE};

use super::bucket::{Bucket, BucketMut, BUCKET_HEADER_SIZE, KEY_MAX, SLOT_SIZE};
use super::cursor::CursorRegistry;

/// Outcome of a top-level insert. Key-too-large is reported as a status,
/// not an error: the record is stored, just not indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InsertCode {
    Ok = 0,
    KeyTooLargeInternal = 2,
    KeyTooLargeToplevel = 3,
}

/// Result of positioning a cursor with [`Btree::locate`].
#[derive(Debug, Clone, Copy)]
pub struct Locate {
    pub loc: Locator,
    pub pos: usize,
    pub found: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidateStats {
    pub key_count: u64,
    pub unused_count: u64,
}

/// One index's view of the engine: the pager, the journal, the cursor
/// registry, and the index metadata, borrowed for a batch of operations.
pub struct Btree<'a> {
    pub(crate) pager: &'a mut Pager,
    pub(crate) journal: &'a Journal,
    pub(crate) cursors: &'a CursorRegistry,
    pub(crate) meta: &'a mut IndexMeta,
    pub(crate) order: KeyOrdering,
    pub(crate) interrupt: Option<&'a AtomicBool>,
}

impl<'a> Btree<'a> {
    /// Attach to an existing index; the metadata must name a root.
    pub fn open(
        pager: &'a mut Pager,
        journal: &'a Journal,
        cursors: &'a CursorRegistry,
        meta: &'a mut IndexMeta,
    ) -> Result<Btree<'a>> {
        ensure!(
            !meta.head().is_null(),
            "index {} has no root bucket",
            meta.namespace()
        );
        let order = meta.ordering()?;
        Ok(Btree {
            pager,
            journal,
            cursors,
            meta,
            order,
            interrupt: None,
        })
    }

    /// Attach to an index, allocating an empty root bucket if it has none.
    pub fn create(
        pager: &'a mut Pager,
        journal: &'a Journal,
        cursors: &'a CursorRegistry,
        meta: &'a mut IndexMeta,
    ) -> Result<Btree<'a>> {
        let order = meta.ordering()?;
        let mut tree = Btree {
            pager,
            journal,
            cursors,
            meta,
            order,
            interrupt: None,
        };
        if tree.meta.head().is_null() {
            let head = tree.add_bucket()?;
            tree.meta.set_head(tree.journal, head);
        }
        Ok(tree)
    }

    /// Attach without touching the root; the bulk builder starts before
    /// the index has one.
    pub(crate) fn attach(
        pager: &'a mut Pager,
        journal: &'a Journal,
        cursors: &'a CursorRegistry,
        meta: &'a mut IndexMeta,
    ) -> Result<Btree<'a>> {
        let order = meta.ordering()?;
        Ok(Btree {
            pager,
            journal,
            cursors,
            meta,
            order,
            interrupt: None,
        })
    }

    /// Install a cooperative kill flag, consulted at the start of long
    /// operations.
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn head(&self) -> Locator {
        self.meta.head()
    }

    pub fn ordering(&self) -> &KeyOrdering {
        &self.order
    }

    /// Borrow a bucket for reading. The view must not outlive the next
    /// mutation.
    pub fn bucket(&self, loc: Locator) -> Result<Bucket<'_>> {
        Bucket::from_page(self.pager.page(loc)?)
    }

    pub(crate) fn bucket_mut(&mut self, loc: Locator) -> Result<BucketMut<'_>> {
        let journal = self.journal;
        BucketMut::from_page(self.pager.page_mut(journal, loc)?)
    }

    fn check_interrupt(&self) -> Result<()> {
        if let Some(flag) = self.interrupt {
            if flag.load(AtomicOrdering::Relaxed) {
                return Err(IndexError::Interrupted.into());
            }
        }
        Ok(())
    }

    /// Allocate and initialize a fresh bucket.
    pub(crate) fn add_bucket(&mut self) -> Result<Locator> {
        let journal = self.journal;
        let loc = self.pager.allocate(journal)?;
        BucketMut::init(self.pager.page_mut(journal, loc)?)?;
        Ok(loc)
    }

    /// Notify cursors, poison the page, and return it to the allocator.
    pub(crate) fn dealloc_bucket(&mut self, loc: Locator) -> Result<()> {
        self.cursors.inform_about_to_delete_bucket(loc);
        self.bucket_mut(loc)?.poison();
        let journal = self.journal;
        self.pager.free(journal, loc)
    }

    // ---- search ---------------------------------------------------------

    /// Binary search within one bucket. Equal keys tie-break on the record
    /// locator (used bit masked), so the result may be a tombstone.
    ///
    /// With `assert_if_dup`, an equal live slot raises `DuplicateKey` (or
    /// `AlreadyInIndex` for the self-same pair). An equal tombstone forces
    /// a re-rooted recheck: a live duplicate may exist elsewhere in the
    /// tree even though this slot is dead.
    ///
    /// On a miss, the returned position is where the key would go:
    /// `key[pos-1] < key < key[pos]`, or `n` for past-the-end.
    pub(crate) fn find(
        &self,
        loc: Locator,
        key: KeyRef<'_>,
        record: Locator,
        assert_if_dup: bool,
    ) -> Result<(bool, usize)> {
        let b = self.bucket(loc)?;
        let n = b.n();
        let mut dups_checked = false;
        let mut l: isize = 0;
        let mut h: isize = n as isize - 1;
        while l <= h {
            let m = ((l + h) / 2) as usize;
            let mut x = ord_to_i32(compare_keys(key, b.key_at(m)?, &self.order));
            if x == 0 {
                if assert_if_dup {
                    if !b.slot(m)?.is_used() {
                        // the key is here but dead; rare enough that the
                        // recheck restarts from the root without ceremony
                        if !dups_checked {
                            dups_checked = true;
                            if self.exists(key)? {
                                if self.would_create_dup(key, record)? {
                                    return Err(IndexError::DuplicateKey {
                                        message: self.meta.dup_key_error(key),
                                    }
                                    .into());
                                }
                                return Err(IndexError::AlreadyInIndex.into());
                            }
                        }
                    } else {
                        if b.slot(m)?.record() == record.masked() {
                            return Err(IndexError::AlreadyInIndex.into());
                        }
                        return Err(IndexError::DuplicateKey {
                            message: self.meta.dup_key_error(key),
                        }
                        .into());
                    }
                }
                // duplicates allowed: the record locator acts as a key suffix
                x = ord_to_i32(record.masked().cmp(&b.slot(m)?.record()));
            }
            if x < 0 {
                h = m as isize - 1;
            } else if x > 0 {
                l = m as isize + 1;
            } else {
                return Ok((true, m));
            }
        }

        let pos = l as usize;
        if pos != n {
            if compare_keys(key, b.key_at(pos)?, &self.order) == std::cmp::Ordering::Greater {
                warn!(%loc, pos, "find: insertion point sorts after its successor");
            }
            if pos > 0
                && compare_keys(b.key_at(pos - 1)?, key, &self.order)
                    == std::cmp::Ordering::Greater
            {
                warn!(%loc, pos, "find: insertion point sorts before its predecessor");
            }
        }
        Ok((false, pos))
    }

    /// Recursive descent to the bucket and position for `(key, record)`.
    /// On a miss the cursor lands on the in-order neighbor: the next slot
    /// forward, the previous slot in reverse; a null locator means the key
    /// is past that end of the tree.
    pub fn locate(
        &self,
        loc: Locator,
        key: KeyRef<'_>,
        record: Locator,
        direction: i32,
    ) -> Result<Locate> {
        let (found, p) = self.find(loc, key, record, false)?;
        if found {
            return Ok(Locate {
                loc,
                pos: p,
                found: true,
            });
        }

        let child = self.bucket(loc)?.child_at(p)?;
        if !child.is_null() {
            let deeper = self.locate(child, key, record, direction)?;
            if !deeper.loc.is_null() {
                return Ok(deeper);
            }
        }

        if direction < 0 {
            if p == 0 {
                Ok(Locate {
                    loc: Locator::NULL,
                    pos: 0,
                    found: false,
                })
            } else {
                Ok(Locate {
                    loc,
                    pos: p - 1,
                    found: false,
                })
            }
        } else if p == self.bucket(loc)?.n() {
            Ok(Locate {
                loc: Locator::NULL,
                pos: 0,
                found: false,
            })
        } else {
            Ok(Locate {
                loc,
                pos: p,
                found: false,
            })
        }
    }

    /// Whether any live entry with this key exists, regardless of record.
    pub fn exists(&self, key: KeyRef<'_>) -> Result<bool> {
        let mut r = self.locate(self.meta.head(), key, Locator::MIN, 1)?;
        // skip tombstones
        while !r.loc.is_null() {
            let b = self.bucket(r.loc)?;
            if b.slot(r.pos)?.is_used() {
                return Ok(compare_keys(b.key_at(r.pos)?, key, &self.order)
                    == std::cmp::Ordering::Equal);
            }
            r.loc = self.advance(r.loc, &mut r.pos, 1, "exists")?;
        }
        Ok(false)
    }

    /// Whether inserting `key` for a record other than `self_record` would
    /// violate uniqueness.
    pub fn would_create_dup(&self, key: KeyRef<'_>, self_record: Locator) -> Result<bool> {
        let mut r = self.locate(self.meta.head(), key, Locator::MIN, 1)?;
        while !r.loc.is_null() {
            let b = self.bucket(r.loc)?;
            let slot = *b.slot(r.pos)?;
            if slot.is_used() {
                if compare_keys(b.key_at(r.pos)?, key, &self.order) == std::cmp::Ordering::Equal {
                    return Ok(slot.record() != self_record.masked());
                }
                break;
            }
            r.loc = self.advance(r.loc, &mut r.pos, 1, "would_create_dup")?;
        }
        Ok(false)
    }

    /// Point lookup for a single-result query: the record of the first
    /// live entry equal to `key` under the index ordering.
    pub fn find_single(&self, key: &IndexKey) -> Result<Option<Locator>> {
        let mut r = self.locate(self.meta.head(), key.as_ref(), Locator::MIN, 1)?;
        while !r.loc.is_null() {
            let b = self.bucket(r.loc)?;
            if b.slot(r.pos)?.is_used() {
                break;
            }
            r.loc = self.advance(r.loc, &mut r.pos, 1, "find_single")?;
        }
        if r.loc.is_null() {
            return Ok(None);
        }
        let b = self.bucket(r.loc)?;
        if compare_keys(key.as_ref(), b.key_at(r.pos)?, &self.order) != std::cmp::Ordering::Equal {
            return Ok(None);
        }
        Ok(Some(b.slot(r.pos)?.record()))
    }

    /// Position of the largest key in the tree, or `None` when empty.
    pub fn find_largest_key(&self) -> Result<Option<(Locator, usize)>> {
        let mut loc = self.meta.head();
        loop {
            let b = self.bucket(loc)?;
            if !b.next_child().is_null() {
                loc = b.next_child();
                continue;
            }
            if b.n() == 0 {
                return Ok(None);
            }
            return Ok(Some((loc, b.n() - 1)));
        }
    }

    /// Walk parent pointers from any bucket up to the root.
    pub fn get_head_from(&self, loc: Locator) -> Result<Locator> {
        let mut p = loc;
        loop {
            let parent = self.bucket(p)?.parent();
            if parent.is_null() {
                return Ok(p);
            }
            p = parent;
        }
    }

    // ---- cursor step ----------------------------------------------------

    /// In-order successor (`direction > 0`) or predecessor of the entry at
    /// `(loc, key_ofs)`. Descends into a subtree when one hangs off the
    /// crossing, otherwise steps within the bucket, otherwise climbs
    /// parents. Returns the new bucket (updating `key_ofs`), or null past
    /// either end.
    pub fn advance(
        &self,
        loc: Locator,
        key_ofs: &mut usize,
        direction: i32,
        caller: &str,
    ) -> Result<Locator> {
        let b = self.bucket(loc)?;
        let n = b.n();
        ensure!(
            *key_ofs < n,
            "advance: position {} out of bounds (n={}, direction={}, caller={})",
            *key_ofs,
            n,
            direction,
            caller
        );

        let adj: usize = if direction < 0 { 1 } else { 0 };
        let ko = *key_ofs as isize + direction as isize;

        let next_down = b.child_at((ko + adj as isize) as usize)?;
        if !next_down.is_null() {
            let mut down = next_down;
            loop {
                let c = self.bucket(down)?;
                *key_ofs = if direction > 0 { 0 } else { c.n() - 1 };
                let deeper = c.child_at(*key_ofs + adj)?;
                if deeper.is_null() {
                    break;
                }
                down = deeper;
            }
            return Ok(down);
        }

        if ko >= 0 && (ko as usize) < n {
            *key_ofs = ko as usize;
            return Ok(loc);
        }

        // off this bucket's end: climb until an ancestor has a slot on the
        // crossing side of the child we came out of
        let mut child_loc = loc;
        let mut ancestor = b.parent();
        loop {
            if ancestor.is_null() {
                break;
            }
            let an = self.bucket(ancestor)?;
            let mut found = None;
            for i in 0..an.n() {
                if an.child_at(i + adj)? == child_loc {
                    found = Some(i);
                    break;
                }
            }
            if let Some(i) = found {
                *key_ofs = i;
                return Ok(ancestor);
            }
            debug_assert!(direction < 0 || an.next_child() == child_loc);
            child_loc = ancestor;
            ancestor = an.parent();
        }

        Ok(Locator::NULL)
    }

    // ---- insert ---------------------------------------------------------

    /// Top-level insert. Oversized keys are skipped with a warning (the
    /// record is stored unindexed).
    pub fn insert(
        &mut self,
        record: Locator,
        key: &IndexKey,
        dups_allowed: bool,
    ) -> Result<InsertCode> {
        if key.size() > KEY_MAX {
            warn!(
                namespace = self.meta.namespace(),
                size = key.size(),
                max = KEY_MAX,
                key = %key,
                "key too large to index, skipping"
            );
            return Ok(InsertCode::KeyTooLargeToplevel);
        }

        let record = record.with_used_bit();
        let head = self.meta.head();
        let code = self.insert_at(head, record, key, dups_allowed, Locator::NULL, Locator::NULL)?;
        self.bucket(self.meta.head())?
            .assert_valid(&self.order, false)?;
        Ok(code)
    }

    /// Insert into the subtree rooted at `loc`. A non-null `r_child` marks
    /// an internal re-insert (a promoted separator), which lands in this
    /// bucket instead of descending.
    fn insert_at(
        &mut self,
        loc: Locator,
        record: Locator,
        key: &IndexKey,
        dups_allowed: bool,
        l_child: Locator,
        r_child: Locator,
    ) -> Result<InsertCode> {
        if key.size() > KEY_MAX {
            error!(
                namespace = self.meta.namespace(),
                size = key.size(),
                max = KEY_MAX,
                "oversized key reached the interior insert path"
            );
            return Ok(InsertCode::KeyTooLargeInternal);
        }

        let (found, pos) = self.find(loc, key.as_ref(), record, !dups_allowed)?;
        trace!(%loc, found, pos, key = %key, "insert_at");

        if found {
            let slot = *self.bucket(loc)?.slot(pos)?;
            if !slot.is_used() {
                debug!(%loc, pos, "insert: resurrecting a tombstoned slot");
                if !l_child.is_null() {
                    return Err(IndexError::assertion(
                        codes::REUSE_LCHILD,
                        "insert: reuse key but lchild is not null",
                    )
                    .into());
                }
                if !r_child.is_null() {
                    return Err(IndexError::assertion(
                        codes::REUSE_RCHILD,
                        "insert: reuse key but rchild is not null",
                    )
                    .into());
                }
                self.bucket_mut(loc)?.mark_used(pos)?;
                return Ok(InsertCode::Ok);
            }
            return Err(IndexError::AlreadyInIndex.into());
        }

        let child = self.bucket(loc)?.child_at(pos)?;
        if child.is_null() || !r_child.is_null() {
            self.insert_here(loc, pos, record, key, l_child, r_child)?;
            Ok(InsertCode::Ok)
        } else {
            self.insert_at(child, record, key, dups_allowed, Locator::NULL, Locator::NULL)
        }
    }

    /// Place `(key, record)` at `keypos` in this bucket, splitting on
    /// overflow. `l_child`/`r_child` are the subtrees the key separates
    /// (null for leaf inserts).
    fn insert_here(
        &mut self,
        loc: Locator,
        keypos: usize,
        record: Locator,
        key: &IndexKey,
        l_child: Locator,
        r_child: Locator,
    ) -> Result<()> {
        trace!(%loc, keypos, key = %key, l = %l_child, r = %r_child, "insert_here");
        let order = self.order;

        let mut pos = keypos;
        let inserted = {
            let mut b = self.bucket_mut(loc)?;
            b.basic_insert(&mut pos, record, key.as_ref(), &order)?
        };

        if inserted {
            {
                let mut b = self.bucket_mut(loc)?;
                let n = b.n();
                if pos + 1 == n {
                    // the new key is now rightmost; the old rightmost
                    // down-pointer must be the left child it separates
                    if b.next_child() != l_child {
                        bail!(
                            "insert_here: next_child {} != lchild {} ({} pos {} n {})",
                            b.next_child(),
                            l_child,
                            loc,
                            pos,
                            n
                        );
                    }
                    let nc = b.next_child();
                    b.slot_mut(pos)?.set_prev_child(nc);
                    b.set_next_child(r_child);
                } else {
                    b.slot_mut(pos)?.set_prev_child(l_child);
                    if b.slot(pos + 1)?.prev_child() != l_child {
                        bail!(
                            "insert_here: slot {} prev_child {} != lchild {} ({} n {})",
                            pos + 1,
                            b.slot(pos + 1)?.prev_child(),
                            l_child,
                            loc,
                            n
                        );
                    }
                    b.slot_mut(pos + 1)?.set_prev_child(r_child);
                }
            }
            if !r_child.is_null() {
                self.bucket_mut(r_child)?.set_parent(loc);
            }
            return Ok(());
        }

        self.split_and_insert(loc, pos, record, key, l_child, r_child)
    }

    /// Overflow: move the right portion into a fresh sibling, promote the
    /// split key into the parent (growing a new root if needed), then
    /// re-insert the pending key on the correct side.
    fn split_and_insert(
        &mut self,
        loc: Locator,
        keypos: usize,
        record: Locator,
        key: &IndexKey,
        l_child: Locator,
        r_child: Locator,
    ) -> Result<()> {
        let order = self.order;

        let (split, parent, old_next_child, moved, split_rec, split_key, split_prev) = {
            let b = self.bucket(loc)?;
            let n = b.n();
            let split = b.split_pos(keypos)?;
            let mut moved = Vec::with_capacity(n - split - 1);
            for i in split + 1..n {
                let s = b.slot(i)?;
                moved.push((s.record_raw(), b.key_at(i)?.to_owned(), s.prev_child()));
            }
            let s = b.slot(split)?;
            (
                split,
                b.parent(),
                b.next_child(),
                moved,
                s.record_raw(),
                b.key_at(split)?.to_owned(),
                s.prev_child(),
            )
        };
        debug!(%loc, split, keypos, "splitting bucket");

        let r_loc = self.add_bucket()?;
        {
            let mut r = self.bucket_mut(r_loc)?;
            for (rec, k, prev) in &moved {
                r.push_back(*rec, k.as_ref(), &order, *prev)?;
            }
            r.set_next_child(old_next_child);
            r.as_bucket().assert_valid(&order, false)?;
        }
        self.fix_parent_ptrs(r_loc, 0)?;

        // the promoted key's subtree becomes this bucket's rightmost child
        self.bucket_mut(loc)?.set_next_child(split_prev);

        if parent.is_null() {
            // we were the root: grow a new one above us
            let new_root = self.add_bucket()?;
            {
                let mut p = self.bucket_mut(new_root)?;
                p.push_back(split_rec, split_key.as_ref(), &order, loc)?;
                p.set_next_child(r_loc);
                p.as_bucket().assert_valid(&order, false)?;
            }
            self.bucket_mut(loc)?.set_parent(new_root);
            self.bucket_mut(r_loc)?.set_parent(new_root);
            debug!(root = %new_root, "tree grew a new root");
            self.meta.set_head(self.journal, new_root);
        } else {
            // wire before the recursive insert; a parent split re-fixes it
            self.bucket_mut(r_loc)?.set_parent(parent);
            self.insert_at(parent, split_rec, &split_key, true, loc, r_loc)?;
        }

        let mut newpos = keypos;
        self.bucket_mut(loc)?.truncate_to(split, &order, &mut newpos)?;

        if keypos <= split {
            self.insert_here(loc, newpos, record, key, l_child, r_child)
        } else {
            self.insert_here(r_loc, keypos - split - 1, record, key, l_child, r_child)
        }
    }

    fn fix_parent_ptrs(&mut self, loc: Locator, start_index: usize) -> Result<()> {
        let children: SmallVec<[Locator; 16]> = {
            let b = self.bucket(loc)?;
            let mut v = SmallVec::new();
            v.push(b.next_child());
            for i in start_index..b.n() {
                v.push(b.slot(i)?.prev_child());
            }
            v
        };
        for child in children {
            if !child.is_null() {
                self.bucket_mut(child)?.set_parent(loc);
            }
        }
        Ok(())
    }

    // ---- delete ---------------------------------------------------------

    /// Remove the exact `(key, record)` entry. Returns false when it is
    /// not in the index; oversized keys were never indexed and are skipped
    /// with a warning.
    pub fn unindex(&mut self, key: &IndexKey, record: Locator) -> Result<bool> {
        if key.size() > KEY_MAX {
            warn!(
                namespace = self.meta.namespace(),
                size = key.size(),
                "unindex: key too large to index, skipping"
            );
            return Ok(false);
        }

        let r = self.locate(self.meta.head(), key.as_ref(), record, 1)?;
        if r.found {
            self.del_key_at_pos(r.loc, r.pos)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Delete the entry at `(loc, pos)`. May tombstone instead of remove,
    /// may merge buckets, may collapse a level; `loc` can be invalid on
    /// return.
    pub(crate) fn del_key_at_pos(&mut self, loc: Locator, pos: usize) -> Result<()> {
        let (n, left, next_child, is_root) = {
            let b = self.bucket(loc)?;
            ensure!(b.n() > 0, "del_key_at_pos on empty bucket {}", loc);
            (b.n(), b.child_at(pos)?, b.next_child(), b.parent().is_null())
        };

        if n == 1 {
            if left.is_null() && next_child.is_null() {
                if is_root {
                    // the root is never deallocated; it may sit empty
                    self.bucket_mut(loc)?.remove_slot_at(pos, false)?;
                } else {
                    self.del_bucket(loc)?;
                }
                return Ok(());
            }
            // a separator framed by live subtrees can only be tombstoned
            self.bucket_mut(loc)?.mark_unused(pos)?;
            return Ok(());
        }

        if left.is_null() {
            self.bucket_mut(loc)?.remove_slot_at(pos, false)?;
            self.balance_with_neighbors(loc)
        } else {
            self.bucket_mut(loc)?.mark_unused(pos)?;
            Ok(())
        }
    }

    /// Unlink `loc` from its parent and free it.
    fn del_bucket(&mut self, loc: Locator) -> Result<()> {
        ensure!(
            !self.bucket(loc)?.parent().is_null(),
            "del_bucket on the root"
        );
        let parent = self.bucket(loc)?.parent();
        let idx = self.index_in_parent(loc)?;
        self.bucket_mut(parent)?.set_child_at(idx, Locator::NULL)?;
        self.dealloc_bucket(loc)
    }

    /// An empty bucket with only `next_child` set is cut out of the tree:
    /// its parent (or the index head) points at the child instead.
    fn replace_with_next_child(&mut self, loc: Locator) -> Result<()> {
        let (parent, next_child) = {
            let b = self.bucket(loc)?;
            ensure!(
                b.n() == 0 && !b.next_child().is_null(),
                "replace_with_next_child: bucket {} is not an empty conduit",
                loc
            );
            (b.parent(), b.next_child())
        };
        debug!(%loc, child = %next_child, "collapsing empty bucket");

        if parent.is_null() {
            ensure!(
                self.meta.head() == loc,
                "parentless bucket {} is not the head",
                loc
            );
            self.meta.set_head(self.journal, next_child);
        } else {
            let idx = self.index_in_parent(loc)?;
            self.bucket_mut(parent)?.set_child_at(idx, next_child)?;
        }
        self.bucket_mut(next_child)?.set_parent(parent);
        self.dealloc_bucket(loc)
    }

    /// After a physical removal, try to fold this bucket into a neighbor:
    /// first with the right sibling, else with the left.
    fn balance_with_neighbors(&mut self, loc: Locator) -> Result<()> {
        let parent = self.bucket(loc)?.parent();
        if parent.is_null() {
            return Ok(()); // the root has no neighbors
        }
        let parent_idx = self.index_in_parent(loc)?;
        let parent_n = self.bucket(parent)?.n();
        if parent_idx < parent_n && self.try_merge_neighbors(parent, parent_idx)? {
            return Ok(());
        }
        if parent_idx > 0 {
            self.try_merge_neighbors(parent, parent_idx - 1)?;
        }
        Ok(())
    }

    /// Merge the children on both sides of parent slot `left_index` if
    /// their live content plus the separator fits in one bucket.
    fn try_merge_neighbors(&mut self, ploc: Locator, left_index: usize) -> Result<bool> {
        let fits = {
            let p = self.bucket(ploc)?;
            ensure!(
                left_index < p.n(),
                "try_merge_neighbors: separator {} out of bounds",
                left_index
            );
            let left = p.child_at(left_index)?;
            let right = p.child_at(left_index + 1)?;
            if left.is_null() || right.is_null() {
                return Ok(false);
            }
            let sep_size = p.key_at(left_index)?.size();
            let l = self.bucket(left)?;
            let r = self.bucket(right)?;
            BUCKET_HEADER_SIZE
                + l.packed_data_size(0)?
                + r.packed_data_size(0)?
                + sep_size
                + SLOT_SIZE
                <= BUCKET_SIZE
        };
        if !fits {
            return Ok(false);
        }
        self.do_merge_neighbors(ploc, left_index)?;
        Ok(true)
    }

    fn do_merge_neighbors(&mut self, ploc: Locator, left_index: usize) -> Result<()> {
        let order = self.order;
        let (left_loc, right_loc, sep_rec, sep_key) = {
            let p = self.bucket(ploc)?;
            let s = p.slot(left_index)?;
            (
                p.child_at(left_index)?,
                p.child_at(left_index + 1)?,
                s.record_raw(),
                p.key_at(left_index)?.to_owned(),
            )
        };
        debug!(parent = %ploc, left = %left_loc, right = %right_loc, "merging buckets");

        {
            let mut pos = 0usize;
            self.bucket_mut(left_loc)?.pack(&order, &mut pos)?;
        }
        {
            // pack the right side too so droppable tombstones vanish
            let mut pos = 0usize;
            self.bucket_mut(right_loc)?.pack(&order, &mut pos)?;
        }

        let old_l_num = self.bucket(left_loc)?.n();
        {
            // the separator comes down; left's old rightmost pointer is its
            // left subtree
            let mut l = self.bucket_mut(left_loc)?;
            let l_next = l.next_child();
            l.push_back(sep_rec, sep_key.as_ref(), &order, l_next)?;
        }

        let (right_slots, right_next) = {
            let r = self.bucket(right_loc)?;
            let mut slots = Vec::with_capacity(r.n());
            for i in 0..r.n() {
                let s = r.slot(i)?;
                slots.push((s.record_raw(), r.key_at(i)?.to_owned(), s.prev_child()));
            }
            (slots, r.next_child())
        };
        {
            let mut l = self.bucket_mut(left_loc)?;
            for (rec, k, prev) in &right_slots {
                l.push_back(*rec, k.as_ref(), &order, *prev)?;
            }
            l.set_next_child(right_next);
        }
        self.fix_parent_ptrs(left_loc, old_l_num)?;
        self.del_bucket(right_loc)?;
        {
            let mut p = self.bucket_mut(ploc)?;
            p.set_child_at(left_index + 1, left_loc)?;
            p.set_child_at(left_index, Locator::NULL)?;
            p.remove_slot_at(left_index, true)?;
        }

        if self.bucket(ploc)?.n() == 0 {
            // the parent is an empty conduit now; this frees ploc
            self.replace_with_next_child(ploc)
        } else {
            self.balance_with_neighbors(ploc)
        }
    }

    fn index_in_parent(&self, loc: Locator) -> Result<usize> {
        let parent = self.bucket(loc)?.parent();
        ensure!(!parent.is_null(), "index_in_parent on the root");
        let p = self.bucket(parent)?;
        if p.next_child() == loc {
            return Ok(p.n());
        }
        for i in 0..p.n() {
            if p.slot(i)?.prev_child() == loc {
                return Ok(i);
            }
        }
        bail!("no reference to child {} in parent {}", loc, parent);
    }

    // ---- validation and diagnostics -------------------------------------

    /// Walk the whole tree checking bucket invariants and parent
    /// back-pointers. Returns live and tombstoned entry counts. Checks the
    /// kill flag at every bucket.
    pub fn full_validate(&self) -> Result<ValidateStats> {
        let mut stats = ValidateStats::default();
        self.validate_bucket(self.meta.head(), &mut stats)?;
        Ok(stats)
    }

    fn validate_bucket(&self, loc: Locator, stats: &mut ValidateStats) -> Result<()> {
        self.check_interrupt()?;
        let b = self.bucket(loc)?;
        b.assert_valid(&self.order, true)?;

        for i in 0..b.n() {
            let slot = *b.slot(i)?;
            if slot.is_used() {
                stats.key_count += 1;
            } else {
                stats.unused_count += 1;
            }
            let left = slot.prev_child();
            if !left.is_null() {
                if self.bucket(left)?.parent() != loc {
                    warn!(child = %left, parent = %loc, "stale parent pointer");
                }
                self.validate_bucket(left, stats)?;
            }
        }
        let nc = b.next_child();
        if !nc.is_null() {
            if self.bucket(nc)?.parent() != loc {
                warn!(child = %nc, parent = %loc, "stale parent pointer");
            }
            self.validate_bucket(nc, stats)?;
        }
        Ok(())
    }

    /// Indented outline of the tree, one `*` per bucket.
    pub fn shape(&self) -> Result<String> {
        let mut out = String::new();
        self.shape_at(self.meta.head(), 0, &mut out)?;
        Ok(out)
    }

    fn shape_at(&self, loc: Locator, level: usize, out: &mut String) -> Result<()> {
        for _ in 0..level {
            out.push(' ');
        }
        out.push_str("*\n");
        let b = self.bucket(loc)?;
        for i in 0..b.n() {
            let child = b.slot(i)?.prev_child();
            if !child.is_null() {
                self.shape_at(child, level + 1, out)?;
            }
        }
        if !b.next_child().is_null() {
            self.shape_at(b.next_child(), level + 1, out)?;
        }
        Ok(())
    }

    /// Number of bucket levels (leaves are level 1).
    pub fn height(&self) -> Result<usize> {
        let mut h = 1;
        let mut loc = self.meta.head();
        loop {
            let b = self.bucket(loc)?;
            let down = if !b.next_child().is_null() {
                b.next_child()
            } else if b.n() > 0 {
                b.slot(0)?.prev_child()
            } else {
                Locator::NULL
            };
            if down.is_null() {
                return Ok(h);
            }
            h += 1;
            loc = down;
        }
    }
}

fn ord_to_i32(o: std::cmp::Ordering) -> i32 {
    match o {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}
