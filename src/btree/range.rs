//! # Range-Endpoint Seek
//!
//! Compound-key range scans position their cursor with a partial
//! comparator instead of a whole-key probe: the target is an exact prefix
//! plus per-position endpoint elements with inclusivity flags (see
//! [`custom_key_cmp`]). Seeking finds the least key at-or-past the target
//! going forward, or the greatest at-or-before it in reverse.
//!
//! [`Btree::advance_to`] is the cursor-resumption entry point: it first
//! decides whether the target still lies within the current bucket's key
//! range (then a plain in-bucket binary search suffices), otherwise climbs
//! parents until an ancestor straddles the target and descends again with
//! [`Btree::custom_locate`].
//!
//! The descent tracks a `best_parent` position: when a search runs off the
//! edge of a subtree that has no further child to follow, the last
//! qualifying separator above it is the answer.

use eyre::Result;

use crate::keys::{custom_key_cmp, Element, KeyRef};
use crate::storage::Locator;

use super::tree::Btree;

/// A range-scan endpoint: `begin_len` fields of `begin` compared exactly,
/// `after` treating the target as just past that prefix, and per-position
/// endpoint elements for the trailing fields. `end` and `end_inclusive`
/// are full-arity slices; positions below `begin_len` are not consulted.
pub struct RangeTarget<'a> {
    pub begin: KeyRef<'a>,
    pub begin_len: usize,
    pub after: bool,
    pub end: &'a [Element<'a>],
    pub end_inclusive: &'a [bool],
}

impl Btree<'_> {
    fn target_cmp(&self, l: KeyRef<'_>, target: &RangeTarget<'_>, direction: i32) -> i32 {
        custom_key_cmp(
            l,
            target.begin,
            target.begin_len,
            target.after,
            target.end,
            target.end_inclusive,
            &self.order,
            direction,
        )
    }

    /// Move a positioned cursor to the first entry at-or-past (forward) or
    /// at-or-before (reverse) the target. The current key at `(loc,
    /// key_ofs)` must be strictly on the near side of the target. Sets
    /// `loc` to null when the tree has no such entry.
    pub fn advance_to(
        &self,
        loc: &mut Locator,
        key_ofs: &mut usize,
        target: &RangeTarget<'_>,
        direction: i32,
    ) -> Result<()> {
        let (l, h, dont_go_up) = {
            let b = self.bucket(*loc)?;
            let n = b.n();
            if direction > 0 {
                let h = n - 1;
                let stay = self.target_cmp(b.key_at(h)?, target, direction) >= 0;
                (*key_ofs, h, stay)
            } else {
                let stay = self.target_cmp(b.key_at(0)?, target, direction) <= 0;
                (0, *key_ofs, stay)
            }
        };

        let mut best_parent = None;
        if dont_go_up {
            // the endpoint is within this bucket's key range, so the
            // comparison above guarantees h > l
            if !self.custom_find(l, h, target, direction, loc, key_ofs, &mut best_parent)? {
                return Ok(());
            }
        } else {
            // climb until an ancestor's far edge crosses the target
            loop {
                let parent = self.bucket(*loc)?.parent();
                if parent.is_null() {
                    break;
                }
                *loc = parent;
                let b = self.bucket(*loc)?;
                if direction > 0 {
                    if self.target_cmp(b.key_at(b.n() - 1)?, target, direction) >= 0 {
                        break;
                    }
                } else if self.target_cmp(b.key_at(0)?, target, direction) <= 0 {
                    break;
                }
            }
        }
        self.custom_locate_from(loc, key_ofs, target, direction, &mut best_parent)
    }

    /// Descend from `loc` to the entry the target selects, with no
    /// positioned-cursor precondition.
    pub fn custom_locate(
        &self,
        loc: &mut Locator,
        key_ofs: &mut usize,
        target: &RangeTarget<'_>,
        direction: i32,
    ) -> Result<()> {
        let mut best_parent = None;
        self.custom_locate_from(loc, key_ofs, target, direction, &mut best_parent)
    }

    fn custom_locate_from(
        &self,
        loc: &mut Locator,
        key_ofs: &mut usize,
        target: &RangeTarget<'_>,
        direction: i32,
        best_parent: &mut Option<(Locator, usize)>,
    ) -> Result<()> {
        if self.bucket(*loc)?.n() == 0 {
            *loc = Locator::NULL;
            return Ok(());
        }
        loop {
            let b = self.bucket(*loc)?;
            let h = b.n() - 1;

            // is even the near-edge key already at-or-past the target?
            let first_check = if direction > 0 {
                self.target_cmp(b.key_at(0)?, target, direction) >= 0
            } else {
                self.target_cmp(b.key_at(h)?, target, direction) <= 0
            };
            if first_check {
                let (next, ko) = if direction > 0 {
                    (b.slot(0)?.prev_child(), 0)
                } else {
                    (b.next_child(), h)
                };
                *key_ofs = ko;
                if !next.is_null() {
                    *best_parent = Some((*loc, *key_ofs));
                    *loc = next;
                    continue;
                }
                return Ok(());
            }

            // is every key in this bucket still before the target?
            let second_check = if direction > 0 {
                self.target_cmp(b.key_at(h)?, target, direction) < 0
            } else {
                self.target_cmp(b.key_at(0)?, target, direction) > 0
            };
            if second_check {
                let next = if direction > 0 {
                    b.next_child()
                } else {
                    b.slot(0)?.prev_child()
                };
                if next.is_null() {
                    // off the edge of this subtree: the last qualifying
                    // separator above is the answer (or the end of scan)
                    match *best_parent {
                        Some((bl, bp)) => {
                            *loc = bl;
                            *key_ofs = bp;
                        }
                        None => *loc = Locator::NULL,
                    }
                    return Ok(());
                }
                *loc = next;
                continue;
            }

            if !self.custom_find(0, h, target, direction, loc, key_ofs, best_parent)? {
                return Ok(());
            }
        }
    }

    /// In-bucket binary search between positions `l` and `h`, where the
    /// key at `l` is strictly before the target and the key at `h` is
    /// at-or-past it (so `l < h`). Narrows to adjacent positions, lands on
    /// the far one, and returns `true` with `loc` moved into the child
    /// between them when there is one to descend into.
    fn custom_find(
        &self,
        mut l: usize,
        mut h: usize,
        target: &RangeTarget<'_>,
        direction: i32,
        loc: &mut Locator,
        key_ofs: &mut usize,
        best_parent: &mut Option<(Locator, usize)>,
    ) -> Result<bool> {
        loop {
            if l + 1 == h {
                *key_ofs = if direction > 0 { h } else { l };
                let next = self.bucket(*loc)?.slot(h)?.prev_child();
                if !next.is_null() {
                    *best_parent = Some((*loc, *key_ofs));
                    *loc = next;
                    return Ok(true);
                }
                return Ok(false);
            }
            let m = l + (h - l) / 2;
            let cmp = {
                let b = self.bucket(*loc)?;
                self.target_cmp(b.key_at(m)?, target, direction)
            };
            if cmp < 0 {
                l = m;
            } else if cmp > 0 {
                h = m;
            } else if direction < 0 {
                l = m;
            } else {
                h = m;
            }
        }
    }
}
