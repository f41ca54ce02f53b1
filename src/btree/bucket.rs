//! # Bucket Page Layout
//!
//! Every tree node ("bucket") is one fixed-size page: a header, a slot
//! array growing from the front, and a key heap growing from the back.
//!
//! ```text
//! +------------------------------+
//! | BucketHeader (28 bytes)      |
//! +------------------------------+
//! | Slot 0 (18 bytes)            |   slots grow downward
//! | Slot 1                       |
//! | ...                          |
//! +------------------------------+
//! | empty_size bytes free        |
//! +------------------------------+
//! | key bytes                    |   key heap grows upward
//! +------------------------------+  <- offset BUCKET_SIZE
//! ```
//!
//! ## Header
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  -----------------------------------------
//! 0       8     parent       parent bucket (null at the root)
//! 8       8     next_child   rightmost down-pointer
//! 16      2     flags        bit 0: Packed (no internal fragmentation)
//! 18      2     n            active slot count (-1 = dealloc poison)
//! 20      2     empty_size   free bytes between slots and key heap
//! 22      2     top_size     bytes used by the key heap
//! 24      2     was_size     size sentinel, always BUCKET_SIZE
//! 26      2     reserved
//! ```
//!
//! At all times `empty_size + top_size + n*SLOT_SIZE + header == BUCKET_SIZE`.
//!
//! ## Slots
//!
//! A slot is `(prev_child, record, key_ofs)`: the subtree strictly less
//! than this key, the record the key refers to, and the key's offset in
//! the data area. The record locator's low offset bit is the used flag
//! (set = live, clear = tombstone); deletion of a separator key only
//! clears the bit, and `pack` drops eligible tombstones later.
//!
//! `next_child` holds the down-pointer to the right of the last slot —
//! conceptually the `prev_child` of a slot at position `n`.
//!
//! Slots stay sorted under the index ordering with record-locator
//! tie-break; key bytes are written once and never move except in `pack`.
//!
//! ## Mutation discipline
//!
//! [`BucketMut`] is only constructed over a page obtained through the
//! journal, so every byte written here was declared first. Primitives that
//! can fail for expected reasons (no room) return `bool`; structural
//! violations surface as assertion errors with their catalog codes.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{I16, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{codes, IndexError};
use crate::keys::{compare_keys, IndexKey, KeyOrdering, KeyRef};
use crate::storage::{Locator, BUCKET_SIZE};

pub const BUCKET_HEADER_SIZE: usize = 28;
pub const SLOT_SIZE: usize = 18;
/// Bytes available for slots plus key heap.
pub const TOTAL_DATA_SIZE: usize = BUCKET_SIZE - BUCKET_HEADER_SIZE;
/// Largest key accepted by the tree.
pub const KEY_MAX: usize = BUCKET_SIZE / 10;

pub const FLAG_PACKED: u16 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BucketHeader {
    parent: Locator,
    next_child: Locator,
    flags: U16,
    n: I16,
    empty_size: U16,
    top_size: U16,
    was_size: U16,
    reserved: U16,
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == BUCKET_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct Slot {
    prev_child: Locator,
    record: Locator,
    key_ofs: U16,
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    pub fn prev_child(&self) -> Locator {
        self.prev_child
    }

    pub fn set_prev_child(&mut self, loc: Locator) {
        self.prev_child = loc;
    }

    /// The record locator with the used bit still in place. Internal moves
    /// (splits, merges, promotions) carry this value so tombstones stay
    /// tombstones.
    pub fn record_raw(&self) -> Locator {
        self.record
    }

    /// The record locator as callers see it, used bit masked off.
    pub fn record(&self) -> Locator {
        self.record.masked()
    }

    pub fn set_record_raw(&mut self, loc: Locator) {
        self.record = loc;
    }

    pub fn is_used(&self) -> bool {
        self.record.used_bit()
    }

    pub fn set_used(&mut self) {
        self.record = self.record.with_used_bit();
    }

    pub fn set_unused(&mut self) {
        self.record = self.record.without_used_bit();
    }

    pub fn key_ofs(&self) -> usize {
        self.key_ofs.get() as usize
    }

    pub fn set_key_ofs(&mut self, ofs: u16) {
        self.key_ofs = U16::new(ofs);
    }
}

#[inline]
fn slot_abs(i: usize) -> usize {
    BUCKET_HEADER_SIZE + i * SLOT_SIZE
}

#[inline]
fn key_abs(data_ofs: usize) -> usize {
    BUCKET_HEADER_SIZE + data_ofs
}

/// Read-only view of a bucket page.
#[derive(Clone, Copy)]
pub struct Bucket<'a> {
    data: &'a [u8],
}

/// Mutable view of a bucket page (obtained through the journal).
pub struct BucketMut<'a> {
    data: &'a mut [u8],
}

impl<'a> Bucket<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Bucket<'a>> {
        ensure!(
            data.len() == BUCKET_SIZE,
            "invalid bucket page size: {} != {}",
            data.len(),
            BUCKET_SIZE
        );
        let b = Bucket { data };
        let h = b.header();
        ensure!(
            h.was_size.get() as usize == BUCKET_SIZE,
            "bucket size sentinel is {} (uninitialized or foreign page?)",
            h.was_size.get()
        );
        ensure!(h.n.get() >= 0, "bucket was deallocated (n == {})", h.n.get());
        Ok(b)
    }

    fn header(&self) -> &BucketHeader {
        BucketHeader::ref_from_bytes(&self.data[..BUCKET_HEADER_SIZE]).unwrap()
    }

    pub fn n(&self) -> usize {
        self.header().n.get() as usize
    }

    pub fn parent(&self) -> Locator {
        self.header().parent
    }

    pub fn next_child(&self) -> Locator {
        self.header().next_child
    }

    pub fn empty_size(&self) -> usize {
        self.header().empty_size.get() as usize
    }

    pub fn top_size(&self) -> usize {
        self.header().top_size.get() as usize
    }

    pub fn is_packed(&self) -> bool {
        self.header().flags.get() & FLAG_PACKED != 0
    }

    /// Bulk-build chain pointer; aliases the parent field, which carries no
    /// meaning until the build wires real parents.
    pub fn temp_next(&self) -> Locator {
        self.parent()
    }

    pub fn slot(&self, i: usize) -> Result<&'a Slot> {
        ensure!(
            i < self.n(),
            "slot index {} out of bounds (n={})",
            i,
            self.n()
        );
        Slot::ref_from_bytes(&self.data[slot_abs(i)..slot_abs(i) + SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read slot {}: {:?}", i, e))
    }

    pub fn key_at(&self, i: usize) -> Result<KeyRef<'a>> {
        let ofs = self.slot(i)?.key_ofs();
        ensure!(
            ofs <= TOTAL_DATA_SIZE,
            "slot {} key offset {} past page end",
            i,
            ofs
        );
        KeyRef::parse(&self.data[key_abs(ofs)..])
    }

    /// Down-pointer at `pos`; position `n` means `next_child`.
    pub fn child_at(&self, pos: usize) -> Result<Locator> {
        let n = self.n();
        ensure!(pos <= n, "child position {} out of bounds (n={})", pos, n);
        if pos == n {
            Ok(self.next_child())
        } else {
            Ok(self.slot(pos)?.prev_child())
        }
    }

    /// Whether `pack` may physically drop slot `index`: an unused slot with
    /// no subtree, not the leftmost, and not the position the caller is
    /// tracking (`ref_pos == 0` disregards the tracked position).
    pub fn may_drop_key(&self, index: usize, ref_pos: usize) -> Result<bool> {
        let s = self.slot(index)?;
        Ok(index > 0 && index != ref_pos && !s.is_used() && s.prev_child().is_null())
    }

    /// Bytes this bucket's live content would occupy after a pack.
    pub fn packed_data_size(&self, ref_pos: usize) -> Result<usize> {
        if self.is_packed() {
            return Ok(BUCKET_SIZE - self.empty_size() - BUCKET_HEADER_SIZE);
        }
        let mut size = 0;
        for j in 0..self.n() {
            if self.may_drop_key(j, ref_pos)? {
                continue;
            }
            size += self.key_at(j)?.size() + SLOT_SIZE;
        }
        Ok(size)
    }

    /// Pick the split point for an overflowing bucket. Walks from the right
    /// accumulating key sizes until the right side exceeds `top_size /
    /// divisor`; the divisor is 10 when the new key would be appended
    /// (ascending-insert workloads keep right pages nearly full otherwise)
    /// and 2 for an even split. Clamped to `[1, n-2]`.
    pub fn split_pos(&self, keypos: usize) -> Result<usize> {
        let n = self.n();
        ensure!(n > 2, "split_pos on bucket with n={}", n);
        let mut split = 0;
        let mut right_size = 0;
        let right_size_limit = self.top_size() / if keypos == n { 10 } else { 2 };
        for i in (0..n).rev() {
            right_size += self.key_at(i)?.size();
            if right_size > right_size_limit {
                split = i;
                break;
            }
        }
        Ok(split.clamp(1, n - 2))
    }

    /// Structural self-checks. Hard failures carry catalog code 10281.
    /// Cheap checks always run under `force`; the full adjacent-pair order
    /// scan runs when forced, and a first-vs-last spot check otherwise in
    /// debug builds.
    pub fn assert_valid(&self, order: &KeyOrdering, force: bool) -> Result<()> {
        if !force && !cfg!(debug_assertions) {
            return Ok(());
        }
        let h = self.header();
        let n = self.n();
        let ok = h.was_size.get() as usize == BUCKET_SIZE
            && n * SLOT_SIZE <= TOTAL_DATA_SIZE
            && self.empty_size() < BUCKET_SIZE
            && self.top_size() <= BUCKET_SIZE
            && self.empty_size() + self.top_size() + n * SLOT_SIZE + BUCKET_HEADER_SIZE
                == BUCKET_SIZE;
        if !ok {
            return Err(IndexError::assertion(
                codes::VALIDATE,
                format!(
                    "bucket accounting broken: n={} empty={} top={}",
                    n,
                    self.empty_size(),
                    self.top_size()
                ),
            )
            .into());
        }

        if force {
            for i in 0..n.saturating_sub(1) {
                let k1 = self.key_at(i)?;
                let k2 = self.key_at(i + 1)?;
                match compare_keys(k1, k2, order) {
                    std::cmp::Ordering::Greater => {
                        return Err(IndexError::assertion(
                            codes::VALIDATE,
                            format!("bucket key order corrupt at slot {}: {} > {}", i, k1, k2),
                        )
                        .into());
                    }
                    std::cmp::Ordering::Equal => {
                        let a = self.slot(i)?.record();
                        let b = self.slot(i + 1)?.record();
                        if a >= b {
                            return Err(IndexError::assertion(
                                codes::VALIDATE,
                                format!(
                                    "bucket record order corrupt at slot {}: {} >= {}",
                                    i, a, b
                                ),
                            )
                            .into());
                        }
                    }
                    std::cmp::Ordering::Less => {}
                }
            }
        } else if n > 1
            && compare_keys(self.key_at(0)?, self.key_at(n - 1)?, order)
                == std::cmp::Ordering::Greater
        {
            bail!("bucket keys out of order (first > last)");
        }
        Ok(())
    }
}

impl<'a> BucketMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<BucketMut<'a>> {
        Bucket::from_page(data)?;
        Ok(BucketMut { data })
    }

    /// Initialize a freshly allocated page as an empty bucket.
    pub fn init(data: &'a mut [u8]) -> Result<BucketMut<'a>> {
        ensure!(
            data.len() == BUCKET_SIZE,
            "invalid bucket page size: {} != {}",
            data.len(),
            BUCKET_SIZE
        );
        let header = BucketHeader {
            parent: Locator::NULL,
            next_child: Locator::NULL,
            flags: U16::new(FLAG_PACKED),
            n: I16::new(0),
            empty_size: U16::new(TOTAL_DATA_SIZE as u16),
            top_size: U16::new(0),
            was_size: U16::new(BUCKET_SIZE as u16),
            reserved: U16::new(0),
        };
        data[..BUCKET_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(BucketMut { data })
    }

    pub fn as_bucket(&self) -> Bucket<'_> {
        Bucket { data: self.data }
    }

    fn header_mut(&mut self) -> &mut BucketHeader {
        BucketHeader::mut_from_bytes(&mut self.data[..BUCKET_HEADER_SIZE]).unwrap()
    }

    pub fn n(&self) -> usize {
        self.as_bucket().n()
    }

    pub fn parent(&self) -> Locator {
        self.as_bucket().parent()
    }

    pub fn next_child(&self) -> Locator {
        self.as_bucket().next_child()
    }

    pub fn empty_size(&self) -> usize {
        self.as_bucket().empty_size()
    }

    pub fn top_size(&self) -> usize {
        self.as_bucket().top_size()
    }

    pub fn slot(&self, i: usize) -> Result<Slot> {
        self.as_bucket().slot(i).copied()
    }

    pub fn key_at(&self, i: usize) -> Result<KeyRef<'_>> {
        let ofs = self.slot(i)?.key_ofs();
        KeyRef::parse(&self.data[key_abs(ofs)..])
    }

    pub fn child_at(&self, pos: usize) -> Result<Locator> {
        self.as_bucket().child_at(pos)
    }

    pub fn set_parent(&mut self, loc: Locator) {
        self.header_mut().parent = loc;
    }

    pub fn set_next_child(&mut self, loc: Locator) {
        self.header_mut().next_child = loc;
    }

    /// Same-level chain pointer used only by the bulk builder; overlays the
    /// (meaningless during a build) parent field.
    pub fn temp_next(&self) -> Locator {
        self.parent()
    }

    pub fn set_temp_next(&mut self, loc: Locator) {
        self.set_parent(loc);
    }

    fn set_n(&mut self, n: usize) {
        self.header_mut().n = I16::new(n as i16);
    }

    fn set_packed(&mut self) {
        let h = self.header_mut();
        h.flags = U16::new(h.flags.get() | FLAG_PACKED);
    }

    fn set_not_packed(&mut self) {
        let h = self.header_mut();
        h.flags = U16::new(h.flags.get() & !FLAG_PACKED);
    }

    pub fn slot_mut(&mut self, i: usize) -> Result<&mut Slot> {
        ensure!(
            i < self.n(),
            "slot index {} out of bounds (n={})",
            i,
            self.n()
        );
        Slot::mut_from_bytes(&mut self.data[slot_abs(i)..slot_abs(i) + SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read slot {}: {:?}", i, e))
    }

    pub fn set_child_at(&mut self, pos: usize, loc: Locator) -> Result<()> {
        let n = self.n();
        ensure!(pos <= n, "child position {} out of bounds (n={})", pos, n);
        if pos == n {
            self.set_next_child(loc);
        } else {
            self.slot_mut(pos)?.set_prev_child(loc);
        }
        Ok(())
    }

    pub fn mark_unused(&mut self, pos: usize) -> Result<()> {
        self.slot_mut(pos)?.set_unused();
        Ok(())
    }

    pub fn mark_used(&mut self, pos: usize) -> Result<()> {
        self.slot_mut(pos)?.set_used();
        Ok(())
    }

    /// Defensive poison written right before the page is freed: readers
    /// that chase a stale locator fail loudly instead of walking garbage.
    pub fn poison(&mut self) {
        let h = self.header_mut();
        h.n = I16::new(-1);
        h.parent = Locator::NULL;
    }

    /// Reserve `bytes` at the back of the key heap; returns the data-area
    /// offset of the reservation. Precondition: `empty_size >= bytes`.
    fn alloc(&mut self, bytes: usize) -> usize {
        let h = self.header_mut();
        h.top_size = U16::new(h.top_size.get() + bytes as u16);
        h.empty_size = U16::new(h.empty_size.get() - bytes as u16);
        TOTAL_DATA_SIZE - h.top_size.get() as usize
    }

    fn unalloc(&mut self, bytes: usize) {
        let h = self.header_mut();
        h.top_size = U16::new(h.top_size.get() - bytes as u16);
        h.empty_size = U16::new(h.empty_size.get() + bytes as u16);
    }

    /// Insert a slot at `keypos` without splitting. Packs first if the key
    /// and slot don't fit; returns `false` if there is still no room. The
    /// position is passed by reference because a pack may move it. The new
    /// slot's `prev_child` starts null; callers wire children.
    pub fn basic_insert(
        &mut self,
        keypos: &mut usize,
        record: Locator,
        key: KeyRef<'_>,
        order: &KeyOrdering,
    ) -> Result<bool> {
        ensure!(
            *keypos <= self.n(),
            "basic_insert at {} with n={}",
            *keypos,
            self.n()
        );
        let bytes_needed = key.size() + SLOT_SIZE;
        if bytes_needed > self.empty_size() {
            self.pack(order, keypos)?;
            if bytes_needed > self.empty_size() {
                return Ok(false);
            }
        }

        let n = self.n();
        let pos = *keypos;
        // make room: shift slots [pos..n) one to the right
        self.data
            .copy_within(slot_abs(pos)..slot_abs(n), slot_abs(pos + 1));

        self.set_n(n + 1);
        {
            let h = self.header_mut();
            h.empty_size = U16::new(h.empty_size.get() - SLOT_SIZE as u16);
        }
        let key_ofs = self.alloc(key.size());
        self.data[key_abs(key_ofs)..key_abs(key_ofs) + key.size()]
            .copy_from_slice(key.as_bytes());

        let slot = self.slot_mut(pos)?;
        slot.set_prev_child(Locator::NULL);
        slot.set_record_raw(record);
        slot.set_key_ofs(key_ofs as u16);
        Ok(true)
    }

    /// Append a slot without shifting; the key must sort at or after the
    /// current last key. Returns `false` when there is no room (callers on
    /// bulk paths want to fail fast rather than pack).
    pub fn try_push_back(
        &mut self,
        record: Locator,
        key: KeyRef<'_>,
        order: &KeyOrdering,
        prev_child: Locator,
    ) -> Result<bool> {
        let bytes_needed = key.size() + SLOT_SIZE;
        if bytes_needed > self.empty_size() {
            return Ok(false);
        }
        let n = self.n();
        if n > 0 {
            ensure!(
                compare_keys(self.key_at(n - 1)?, key, order) != std::cmp::Ordering::Greater,
                "push_back key sorts before the bucket's last key"
            );
        }

        self.set_n(n + 1);
        {
            let h = self.header_mut();
            h.empty_size = U16::new(h.empty_size.get() - SLOT_SIZE as u16);
        }
        let key_ofs = self.alloc(key.size());
        self.data[key_abs(key_ofs)..key_abs(key_ofs) + key.size()]
            .copy_from_slice(key.as_bytes());

        let slot = self.slot_mut(n)?;
        slot.set_prev_child(prev_child);
        slot.set_record_raw(record);
        slot.set_key_ofs(key_ofs as u16);
        Ok(true)
    }

    /// `try_push_back` that must succeed. Catalog code 10284 on overflow.
    pub fn push_back(
        &mut self,
        record: Locator,
        key: KeyRef<'_>,
        order: &KeyOrdering,
        prev_child: Locator,
    ) -> Result<()> {
        if !self.try_push_back(record, key, order, prev_child)? {
            return Err(IndexError::assertion(
                codes::PUSH_BACK_NO_ROOM,
                "push_back: no room in bucket",
            )
            .into());
        }
        Ok(())
    }

    /// Remove and return the last slot. The removed slot's `prev_child`
    /// becomes the bucket's `next_child`: the bucket keeps the rightmost
    /// down-pointer the removed key formerly framed.
    pub fn pop_back(&mut self) -> Result<(Locator, IndexKey)> {
        let n = self.n();
        if n == 0 {
            return Err(
                IndexError::assertion(codes::POP_BACK_EMPTY, "n==0 in pop_back").into(),
            );
        }
        ensure!(
            self.slot(n - 1)?.is_used(),
            "pop_back on an unused slot"
        );
        let slot = self.slot(n - 1)?;
        let key = self.key_at(n - 1)?.to_owned();
        if !self.next_child().is_null() {
            return Err(IndexError::assertion(
                codes::POP_BACK_RCHILD,
                "next_child not null in pop_back",
            )
            .into());
        }
        self.set_next_child(slot.prev_child());
        self.set_n(n - 1);
        {
            let h = self.header_mut();
            h.empty_size = U16::new(h.empty_size.get() + SLOT_SIZE as u16);
        }
        self.unalloc(key.size());
        Ok((slot.record_raw(), key))
    }

    /// Remove slot `pos` (slots shift left; key bytes stay until the next
    /// pack). Precondition: the slot has no subtree. Unless `may_empty`,
    /// the bucket must keep at least one slot or have no `next_child`.
    pub fn remove_slot_at(&mut self, pos: usize, may_empty: bool) -> Result<()> {
        let n = self.n();
        ensure!(pos < n, "remove_slot_at {} with n={}", pos, n);
        ensure!(
            self.child_at(pos)?.is_null(),
            "remove_slot_at {} would orphan a subtree",
            pos
        );
        ensure!(
            (may_empty && n > 0) || n > 1 || self.next_child().is_null(),
            "remove_slot_at would empty a bucket that still has next_child"
        );
        {
            let h = self.header_mut();
            h.empty_size = U16::new(h.empty_size.get() + SLOT_SIZE as u16);
        }
        self.set_n(n - 1);
        self.data
            .copy_within(slot_abs(pos + 1)..slot_abs(n), slot_abs(pos));
        self.set_not_packed();
        Ok(())
    }

    /// Compact the bucket: slide live keys to the back, drop droppable
    /// tombstones, rewrite slot offsets. `ref_pos` is an index the caller
    /// is tracking across the pack and must not lose; it is updated if its
    /// slot moves.
    pub fn pack(&mut self, order: &KeyOrdering, ref_pos: &mut usize) -> Result<()> {
        if self.as_bucket().is_packed() {
            return Ok(());
        }

        let n = self.n();
        let mut temp = vec![0u8; TOTAL_DATA_SIZE];
        let mut ofs = TOTAL_DATA_SIZE;
        let mut top_size = 0usize;
        let mut i = 0usize;
        for j in 0..n {
            if self.as_bucket().may_drop_key(j, *ref_pos)? {
                continue;
            }
            if i != j {
                if *ref_pos == j {
                    *ref_pos = i; // i < j, so j can never be ref_pos again
                }
                self.data
                    .copy_within(slot_abs(j)..slot_abs(j) + SLOT_SIZE, slot_abs(i));
            }
            let old_ofs = self.slot(i)?.key_ofs();
            let sz = self.key_at(i)?.size();
            ofs -= sz;
            top_size += sz;
            temp[ofs..ofs + sz]
                .copy_from_slice(&self.data[key_abs(old_ofs)..key_abs(old_ofs) + sz]);
            self.slot_mut(i)?.set_key_ofs(ofs as u16);
            i += 1;
        }
        if *ref_pos == n {
            *ref_pos = i;
        }
        self.set_n(i);
        self.data[key_abs(ofs)..key_abs(TOTAL_DATA_SIZE)].copy_from_slice(&temp[ofs..]);

        let data_used = TOTAL_DATA_SIZE - ofs;
        let empty = TOTAL_DATA_SIZE as isize - data_used as isize - (i * SLOT_SIZE) as isize;
        ensure!(empty >= 0, "pack accounting underflow");
        {
            let h = self.header_mut();
            h.empty_size = U16::new(empty as u16);
            h.top_size = U16::new(top_size as u16);
        }
        self.set_packed();
        self.as_bucket().assert_valid(order, false)
    }

    /// Drop slots `[new_n, n)`, then repack. `ref_pos` tracks a pending
    /// insert position across the repack.
    pub fn truncate_to(
        &mut self,
        new_n: usize,
        order: &KeyOrdering,
        ref_pos: &mut usize,
    ) -> Result<()> {
        ensure!(new_n <= self.n(), "truncate_to {} with n={}", new_n, self.n());
        // accounting for the dropped slots is rebuilt by pack
        let dropped = self.n() - new_n;
        self.set_n(new_n);
        {
            let h = self.header_mut();
            h.empty_size = U16::new(h.empty_size.get() + (dropped * SLOT_SIZE) as u16);
        }
        self.set_not_packed();
        self.pack(order, ref_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyBuilder;

    const ORDER: KeyOrdering = KeyOrdering::ASCENDING;

    fn make_page() -> Vec<u8> {
        vec![0u8; BUCKET_SIZE]
    }

    fn ikey(v: i64) -> IndexKey {
        KeyBuilder::new().int(v).finish()
    }

    fn rec(ofs: i32) -> Locator {
        Locator::new(1, ofs).with_used_bit()
    }

    fn accounting_holds(b: &Bucket<'_>) -> bool {
        b.empty_size() + b.top_size() + b.n() * SLOT_SIZE + BUCKET_HEADER_SIZE == BUCKET_SIZE
    }

    #[test]
    fn header_and_slot_sizes_are_fixed() {
        assert_eq!(std::mem::size_of::<BucketHeader>(), 28);
        assert_eq!(std::mem::size_of::<Slot>(), 18);
    }

    #[test]
    fn init_sets_packed_empty_bucket() {
        let mut page = make_page();
        let b = BucketMut::init(&mut page).unwrap();
        assert_eq!(b.n(), 0);
        assert_eq!(b.empty_size(), TOTAL_DATA_SIZE);
        assert_eq!(b.top_size(), 0);
        assert!(b.as_bucket().is_packed());
        assert!(b.parent().is_null());
        assert!(b.next_child().is_null());
        assert!(accounting_holds(&b.as_bucket()));
    }

    #[test]
    fn from_page_rejects_uninitialized_and_poisoned_pages() {
        let mut page = make_page();
        assert!(Bucket::from_page(&page).is_err());

        let mut b = BucketMut::init(&mut page).unwrap();
        b.poison();
        assert!(Bucket::from_page(&page).is_err());
    }

    #[test]
    fn basic_insert_keeps_slots_sorted_and_accounted() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();

        for (pos, v) in [(0, 30i64), (0, 10), (1, 20)] {
            let key = ikey(v);
            let mut p = pos;
            assert!(b
                .basic_insert(&mut p, rec(v as i32 * 2), key.as_ref(), &ORDER)
                .unwrap());
        }

        assert_eq!(b.n(), 3);
        let bb = Bucket::from_page(&page).unwrap();
        assert_eq!(format!("{}", bb.key_at(0).unwrap()), "{ 10 }");
        assert_eq!(format!("{}", bb.key_at(1).unwrap()), "{ 20 }");
        assert_eq!(format!("{}", bb.key_at(2).unwrap()), "{ 30 }");
        assert_eq!(bb.slot(1).unwrap().record(), Locator::new(1, 40));
        assert!(accounting_holds(&bb));
        bb.assert_valid(&ORDER, true).unwrap();
    }

    #[test]
    fn push_back_rejects_out_of_order_keys() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let k5 = ikey(5);
        let k3 = ikey(3);
        b.push_back(rec(2), k5.as_ref(), &ORDER, Locator::NULL)
            .unwrap();
        assert!(b
            .try_push_back(rec(4), k3.as_ref(), &ORDER, Locator::NULL)
            .is_err());
    }

    #[test]
    fn pop_back_moves_prev_child_into_next_child() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let k = ikey(1);
        let child = Locator::new(0, 32768);
        b.push_back(rec(2), k.as_ref(), &ORDER, child).unwrap();

        let (record, key) = b.pop_back().unwrap();
        assert_eq!(record, rec(2));
        assert_eq!(key.as_bytes(), k.as_bytes());
        assert_eq!(b.n(), 0);
        assert_eq!(b.next_child(), child);
        assert!(accounting_holds(&b.as_bucket()));
    }

    #[test]
    fn pop_back_on_empty_bucket_carries_code_10282() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let err = b.pop_back().unwrap_err();
        let e = err.downcast_ref::<IndexError>().unwrap();
        assert_eq!(e.code(), Some(codes::POP_BACK_EMPTY));
    }

    #[test]
    fn pop_back_with_next_child_carries_code_10283() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let k = ikey(1);
        b.push_back(rec(2), k.as_ref(), &ORDER, Locator::NULL)
            .unwrap();
        b.set_next_child(Locator::new(0, 32768));
        let err = b.pop_back().unwrap_err();
        let e = err.downcast_ref::<IndexError>().unwrap();
        assert_eq!(e.code(), Some(codes::POP_BACK_RCHILD));
    }

    #[test]
    fn remove_slot_shifts_left_and_clears_packed() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        for v in [1i64, 2, 3] {
            let k = ikey(v);
            b.push_back(rec(v as i32 * 2), k.as_ref(), &ORDER, Locator::NULL)
                .unwrap();
        }

        b.remove_slot_at(1, false).unwrap();
        assert_eq!(b.n(), 2);
        assert!(!b.as_bucket().is_packed());
        assert_eq!(format!("{}", b.key_at(0).unwrap()), "{ 1 }");
        assert_eq!(format!("{}", b.key_at(1).unwrap()), "{ 3 }");
        assert!(accounting_holds(&b.as_bucket()));
    }

    #[test]
    fn pack_drops_eligible_tombstones_and_tracks_ref_pos() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        for v in [1i64, 2, 3, 4] {
            let k = ikey(v);
            b.push_back(rec(v as i32 * 2), k.as_ref(), &ORDER, Locator::NULL)
                .unwrap();
        }
        // tombstone slots 1 and 2; slot 0 is never droppable
        b.mark_unused(1).unwrap();
        b.mark_unused(2).unwrap();

        // track position 3 ({4}); ref_pos 3 is not droppable itself
        let mut ref_pos = 3usize;
        let before = b.empty_size();
        // force a repack
        {
            b.set_not_packed();
        }
        b.pack(&ORDER, &mut ref_pos).unwrap();

        assert_eq!(b.n(), 2);
        assert_eq!(ref_pos, 1, "tracked slot moved from 3 to 1");
        assert_eq!(format!("{}", b.key_at(0).unwrap()), "{ 1 }");
        assert_eq!(format!("{}", b.key_at(1).unwrap()), "{ 4 }");
        assert!(b.empty_size() > before);
        assert!(accounting_holds(&b.as_bucket()));
        b.as_bucket().assert_valid(&ORDER, true).unwrap();
    }

    #[test]
    fn pack_keeps_tombstones_with_children() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        for v in [1i64, 2] {
            let k = ikey(v);
            b.push_back(rec(v as i32 * 2), k.as_ref(), &ORDER, Locator::NULL)
                .unwrap();
        }
        b.mark_unused(1).unwrap();
        b.slot_mut(1).unwrap().set_prev_child(Locator::new(0, 32768));

        let mut ref_pos = 0usize;
        b.set_not_packed();
        b.pack(&ORDER, &mut ref_pos).unwrap();
        assert_eq!(b.n(), 2, "tombstone with a subtree must survive pack");
    }

    #[test]
    fn basic_insert_packs_to_make_room() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();

        // fill the bucket with large keys
        let blob = vec![0x41u8; 1000];
        let mut v = 0i64;
        loop {
            let k = KeyBuilder::new().int(v).blob(&blob).finish();
            if !b
                .try_push_back(rec(v as i32 * 2), k.as_ref(), &ORDER, Locator::NULL)
                .unwrap()
            {
                break;
            }
            v += 1;
        }
        let full_n = b.n();

        // tombstone everything but the first and last, then insert: the
        // implicit pack must reclaim the space. A real delete would have
        // cleared the packed flag; do the same here.
        for i in 1..full_n - 1 {
            b.mark_unused(i).unwrap();
        }
        b.set_not_packed();
        let k = KeyBuilder::new().int(v).blob(&blob).finish();
        let mut pos = b.n();
        assert!(b.basic_insert(&mut pos, rec(9000), k.as_ref(), &ORDER).unwrap());
        assert_eq!(b.n(), 3); // first, last, new
        assert!(accounting_holds(&b.as_bucket()));
    }

    #[test]
    fn split_pos_is_right_biased_for_appends() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let blob = vec![0x42u8; 100];
        let mut v = 0i64;
        loop {
            let k = KeyBuilder::new().int(v).blob(&blob).finish();
            if !b
                .try_push_back(rec(v as i32 * 2), k.as_ref(), &ORDER, Locator::NULL)
                .unwrap()
            {
                break;
            }
            v += 1;
        }
        let n = b.n();
        let bb = Bucket::from_page(&page).unwrap();

        let append_split = bb.split_pos(n).unwrap();
        let middle_split = bb.split_pos(n / 2).unwrap();
        assert!(append_split > middle_split, "append split keeps the left side big");
        assert!(append_split >= 1 && append_split <= n - 2);
        // uniform keys: an even split lands near the middle
        assert!((middle_split as i64 - n as i64 / 2).abs() <= 2);
    }

    #[test]
    fn child_at_position_n_is_next_child() {
        let mut page = make_page();
        let mut b = BucketMut::init(&mut page).unwrap();
        let k = ikey(1);
        let left = Locator::new(0, 32768);
        let right = Locator::new(0, 49152);
        b.push_back(rec(2), k.as_ref(), &ORDER, left).unwrap();
        b.set_next_child(right);

        assert_eq!(b.child_at(0).unwrap(), left);
        assert_eq!(b.child_at(1).unwrap(), right);
        assert!(b.child_at(2).is_err());
    }
}
