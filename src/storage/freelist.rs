//! # Free Page Tracking
//!
//! Buckets freed by merges and deletions are recycled, not reclaimed from
//! the file. The freelist is a chain of trunk pages, each holding a batch
//! of freed locators:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       8     next_trunk: Locator of the next trunk (null = last)
//! 8       4     count: locators stored in this trunk
//! 12      4     reserved
//! 16      8*N   entries: freed locators
//! ```
//!
//! Allocation pops from the head trunk; when a trunk drains, the trunk
//! page itself is the next allocation and the chain head advances. A page
//! being released becomes a fresh trunk when the head is full (or absent),
//! so the freelist never allocates to grow itself.
//!
//! The chain anchor (head locator + total count, trunk pages included) is
//! persisted in the store header at commit. Trunk mutations declare write
//! intent like any other page write.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::journal::Journal;
use super::loc::{Locator, LOCATOR_SIZE};
use super::mmap::SegmentFile;
use super::{resolve_loc, BUCKET_SIZE};

pub const TRUNK_HEADER_SIZE: usize = 16;
pub const TRUNK_MAX_ENTRIES: usize = (BUCKET_SIZE - TRUNK_HEADER_SIZE) / LOCATOR_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TrunkHeader {
    next_trunk: Locator,
    count: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<TrunkHeader>() == TRUNK_HEADER_SIZE);

#[derive(Debug)]
pub struct Freelist {
    head: Locator,
    free_count: u64,
}

impl Freelist {
    pub fn new() -> Freelist {
        Freelist {
            head: Locator::NULL,
            free_count: 0,
        }
    }

    /// Reattach to a persisted chain (from the store header).
    pub fn from_anchor(head: Locator, free_count: u64) -> Freelist {
        Freelist { head, free_count }
    }

    pub fn head(&self) -> Locator {
        self.head
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    /// Pop a reusable page, or `None` if the caller must grow a segment.
    pub fn allocate(
        &mut self,
        files: &mut [SegmentFile],
        journal: &Journal,
    ) -> Result<Option<Locator>> {
        if self.head.is_null() {
            return Ok(None);
        }

        let head = self.head;
        let (next, count) = {
            let page = trunk_page(files, head)?;
            let th = TrunkHeader::ref_from_bytes(&page[..TRUNK_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
            (th.next_trunk, th.count.get())
        };

        if count == 0 {
            // drained trunk: the trunk page itself is the allocation
            self.head = next;
            self.free_count -= 1;
            return Ok(Some(head));
        }

        journal.note_page(head, BUCKET_SIZE);
        let entry_at = TRUNK_HEADER_SIZE + (count as usize - 1) * LOCATOR_SIZE;
        let page = trunk_page_mut(files, head)?;
        let entry = Locator::read_from_bytes(&page[entry_at..entry_at + LOCATOR_SIZE])
            .map_err(|e| eyre::eyre!("failed to read trunk entry: {:?}", e))?;
        let th = TrunkHeader::mut_from_bytes(&mut page[..TRUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
        th.count = U32::new(count - 1);
        self.free_count -= 1;
        Ok(Some(entry))
    }

    /// Return a page to the freelist.
    pub fn release(
        &mut self,
        files: &mut [SegmentFile],
        journal: &Journal,
        loc: Locator,
    ) -> Result<()> {
        ensure!(!loc.is_null(), "cannot release the null locator");

        let head_full = if self.head.is_null() {
            true
        } else {
            let page = trunk_page(files, self.head)?;
            let th = TrunkHeader::ref_from_bytes(&page[..TRUNK_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
            th.count.get() as usize >= TRUNK_MAX_ENTRIES
        };

        if head_full {
            // the released page becomes the new head trunk
            journal.note_page(loc, BUCKET_SIZE);
            let page = trunk_page_mut(files, loc)?;
            let th = TrunkHeader {
                next_trunk: self.head,
                count: U32::new(0),
                reserved: U32::new(0),
            };
            page[..TRUNK_HEADER_SIZE].copy_from_slice(th.as_bytes());
            self.head = loc;
        } else {
            journal.note_page(self.head, BUCKET_SIZE);
            let page = trunk_page_mut(files, self.head)?;
            let count = {
                let th = TrunkHeader::ref_from_bytes(&page[..TRUNK_HEADER_SIZE])
                    .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
                th.count.get()
            };
            let entry_at = TRUNK_HEADER_SIZE + count as usize * LOCATOR_SIZE;
            page[entry_at..entry_at + LOCATOR_SIZE].copy_from_slice(loc.as_bytes());
            let th = TrunkHeader::mut_from_bytes(&mut page[..TRUNK_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
            th.count = U32::new(count + 1);
        }

        self.free_count += 1;
        Ok(())
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Freelist::new()
    }
}

fn trunk_page(files: &[SegmentFile], loc: Locator) -> Result<&[u8]> {
    let (file, page_no) = resolve_loc(files, loc)?;
    files[file].page(page_no)
}

fn trunk_page_mut(files: &mut [SegmentFile], loc: Locator) -> Result<&mut [u8]> {
    let (file, page_no) = resolve_loc(files, loc)?;
    files[file].page_mut(page_no)
}
