//! # Write-Intent Journal
//!
//! Every byte written into a page must be declared before the mutation:
//! the pager's `page_mut` routes through [`Journal::note_page`], which
//! records the region in the current intent set and only then hands out
//! the mutable view. Mutations land directly in the mapped pages (the
//! views are identity aliases); the journal makes the set of touched
//! regions explicit so commit can publish them atomically enough for a
//! single-writer engine:
//!
//! 1. one checksummed frame per declared region (post-image) is appended
//!    to the intent log and fsynced,
//! 2. the mapped segments are flushed,
//! 3. the log is truncated.
//!
//! A crash between (1) and (3) leaves a complete log; [`Journal::replay`]
//! re-applies every frame with a valid checksum on the next open and stops
//! at the first torn frame. A crash before (1) loses the uncommitted
//! mutations wholesale, which is the contract: readers in other
//! transactional views see pre-image or post-image, never a mix that
//! survives restart.
//!
//! ## Frame format
//!
//! ```text
//! +-------------------+------------------+
//! | FrameHeader (24B) | region bytes     |
//! +-------------------+------------------+
//! ```
//!
//! Header: target locator, region length, CRC64 (ECMA-182) over the header
//! fields and the region bytes.
//!
//! The window from declaration to commit is single-threaded by the
//! database's outer write lock; the `Mutex` here only keeps the intent set
//! `Send + Sync` for embedding.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::loc::Locator;

pub const FRAME_HEADER_SIZE: usize = 24;
const LOG_FILE_NAME: &str = "intents.log";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FrameHeader {
    loc: Locator,
    len: U32,
    reserved: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

pub fn compute_checksum(loc: Locator, len: u32, data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&loc.file().to_le_bytes());
    digest.update(&loc.ofs().to_le_bytes());
    digest.update(&len.to_le_bytes());
    digest.update(data);
    digest.finalize()
}

#[derive(Debug, Clone, Copy)]
pub struct Intent {
    pub loc: Locator,
    pub len: u32,
}

#[derive(Default)]
struct PendingSet {
    regions: Vec<Intent>,
    seen: HashSet<(i32, i32)>,
    meta: bool,
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    pending: Mutex<PendingSet>,
}

impl Journal {
    /// Create a fresh intent log in `dir`, truncating any leftover.
    pub fn create(dir: &Path) -> Result<Journal> {
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create intent log '{}'", path.display()))?;
        Ok(Journal {
            path,
            file: Mutex::new(file),
            pending: Mutex::new(PendingSet::default()),
        })
    }

    /// Open an existing intent log (it may hold frames from an interrupted
    /// commit; run [`Journal::replay`] before using the store).
    pub fn open(dir: &Path) -> Result<Journal> {
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open intent log '{}'", path.display()))?;
        Ok(Journal {
            path,
            file: Mutex::new(file),
            pending: Mutex::new(PendingSet::default()),
        })
    }

    /// Declare that `len` bytes at `loc` are about to be modified.
    pub fn note_page(&self, loc: Locator, len: usize) {
        let mut pending = self.pending.lock();
        if pending.seen.insert((loc.file(), loc.ofs())) {
            pending.regions.push(Intent {
                loc,
                len: len as u32,
            });
        }
    }

    /// Declare that the index metadata (root locator) is about to change.
    pub fn note_meta(&self) {
        self.pending.lock().meta = true;
    }

    /// Declared regions not yet committed (the metadata intent counts as
    /// one).
    pub fn pending(&self) -> usize {
        let p = self.pending.lock();
        p.regions.len() + p.meta as usize
    }

    /// Drop all pending intents without committing.
    pub fn discard(&self) {
        let mut p = self.pending.lock();
        p.regions.clear();
        p.seen.clear();
        p.meta = false;
    }

    /// Append one frame per pending region to the log and fsync it. The
    /// pending set is drained. Exposed separately from [`Journal::commit`]
    /// for crash-recovery tests.
    pub(crate) fn log_frames(&self, pager: &super::pager::Pager) -> Result<usize> {
        let drained: Vec<Intent> = {
            let mut p = self.pending.lock();
            p.seen.clear();
            p.meta = false;
            std::mem::take(&mut p.regions)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))
            .wrap_err("failed to seek intent log")?;
        for intent in &drained {
            let data = &pager.page(intent.loc)?[..intent.len as usize];
            let header = FrameHeader {
                loc: intent.loc,
                len: U32::new(intent.len),
                reserved: U32::new(0),
                checksum: U64::new(compute_checksum(intent.loc, intent.len, data)),
            };
            file.write_all(header.as_bytes())
                .wrap_err("failed to append frame header")?;
            file.write_all(data).wrap_err("failed to append frame data")?;
        }
        file.sync_all().wrap_err("failed to fsync intent log")?;
        Ok(drained.len())
    }

    /// Publish all pending intents: log, flush pages, truncate the log.
    pub fn commit(&self, pager: &super::pager::Pager) -> Result<()> {
        let frames = self.log_frames(pager)?;
        if frames == 0 {
            return Ok(());
        }
        pager.sync_all()?;
        self.truncate()
    }

    pub(crate) fn truncate(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0).wrap_err("failed to truncate intent log")?;
        file.sync_all().wrap_err("failed to fsync intent log")?;
        Ok(())
    }

    /// Re-apply every whole, checksum-valid frame in the log, stopping at
    /// the first torn one. Returns the number of frames applied.
    pub fn replay(&self, pager: &mut super::pager::Pager) -> Result<usize> {
        let mut buf = Vec::new();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(0))
                .wrap_err("failed to seek intent log")?;
            file.read_to_end(&mut buf)
                .wrap_err_with(|| format!("failed to read intent log '{}'", self.path.display()))?;
        }

        let mut applied = 0usize;
        let mut at = 0usize;
        while at + FRAME_HEADER_SIZE <= buf.len() {
            let header = FrameHeader::read_from_bytes(&buf[at..at + FRAME_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse frame header: {:?}", e))?;
            let data_at = at + FRAME_HEADER_SIZE;
            let len = header.len.get() as usize;
            if data_at + len > buf.len() {
                break; // torn tail
            }
            let data = &buf[data_at..data_at + len];
            if compute_checksum(header.loc, header.len.get(), data) != header.checksum.get() {
                break;
            }
            let page = pager.page_mut_unjournaled(header.loc)?;
            ensure!(len <= page.len(), "frame larger than a page");
            page[..len].copy_from_slice(data);
            applied += 1;
            at = data_at + len;
        }

        if applied > 0 {
            pager.sync_all()?;
        }
        self.truncate()?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_detects_corruption() {
        let loc = Locator::new(0, 16384);
        let data = vec![7u8; 64];
        let sum = compute_checksum(loc, 64, &data);

        let mut tampered = data.clone();
        tampered[10] ^= 0xFF;
        assert_ne!(sum, compute_checksum(loc, 64, &tampered));
        assert_ne!(sum, compute_checksum(Locator::new(0, 32768), 64, &data));
    }

    #[test]
    fn note_page_dedups_regions() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        let loc = Locator::new(0, 16384);
        journal.note_page(loc, 16384);
        journal.note_page(loc, 16384);
        assert_eq!(journal.pending(), 1);
        journal.discard();
        assert_eq!(journal.pending(), 0);
    }
}
