//! # Memory-Mapped Segment Files
//!
//! A [`SegmentFile`] is one numbered file of the bucket store, memory-mapped
//! in its entirety. The pager addresses a bucket as (segment, offset); this
//! module only knows about one file's worth of fixed-size pages.
//!
//! ## Safety model
//!
//! A mapped region becomes invalid when the file is grown and remapped. No
//! guards or epochs are used; the borrow checker enforces the rule instead:
//!
//! ```text
//! page(&self) -> &[u8]              // shared borrow
//! page_mut(&mut self) -> &mut [u8]  // exclusive borrow
//! grow(&mut self)                   // exclusive borrow, may remap
//! ```
//!
//! Since `grow` takes `&mut self`, no page slice can be live across it.
//!
//! ## File format
//!
//! Segments are concatenated `BUCKET_SIZE` pages with no per-file framing;
//! segment 0 reserves its first page for the store header (the pager's
//! concern, not this module's). File length is always a multiple of the
//! page size.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::BUCKET_SIZE;

#[derive(Debug)]
pub struct SegmentFile {
    file: File,
    mmap: MmapMut,
    page_count: u32,
}

impl SegmentFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open segment file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            len > 0 && len % BUCKET_SIZE as u64 == 0,
            "segment file '{}' has size {} which is not a positive multiple of {}",
            path.display(),
            len,
            BUCKET_SIZE
        );

        // SAFETY: the file is opened read+write for this process's exclusive
        // use; the mapping's lifetime is tied to the SegmentFile, and all
        // access is bounds-checked against page_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map segment '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: (len / BUCKET_SIZE as u64) as u32,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(initial_page_count > 0, "segment needs at least one page");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create segment file '{}'", path.display()))?;

        let len = initial_page_count as u64 * BUCKET_SIZE as u64;
        file.set_len(len)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        // SAFETY: freshly created and sized file, exclusive access, mapping
        // lifetime tied to the SegmentFile, bounds-checked access.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map segment '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (segment has {})",
            page_no,
            self.page_count
        );
        let at = page_no as usize * BUCKET_SIZE;
        Ok(&self.mmap[at..at + BUCKET_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (segment has {})",
            page_no,
            self.page_count
        );
        let at = page_no as usize * BUCKET_SIZE;
        Ok(&mut self.mmap[at..at + BUCKET_SIZE])
    }

    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush segment before grow")?;

        let len = new_page_count as u64 * BUCKET_SIZE as u64;
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to extend segment to {} bytes", len))?;

        // SAFETY: `grow` holds &mut self so no page borrows exist; the old
        // mapping was flushed and is dropped on reassignment.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap segment after grow")?
        };
        self.page_count = new_page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync segment")
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Hint the kernel that a page range is about to be read sequentially.
    pub fn prefetch(&self, start_page: u32, count: u32) {
        if start_page >= self.page_count {
            return;
        }
        let end_page = (start_page + count).min(self.page_count);
        let at = start_page as usize * BUCKET_SIZE;
        let len = (end_page - start_page) as usize * BUCKET_SIZE;

        #[cfg(unix)]
        // SAFETY: the range was clamped to the mapping above; MADV_WILLNEED
        // is advisory and does not change memory contents.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(at) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = (at, len);
    }
}
