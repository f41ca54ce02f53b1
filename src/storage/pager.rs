//! # Pager
//!
//! The page allocator and data-file manager. A bucket store is a directory
//! of numbered segment files plus the intent log:
//!
//! ```text
//! index_dir/
//! ├── buckets.000000     # segment 0; page 0 is the store header
//! ├── buckets.000001     # further segments as the store grows
//! └── intents.log        # write-intent journal
//! ```
//!
//! Every page is addressed by a [`Locator`] (segment, byte offset). The
//! pager resolves locators to mapped page slices, allocates fresh pages
//! (freelist first, then by growing the tail segment, then by starting a
//! new segment), and returns freed pages to the freelist.
//!
//! Mutable access always declares write intent: [`Pager::page_mut`] takes
//! the journal and notes the region before handing out the slice. The one
//! deliberate exception is journal replay, which restores committed bytes.
//!
//! The pager is single-writer like everything above it; `&mut self` on the
//! mutating paths enforces it within the process.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use super::freelist::Freelist;
use super::headers::StoreHeader;
use super::journal::Journal;
use super::loc::Locator;
use super::mmap::SegmentFile;
use super::{resolve_loc, BUCKET_SIZE};

/// Where the store header lives. Never handed out by `allocate`.
pub const HEADER_LOC: Locator = Locator::MIN;

const DEFAULT_PAGES_PER_FILE: u32 = 1024;

#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    /// Pages per segment file before a new segment is started.
    pub pages_per_file: u32,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            pages_per_file: DEFAULT_PAGES_PER_FILE,
        }
    }
}

#[derive(Debug)]
pub struct Pager {
    dir: PathBuf,
    files: Vec<SegmentFile>,
    pages_per_file: u32,
    freelist: Freelist,
}

impl Pager {
    pub fn create(dir: &Path, opts: PagerOptions) -> Result<Pager> {
        ensure!(opts.pages_per_file >= 2, "segments need at least 2 pages");
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create store directory '{}'", dir.display()))?;

        let mut seg0 = SegmentFile::create(segment_path(dir, 0), 1)?;
        StoreHeader::new(opts.pages_per_file).write_to(seg0.page_mut(0)?)?;
        seg0.sync()?;

        Ok(Pager {
            dir: dir.to_path_buf(),
            files: vec![seg0],
            pages_per_file: opts.pages_per_file,
            freelist: Freelist::new(),
        })
    }

    pub fn open(dir: &Path) -> Result<Pager> {
        let mut files = Vec::new();
        loop {
            let path = segment_path(dir, files.len() as u32);
            if !path.exists() {
                break;
            }
            files.push(SegmentFile::open(path)?);
        }
        ensure!(
            !files.is_empty(),
            "no segment files in '{}'",
            dir.display()
        );
        files[0].prefetch(0, files[0].page_count());

        let (pages_per_file, freelist) = {
            let header = StoreHeader::from_bytes(files[0].page(0)?)?;
            (
                header.segment_pages(),
                Freelist::from_anchor(header.freelist_head(), header.free_count()),
            )
        };

        Ok(Pager {
            dir: dir.to_path_buf(),
            files,
            pages_per_file,
            freelist,
        })
    }

    /// Root locator as persisted in the store header.
    pub fn stored_head(&self) -> Result<Locator> {
        Ok(StoreHeader::from_bytes(self.files[0].page(0)?)?.head())
    }

    pub fn page(&self, loc: Locator) -> Result<&[u8]> {
        let (file, page_no) = resolve_loc(&self.files, loc)?;
        self.files[file].page(page_no)
    }

    /// Mutable view of a page, with the write intent declared first.
    pub fn page_mut(&mut self, journal: &Journal, loc: Locator) -> Result<&mut [u8]> {
        journal.note_page(loc, BUCKET_SIZE);
        let (file, page_no) = resolve_loc(&self.files, loc)?;
        self.files[file].page_mut(page_no)
    }

    /// Undeclared mutable view; journal replay only.
    pub(crate) fn page_mut_unjournaled(&mut self, loc: Locator) -> Result<&mut [u8]> {
        let (file, page_no) = resolve_loc(&self.files, loc)?;
        self.files[file].page_mut(page_no)
    }

    /// Hand out a fresh zeroed-or-recycled page. The caller initializes it.
    pub fn allocate(&mut self, journal: &Journal) -> Result<Locator> {
        if let Some(loc) = self.freelist.allocate(&mut self.files, journal)? {
            debug!(loc = %loc, "reusing freed page");
            return Ok(loc);
        }

        let last = self.files.len() - 1;
        if self.files[last].page_count() < self.pages_per_file {
            let page_no = self.files[last].page_count();
            self.files[last].grow(page_no + 1)?;
            return Ok(Locator::new(
                last as i32,
                page_no as i32 * BUCKET_SIZE as i32,
            ));
        }

        let file = self.files.len() as u32;
        debug!(file, "starting new segment");
        self.files
            .push(SegmentFile::create(segment_path(&self.dir, file), 1)?);
        Ok(Locator::new(file as i32, 0))
    }

    /// Return a page to the freelist.
    pub fn free(&mut self, journal: &Journal, loc: Locator) -> Result<()> {
        ensure!(loc != HEADER_LOC, "cannot free the store header page");
        resolve_loc(&self.files, loc)?;
        self.freelist.release(&mut self.files, journal, loc)
    }

    /// Persist the store header (root + freelist anchor) and publish every
    /// declared intent through the journal.
    pub fn commit(&mut self, journal: &Journal, head: Locator) -> Result<()> {
        self.write_header(journal, head)?;
        journal.commit(self)
    }

    fn write_header(&mut self, journal: &Journal, head: Locator) -> Result<()> {
        journal.note_page(HEADER_LOC, BUCKET_SIZE);
        let freelist_head = self.freelist.head();
        let free_count = self.freelist.free_count();
        let page = self.files[0].page_mut(0)?;
        let mut header = *StoreHeader::from_bytes(page)?;
        header.set_head(head);
        header.set_freelist_head(freelist_head);
        header.set_free_count(free_count);
        header.write_to(page)
    }

    pub fn sync_all(&self) -> Result<()> {
        for file in &self.files {
            file.sync()?;
        }
        Ok(())
    }

    pub fn free_count(&self) -> u64 {
        self.freelist.free_count()
    }

    /// Total pages across all segments, header page included.
    pub fn page_count(&self) -> u64 {
        self.files.iter().map(|f| f.page_count() as u64).sum()
    }
}

fn segment_path(dir: &Path, file: u32) -> PathBuf {
    dir.join(format!("buckets.{:06}", file))
}
