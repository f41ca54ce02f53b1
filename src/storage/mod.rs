//! # Storage Layer
//!
//! Everything below the tree algorithms: persistent locators, memory-mapped
//! segment files, the store header, the free-page list, the write-intent
//! journal, and the pager that ties them together.
//!
//! The contract the B-tree consumes is small:
//!
//! - `Pager::allocate` / `Pager::free` — fresh fixed-size pages by locator
//! - `Pager::page` / `Pager::page_mut` — map a locator to a byte view,
//!   mutable views declared through the journal first
//! - `Journal::commit` — publish every declared region atomically enough
//!   for a single-writer engine (log, flush, truncate)
//!
//! ## Module organization
//!
//! - [`loc`]: the `Locator` (segment, offset) page/record address
//! - [`mmap`]: one mapped segment file
//! - [`headers`]: the store header on segment 0 page 0
//! - [`freelist`]: trunk-page chain of freed locators
//! - [`journal`]: write-intent declaration, commit, and replay
//! - [`pager`]: locator resolution, allocation, and segment management

pub mod freelist;
pub mod headers;
pub mod journal;
pub mod loc;
pub mod mmap;
pub mod pager;

pub use headers::{StoreHeader, STORE_HEADER_SIZE, STORE_MAGIC, STORE_VERSION};
pub use journal::Journal;
pub use loc::{Locator, LOCATOR_SIZE};
pub use mmap::SegmentFile;
pub use pager::{Pager, PagerOptions, HEADER_LOC};

use eyre::{ensure, Result};

/// Size of every page in the store. Fixed at build time; changing it
/// requires a store migration.
pub const BUCKET_SIZE: usize = 16384;

/// Map a locator to (segment index, page number), validating alignment and
/// bounds against the currently mapped segments.
pub(crate) fn resolve_loc(files: &[SegmentFile], loc: Locator) -> Result<(usize, u32)> {
    ensure!(!loc.is_null(), "cannot resolve the null locator");
    let file = loc.file();
    ensure!(
        file >= 0 && (file as usize) < files.len(),
        "locator {} names segment {} of {}",
        loc,
        file,
        files.len()
    );
    let ofs = loc.ofs();
    ensure!(
        ofs >= 0 && ofs as usize % BUCKET_SIZE == 0,
        "locator {} is not page-aligned",
        loc
    );
    let page_no = (ofs as usize / BUCKET_SIZE) as u32;
    ensure!(
        page_no < files[file as usize].page_count(),
        "locator {} is past the end of segment {}",
        loc,
        file
    );
    Ok((file as usize, page_no))
}
