//! # Store Header
//!
//! Page 0 of segment 0 carries the store header: magic, format version,
//! the tree's root locator, and the freelist anchor. Everything the pager
//! and the index metadata need to reopen the store lives here; the key
//! pattern and namespace stay with the catalog that owns the index.
//!
//! The header is a zerocopy struct written at offset 0 of the page; the
//! rest of the page is reserved. All multi-byte fields are little-endian.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::loc::Locator;
use super::BUCKET_SIZE;

pub const STORE_MAGIC: &[u8; 16] = b"burrowdb index\x00\x00";
pub const STORE_VERSION: u32 = 1;
pub const STORE_HEADER_SIZE: usize = 128;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    magic: [u8; 16],
    version: U32,
    bucket_size: U32,
    head: Locator,
    freelist_head: Locator,
    free_count: U64,
    segment_pages: U32,
    reserved: [u8; 76],
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == STORE_HEADER_SIZE);

impl StoreHeader {
    pub fn new(segment_pages: u32) -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: U32::new(STORE_VERSION),
            bucket_size: U32::new(BUCKET_SIZE as u32),
            head: Locator::NULL,
            freelist_head: Locator::NULL,
            free_count: U64::new(0),
            segment_pages: U32::new(segment_pages),
            reserved: [0; 76],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= STORE_HEADER_SIZE,
            "buffer too small for StoreHeader: {} < {}",
            data.len(),
            STORE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&data[..STORE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read StoreHeader: {:?}", e))?;
        ensure!(&header.magic == STORE_MAGIC, "bad store magic");
        ensure!(
            header.version.get() == STORE_VERSION,
            "unsupported store version {}",
            header.version.get()
        );
        ensure!(
            header.bucket_size.get() as usize == BUCKET_SIZE,
            "store bucket size {} does not match build-time size {}",
            header.bucket_size.get(),
            BUCKET_SIZE
        );
        Ok(header)
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= STORE_HEADER_SIZE,
            "buffer too small for StoreHeader"
        );
        data[..STORE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn head(&self) -> Locator {
        self.head
    }

    pub fn set_head(&mut self, loc: Locator) {
        self.head = loc;
    }

    pub fn freelist_head(&self) -> Locator {
        self.freelist_head
    }

    pub fn set_freelist_head(&mut self, loc: Locator) {
        self.freelist_head = loc;
    }

    pub fn free_count(&self) -> u64 {
        self.free_count.get()
    }

    pub fn set_free_count(&mut self, n: u64) {
        self.free_count = U64::new(n);
    }

    pub fn segment_pages(&self) -> u32 {
        self.segment_pages.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_128_bytes() {
        assert_eq!(std::mem::size_of::<StoreHeader>(), STORE_HEADER_SIZE);
    }

    #[test]
    fn round_trip_through_page_bytes() {
        let mut page = vec![0u8; BUCKET_SIZE];
        let mut h = StoreHeader::new(1024);
        h.set_head(Locator::new(0, 16384));
        h.set_freelist_head(Locator::new(1, 32768));
        h.set_free_count(7);
        h.write_to(&mut page).unwrap();

        let back = StoreHeader::from_bytes(&page).unwrap();
        assert_eq!(back.head(), Locator::new(0, 16384));
        assert_eq!(back.freelist_head(), Locator::new(1, 32768));
        assert_eq!(back.free_count(), 7);
        assert_eq!(back.segment_pages(), 1024);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let page = vec![0u8; BUCKET_SIZE];
        assert!(StoreHeader::from_bytes(&page).is_err());
    }
}
