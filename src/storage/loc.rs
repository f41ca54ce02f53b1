//! # Persistent Locators
//!
//! A [`Locator`] is the engine's only form of inter-page reference: an opaque
//! (segment file, byte offset) pair. The tree never holds memory pointers
//! between pages; every parent/child edge and every record reference is a
//! locator resolved through the pager on each access. This is what lets a
//! page move through allocate/free cycles without dangling references.
//!
//! ## Layout
//!
//! Locators are embedded directly in persisted page structures, so the
//! struct is a zerocopy POD with little-endian fields:
//!
//! ```text
//! +-----------+-----------+
//! | file: i32 | ofs: i32  |
//! +-----------+-----------+
//! ```
//!
//! The null sentinel is `file == -1, ofs == 0`. Locators order by file,
//! then offset.
//!
//! ## The used bit
//!
//! Slots store the record locator with its low offset bit repurposed as the
//! "used" flag: bit set means a live entry, bit clear means a tombstone.
//! Record payload offsets are even (records are aligned), so the bit is
//! free. Every equality or ordering test on record locators must go through
//! [`Locator::masked`]; the raw value only matters for slot storage.

use std::cmp::Ordering;
use std::fmt;

use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct Locator {
    file: I32,
    ofs: I32,
}

pub const LOCATOR_SIZE: usize = 8;
const _: () = assert!(std::mem::size_of::<Locator>() == LOCATOR_SIZE);

impl Locator {
    /// The null sentinel: no page, no record.
    pub const NULL: Locator = Locator {
        file: I32::new(-1),
        ofs: I32::new(0),
    };

    /// Sorts before every real record locator. Used to position a cursor at
    /// the first entry of a duplicate run.
    pub const MIN: Locator = Locator {
        file: I32::new(0),
        ofs: I32::new(0),
    };

    /// Sorts after every real record locator.
    pub const MAX: Locator = Locator {
        file: I32::new(i32::MAX),
        ofs: I32::new(i32::MAX),
    };

    pub fn new(file: i32, ofs: i32) -> Self {
        Self {
            file: I32::new(file),
            ofs: I32::new(ofs),
        }
    }

    pub fn file(&self) -> i32 {
        self.file.get()
    }

    pub fn ofs(&self) -> i32 {
        self.ofs.get()
    }

    pub fn is_null(&self) -> bool {
        self.file.get() == -1
    }

    /// This locator with the used bit cleared. All comparisons between
    /// record locators operate on masked values.
    pub fn masked(&self) -> Locator {
        Locator::new(self.file.get(), self.ofs.get() & !1)
    }

    /// This locator with the used bit set.
    pub fn with_used_bit(&self) -> Locator {
        Locator::new(self.file.get(), self.ofs.get() | 1)
    }

    /// This locator with the used bit cleared.
    pub fn without_used_bit(&self) -> Locator {
        self.masked()
    }

    pub fn used_bit(&self) -> bool {
        self.ofs.get() & 1 == 1
    }
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Locator {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.file.get(), self.ofs.get()).cmp(&(other.file.get(), other.ofs.get()))
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}:{:x}", self.file.get(), self.ofs.get())
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
