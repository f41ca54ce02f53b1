//! # B-Tree Index Engine
//!
//! An on-disk B-tree mapping ordered composite keys to record locators.
//! Buckets are fixed-size pages addressed only by persistent locators;
//! there are no in-memory pointers between nodes, so pages survive
//! allocate/free cycles and process restarts without fixups.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------+
//! |  Btree (tree.rs)                           |
//! |  find / insert+split / delete+merge /      |
//! |  advance / validate                        |
//! +---------------------+----------------------+
//! |  RangeTarget seek   |  BtreeBuilder        |
//! |  (range.rs)         |  (builder.rs)        |
//! +---------------------+----------------------+
//! |  Bucket / BucketMut page layout            |
//! |  (bucket.rs)                               |
//! +--------------------------------------------+
//! |  Pager + Journal (../storage)              |
//! +--------------------------------------------+
//! ```
//!
//! - [`bucket`]: the slotted page layout and its primitives (insert,
//!   push/pop, pack, split position)
//! - [`tree`]: whole-tree operations over locators
//! - [`range`]: compound-key range-endpoint seek
//! - [`builder`]: bottom-up construction from a sorted stream
//! - [`cursor`]: deallocation notifications for open cursors
//!
//! ## Concurrency
//!
//! Single writer, serialized by the database's outer write lock. The
//! algorithms contain no suspension points; page faults on the mapped
//! files are the only implicit blocking. Cursor safety across page
//! deallocation is cooperative via [`cursor::CursorRegistry`].

pub mod bucket;
pub mod builder;
pub mod cursor;
pub mod range;
pub mod tree;

pub use bucket::{Bucket, BucketMut, Slot, BUCKET_HEADER_SIZE, KEY_MAX, SLOT_SIZE, TOTAL_DATA_SIZE};
pub use builder::BtreeBuilder;
pub use cursor::{BucketDeletionListener, CursorRegistry};
pub use range::RangeTarget;
pub use tree::{Btree, InsertCode, Locate, ValidateStats};
