//! # burrowdb — document-database B-tree index engine
//!
//! burrowdb is the on-disk index engine of a document database: an
//! ordered map from composite keys to record locators, stored as
//! fixed-size bucket pages over memory-mapped segment files, with every
//! mutation declared through a write-intent journal.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{Btree, CursorRegistry, IndexMeta, Journal, KeyBuilder,
//!                KeyPattern, Locator, Pager, PagerOptions};
//!
//! let journal = Journal::create(dir)?;
//! let mut pager = Pager::create(dir, PagerOptions::default())?;
//! let cursors = CursorRegistry::new();
//! let mut meta = IndexMeta::new("app.users.$name_1", KeyPattern::ascending(&["name"]));
//!
//! let mut tree = Btree::create(&mut pager, &journal, &cursors, &mut meta)?;
//! let key = KeyBuilder::new().text("alice").finish();
//! tree.insert(Locator::new(0, 4096), &key, /*dups_allowed=*/ false)?;
//! drop(tree);
//!
//! let head = meta.head();
//! pager.commit(&journal, head)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------+
//! |      Index layer (callers)                |
//! +-------------------------------------------+
//! |  btree: tree ops, range seek, builder     |
//! +----------------------+--------------------+
//! |  keys: documents,    |  meta: namespace,  |
//! |  ordering, compare   |  pattern, root     |
//! +----------------------+--------------------+
//! |  storage: pager, journal, freelist, mmap  |
//! +-------------------------------------------+
//! ```
//!
//! ## Module Overview
//!
//! - [`btree`]: bucket layout and the tree algorithms
//! - [`keys`]: composite key encoding and comparators
//! - [`storage`]: locators, mapped segments, pager, write-intent journal
//! - [`meta`]: per-index metadata (namespace, key pattern, root)
//! - [`error`]: typed sentinel errors with their catalog codes

pub mod btree;
pub mod error;
pub mod keys;
pub mod meta;
pub mod storage;

pub use btree::{
    Btree, BtreeBuilder, Bucket, BucketDeletionListener, CursorRegistry, InsertCode, Locate,
    RangeTarget, ValidateStats,
};
pub use error::IndexError;
pub use keys::{Element, IndexKey, KeyBuilder, KeyOrdering, KeyPattern, KeyRef};
pub use meta::IndexMeta;
pub use storage::{Journal, Locator, Pager, PagerOptions, BUCKET_SIZE};
