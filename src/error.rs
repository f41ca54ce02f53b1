//! # Index Engine Errors
//!
//! Typed sentinel errors for the B-tree engine. Most fallible paths return
//! `eyre::Result` with context strings; the variants here exist for the
//! conditions callers must distinguish programmatically:
//!
//! - `DuplicateKey` is user-visible and recovered by declining the insert.
//! - `AlreadyInIndex` is benign: the identical (key, record) pair was
//!   re-presented, e.g. a background index build racing a foreground write.
//!   The record-insert path catches it and treats it as success.
//! - `Assertion` carries the numeric codes the surrounding database catalog
//!   already documents; they must not change across versions.
//! - `Interrupted` is raised by the cooperative kill-flag check at the start
//!   of whole-tree validation.
//!
//! Recover a typed error from an `eyre::Report` with
//! `report.downcast_ref::<IndexError>()`.

use thiserror::Error;

/// Assertion codes from the existing database error catalog. The engine
/// emits these unchanged.
pub mod codes {
    /// Bucket self-checks during validation.
    pub const VALIDATE: u32 = 10281;
    /// `pop_back` called on an empty bucket.
    pub const POP_BACK_EMPTY: u32 = 10282;
    /// `pop_back` called while the rightmost down-pointer is set.
    pub const POP_BACK_RCHILD: u32 = 10283;
    /// Infallible `push_back` found no room.
    pub const PUSH_BACK_NO_ROOM: u32 = 10284;
    /// Unused-slot reuse attempted with a non-null left child.
    pub const REUSE_LCHILD: u32 = 10285;
    /// Unused-slot reuse attempted with a non-null right child.
    pub const REUSE_RCHILD: u32 = 10286;
    /// The identical (key, record) pair is already present.
    pub const ALREADY_IN_INDEX: u32 = 10287;
    /// Bulk builder fed keys out of order.
    pub const BUILDER_KEY_ORDER: u32 = 10288;
}

#[derive(Debug, Error)]
pub enum IndexError {
    /// A unique index would gain a second live entry for the same key.
    /// The message is pre-formatted by [`crate::meta::IndexMeta::dup_key_error`].
    #[error("{message}")]
    DuplicateKey { message: String },

    /// The identical (key, record) pair was re-presented. Code 10287.
    #[error("btree: key+recloc already in index")]
    AlreadyInIndex,

    /// A structural invariant did not hold at runtime. The operation aborts
    /// the enclosing transaction; no partial repair is attempted.
    #[error("{msg} ({code})")]
    Assertion { code: u32, msg: String },

    /// The kill flag was set when a long operation checked for interruption.
    #[error("operation interrupted")]
    Interrupted,
}

impl IndexError {
    pub fn assertion(code: u32, msg: impl Into<String>) -> Self {
        IndexError::Assertion {
            code,
            msg: msg.into(),
        }
    }

    /// The numeric catalog code for this error, if it has one.
    pub fn code(&self) -> Option<u32> {
        match self {
            IndexError::AlreadyInIndex => Some(codes::ALREADY_IN_INDEX),
            IndexError::Assertion { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_in_index_carries_catalog_code() {
        assert_eq!(IndexError::AlreadyInIndex.code(), Some(10287));
    }

    #[test]
    fn assertion_display_includes_code() {
        let e = IndexError::assertion(codes::POP_BACK_EMPTY, "n==0 in pop_back");
        assert_eq!(e.to_string(), "n==0 in pop_back (10282)");
    }

    #[test]
    fn downcast_from_eyre_report() {
        let report: eyre::Report = IndexError::AlreadyInIndex.into();
        let e = report.downcast_ref::<IndexError>().unwrap();
        assert!(matches!(e, IndexError::AlreadyInIndex));
    }
}
