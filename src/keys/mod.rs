//! # Composite Keys and Ordering
//!
//! Index keys are self-describing composite documents compared element-wise
//! under a per-field direction mask. This module holds the encoding
//! ([`document`]) and the comparators ([`compare`]).
//!
//! Nothing here touches pages: keys read from a bucket arrive as validated
//! [`KeyRef`] views over page bytes, and anything that must survive a page
//! mutation is promoted to an owned [`IndexKey`] first.

pub mod compare;
pub mod document;

pub use compare::{compare_keys, custom_key_cmp, KeyOrdering, KeyPattern};
pub use document::{Element, IndexKey, KeyBuilder, KeyRef};
