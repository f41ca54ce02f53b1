//! Shared fixtures and invariant checks for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use burrowdb::btree::{BUCKET_HEADER_SIZE, SLOT_SIZE};
use burrowdb::{
    Btree, CursorRegistry, IndexKey, IndexMeta, Journal, KeyBuilder, KeyPattern, Locator, Pager,
    PagerOptions, BUCKET_SIZE,
};
use tempfile::TempDir;

pub struct TestIndex {
    pub dir: TempDir,
    pub pager: Pager,
    pub journal: Journal,
    pub cursors: Arc<CursorRegistry>,
    pub meta: IndexMeta,
}

impl TestIndex {
    pub fn new() -> TestIndex {
        TestIndex::with_pattern(KeyPattern::ascending(&["a"]))
    }

    pub fn with_pattern(pattern: KeyPattern) -> TestIndex {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        let pager = Pager::create(dir.path(), PagerOptions::default()).unwrap();
        let meta = IndexMeta::new("test.things.$idx", pattern);
        TestIndex {
            dir,
            pager,
            journal,
            cursors: Arc::new(CursorRegistry::new()),
            meta,
        }
    }

    pub fn tree(&mut self) -> Btree<'_> {
        Btree::create(&mut self.pager, &self.journal, &self.cursors, &mut self.meta).unwrap()
    }

    /// Publish everything declared so far and persist the root.
    pub fn commit(&mut self) {
        let head = self.meta.head();
        self.pager.commit(&self.journal, head).unwrap();
    }

    /// Reopen the store from disk, as after a restart.
    pub fn reopen(self) -> TestIndex {
        let TestIndex {
            dir, meta, ..
        } = self;
        let journal = Journal::open(dir.path()).unwrap();
        let mut pager = Pager::open(dir.path()).unwrap();
        journal.replay(&mut pager).unwrap();
        let meta = IndexMeta::open(&pager, "test.things.$idx", meta.pattern().clone()).unwrap();
        TestIndex {
            dir,
            pager,
            journal,
            cursors: Arc::new(CursorRegistry::new()),
            meta,
        }
    }
}

pub fn ikey(v: i64) -> IndexKey {
    KeyBuilder::new().int(v).finish()
}

pub fn key2(a: i64, b: i64) -> IndexKey {
    KeyBuilder::new().int(a).int(b).finish()
}

/// A key padded out so a controllable number fit in one bucket.
pub fn padded_key(v: i64, pad: usize) -> IndexKey {
    KeyBuilder::new().int(v).blob(&vec![0x6b; pad]).finish()
}

pub fn rec(ofs: i32) -> Locator {
    Locator::new(1, ofs)
}

/// Position of the in-order first entry: descend leftmost children.
pub fn first_pos(t: &Btree<'_>) -> Option<(Locator, usize)> {
    let mut loc = t.head();
    loop {
        let b = t.bucket(loc).unwrap();
        if b.n() == 0 {
            return None;
        }
        let child = b.slot(0).unwrap().prev_child();
        if child.is_null() {
            return Some((loc, 0));
        }
        loc = child;
    }
}

/// Every live `(key, record)` pair in forward order.
pub fn collect_forward(t: &Btree<'_>) -> Vec<(IndexKey, Locator)> {
    let mut out = Vec::new();
    let Some((mut loc, mut pos)) = first_pos(t) else {
        return out;
    };
    loop {
        let b = t.bucket(loc).unwrap();
        let slot = *b.slot(pos).unwrap();
        if slot.is_used() {
            out.push((b.key_at(pos).unwrap().to_owned(), slot.record()));
        }
        loc = t.advance(loc, &mut pos, 1, "collect_forward").unwrap();
        if loc.is_null() {
            return out;
        }
    }
}

/// Every live `(key, record)` pair in reverse order.
pub fn collect_reverse(t: &Btree<'_>) -> Vec<(IndexKey, Locator)> {
    let mut out = Vec::new();
    let Some((mut loc, mut pos)) = t.find_largest_key().unwrap() else {
        return out;
    };
    loop {
        let b = t.bucket(loc).unwrap();
        let slot = *b.slot(pos).unwrap();
        if slot.is_used() {
            out.push((b.key_at(pos).unwrap().to_owned(), slot.record()));
        }
        loc = t.advance(loc, &mut pos, -1, "collect_reverse").unwrap();
        if loc.is_null() {
            return out;
        }
    }
}

fn all_buckets(t: &Btree<'_>, loc: Locator, out: &mut Vec<Locator>) {
    out.push(loc);
    let b = t.bucket(loc).unwrap();
    for i in 0..b.n() {
        let child = b.slot(i).unwrap().prev_child();
        if !child.is_null() {
            all_buckets(t, child, out);
        }
    }
    let nc = b.next_child();
    if !nc.is_null() {
        all_buckets(t, nc, out);
    }
}

pub fn bucket_count(t: &Btree<'_>) -> usize {
    let mut buckets = Vec::new();
    all_buckets(t, t.head(), &mut buckets);
    buckets.len()
}

/// The structural invariants every reachable bucket must satisfy: key and
/// record order, size accounting, parent back-pointers, root uniqueness,
/// and a sorted full traversal.
pub fn check_invariants(t: &Btree<'_>) {
    // per-bucket order + accounting, parent warnings
    t.full_validate().unwrap();

    let mut buckets = Vec::new();
    all_buckets(t, t.head(), &mut buckets);

    let mut roots = 0;
    for &loc in &buckets {
        let b = t.bucket(loc).unwrap();
        b.assert_valid(t.ordering(), true).unwrap();
        assert_eq!(
            b.empty_size() + b.top_size() + b.n() * SLOT_SIZE + BUCKET_HEADER_SIZE,
            BUCKET_SIZE,
            "size accounting broken in {}",
            loc
        );
        if b.parent().is_null() {
            roots += 1;
            assert_eq!(loc, t.head(), "parentless bucket {} is not the head", loc);
        }
        for pos in 0..=b.n() {
            let child = b.child_at(pos).unwrap();
            if !child.is_null() {
                assert_eq!(
                    t.bucket(child).unwrap().parent(),
                    loc,
                    "parent back-pointer of {} is stale",
                    child
                );
            }
        }
    }
    assert_eq!(roots, 1, "exactly one root expected");

    // the traversal is the canonical order check across buckets
    let entries = collect_forward(t);
    for w in entries.windows(2) {
        let (k1, r1) = &w[0];
        let (k2, r2) = &w[1];
        match burrowdb::keys::compare_keys(k1.as_ref(), k2.as_ref(), t.ordering()) {
            std::cmp::Ordering::Greater => panic!("traversal out of order: {} > {}", k1, k2),
            std::cmp::Ordering::Equal => {
                assert!(r1 < r2, "record tie-break violated: {} >= {}", r1, r2)
            }
            std::cmp::Ordering::Less => {}
        }
    }

    // reverse traversal mirrors forward
    let mut rev = collect_reverse(t);
    rev.reverse();
    assert_eq!(entries.len(), rev.len());
    for (a, b) in entries.iter().zip(rev.iter()) {
        assert_eq!(a.0.as_bytes(), b.0.as_bytes());
        assert_eq!(a.1, b.1);
    }
}
