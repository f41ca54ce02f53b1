//! Bottom-up bulk construction: equivalence with incremental inserts,
//! input validation, and rollback of uncommitted builds.

mod common;

use burrowdb::{Btree, BtreeBuilder, IndexError, IndexKey, Locator};
use common::*;

fn sorted_stream(count: i64, pad: usize) -> Vec<(IndexKey, Locator)> {
    (0..count)
        .map(|v| (padded_key(v, pad), rec(v as i32 * 2)))
        .collect()
}

#[test]
fn bulk_build_matches_incremental_inserts() {
    let stream = sorted_stream(300, 200);

    // bulk-built index
    let mut bulk = TestIndex::new();
    {
        let mut builder = BtreeBuilder::new(
            &mut bulk.pager,
            &bulk.journal,
            &bulk.cursors,
            &mut bulk.meta,
            true,
        )
        .unwrap();
        for (key, record) in &stream {
            builder.add_key(key, *record).unwrap();
        }
        assert_eq!(builder.keys_added(), 300);
        builder.commit().unwrap();
    }
    assert!(!bulk.meta.head().is_null());

    // incrementally built index over the same entries
    let mut incr = TestIndex::new();
    {
        let mut t = incr.tree();
        for (key, record) in &stream {
            t.insert(*record, key, true).unwrap();
        }
    }

    let bulk_tree = Btree::open(&mut bulk.pager, &bulk.journal, &bulk.cursors, &mut bulk.meta)
        .unwrap();
    check_invariants(&bulk_tree);
    assert!(bulk_tree.height().unwrap() >= 2);

    let incr_tree = incr.tree();
    let a = collect_forward(&bulk_tree);
    let b = collect_forward(&incr_tree);
    assert_eq!(a.len(), b.len());
    for ((k1, r1), (k2, r2)) in a.iter().zip(b.iter()) {
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(r1, r2);
    }
}

#[test]
fn bulk_build_single_bucket_tree() {
    let mut ix = TestIndex::new();
    {
        let mut builder = BtreeBuilder::new(
            &mut ix.pager,
            &ix.journal,
            &ix.cursors,
            &mut ix.meta,
            true,
        )
        .unwrap();
        for v in 0..10i64 {
            builder.add_key(&ikey(v), rec(v as i32 * 2)).unwrap();
        }
        builder.commit().unwrap();
    }

    let t = ix.tree();
    assert_eq!(t.height().unwrap(), 1);
    assert_eq!(collect_forward(&t).len(), 10);
    check_invariants(&t);
}

#[test]
fn unique_bulk_build_rejects_equal_neighbors() {
    let mut ix = TestIndex::new();
    let mut builder = BtreeBuilder::new(
        &mut ix.pager,
        &ix.journal,
        &ix.cursors,
        &mut ix.meta,
        false,
    )
    .unwrap();

    builder.add_key(&ikey(1), rec(2)).unwrap();
    let err = builder.add_key(&ikey(1), rec(4)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::DuplicateKey { .. })
    ));
}

#[test]
fn out_of_order_input_is_a_caller_bug() {
    let mut ix = TestIndex::new();
    let mut builder = BtreeBuilder::new(
        &mut ix.pager,
        &ix.journal,
        &ix.cursors,
        &mut ix.meta,
        false,
    )
    .unwrap();

    builder.add_key(&ikey(5), rec(2)).unwrap();
    let err = builder.add_key(&ikey(3), rec(4)).unwrap_err();
    let e = err.downcast_ref::<IndexError>().unwrap();
    assert_eq!(e.code(), Some(10288));
}

#[test]
fn dropping_an_uncommitted_builder_rolls_back() {
    let mut ix = TestIndex::new();
    {
        let mut builder = BtreeBuilder::new(
            &mut ix.pager,
            &ix.journal,
            &ix.cursors,
            &mut ix.meta,
            true,
        )
        .unwrap();
        for v in 0..200i64 {
            builder.add_key(&padded_key(v, 500), rec(v as i32 * 2)).unwrap();
        }
        // dropped without commit
    }

    assert!(ix.meta.head().is_null(), "rollback must not publish a root");
    assert!(ix.pager.free_count() > 0, "chain pages return to the allocator");

    // the index is still usable the ordinary way
    let mut t = ix.tree();
    t.insert(rec(2), &ikey(1), true).unwrap();
    assert_eq!(collect_forward(&t).len(), 1);
}

#[test]
fn empty_build_commits_an_empty_root() {
    let mut ix = TestIndex::new();
    {
        let mut builder = BtreeBuilder::new(
            &mut ix.pager,
            &ix.journal,
            &ix.cursors,
            &mut ix.meta,
            true,
        )
        .unwrap();
        builder.commit().unwrap();
    }

    let t = ix.tree();
    assert_eq!(t.bucket(t.head()).unwrap().n(), 0);
    assert!(collect_forward(&t).is_empty());
}
