//! Compound-key range-endpoint seeks: prefix targets, strict-after
//! semantics, per-position inclusivity, and reverse scans.

mod common;

use burrowdb::{Element, KeyPattern, RangeTarget};
use common::*;

/// 10x10 grid of keys {a, b} under an (a, b) ascending pattern.
fn grid_index() -> TestIndex {
    let pattern = KeyPattern::ascending(&["a", "b"]);
    let mut ix = TestIndex::with_pattern(pattern);
    {
        let mut t = ix.tree();
        let mut r = 0;
        for a in 1..=10i64 {
            for b in 1..=10i64 {
                r += 2;
                t.insert(rec(r), &key2(a, b), true).unwrap();
            }
        }
    }
    ix
}

#[test]
fn advance_to_strictly_after_a_prefix() {
    let mut ix = grid_index();
    let t = ix.tree();

    // seek "strictly after every key with a == 5"
    let begin = ikey(5);
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 1,
        after: true,
        end: &[Element::MaxKey, Element::MaxKey],
        end_inclusive: &[false, false],
    };

    let (mut loc, mut pos) = first_pos(&t).unwrap();
    t.advance_to(&mut loc, &mut pos, &target, 1).unwrap();

    assert!(!loc.is_null());
    let b = t.bucket(loc).unwrap();
    assert_eq!(format!("{}", b.key_at(pos).unwrap()), "{ 6, 1 }");
}

#[test]
fn custom_locate_lands_on_an_exact_compound_key() {
    let mut ix = grid_index();
    let t = ix.tree();

    let begin = key2(3, 7);
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 2,
        after: false,
        end: &[Element::MaxKey, Element::MaxKey],
        end_inclusive: &[true, true],
    };

    let mut loc = t.head();
    let mut pos = 0;
    t.custom_locate(&mut loc, &mut pos, &target, 1).unwrap();

    assert!(!loc.is_null());
    let b = t.bucket(loc).unwrap();
    assert_eq!(format!("{}", b.key_at(pos).unwrap()), "{ 3, 7 }");
}

#[test]
fn exclusive_trailing_bound_skips_the_bound_itself() {
    let mut ix = grid_index();
    let t = ix.tree();

    // first key with a == 3 and b > 7; the endpoint elements come from a
    // bound document the way a cursor layer would build them
    let begin = ikey(3);
    let bound = burrowdb::KeyBuilder::new().max_key().int(7).finish();
    let end_elems = bound.as_ref().parsed();
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 1,
        after: false,
        end: end_elems.as_slice(),
        end_inclusive: &[true, false],
    };

    let (mut loc, mut pos) = first_pos(&t).unwrap();
    t.advance_to(&mut loc, &mut pos, &target, 1).unwrap();

    assert!(!loc.is_null());
    let b = t.bucket(loc).unwrap();
    assert_eq!(format!("{}", b.key_at(pos).unwrap()), "{ 3, 8 }");
}

#[test]
fn reverse_seek_stops_before_the_prefix() {
    let mut ix = grid_index();
    let t = ix.tree();

    // reverse: greatest key strictly before every key with a == 5
    let begin = ikey(5);
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 1,
        after: true,
        end: &[Element::MinKey, Element::MinKey],
        end_inclusive: &[false, false],
    };

    let (mut loc, mut pos) = t.find_largest_key().unwrap().unwrap();
    t.advance_to(&mut loc, &mut pos, &target, -1).unwrap();

    assert!(!loc.is_null());
    let b = t.bucket(loc).unwrap();
    assert_eq!(format!("{}", b.key_at(pos).unwrap()), "{ 4, 10 }");
}

#[test]
fn seek_past_the_last_key_reports_end_of_scan() {
    let mut ix = grid_index();
    let t = ix.tree();

    let begin = ikey(10);
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 1,
        after: true,
        end: &[Element::MaxKey, Element::MaxKey],
        end_inclusive: &[false, false],
    };

    let (mut loc, mut pos) = first_pos(&t).unwrap();
    t.advance_to(&mut loc, &mut pos, &target, 1).unwrap();
    assert!(loc.is_null(), "nothing sorts after the a == 10 block");
}

#[test]
fn seek_works_across_bucket_boundaries() {
    // force a multi-bucket tree so the climb-and-descend path runs
    let pattern = KeyPattern::ascending(&["a", "b"]);
    let mut ix = TestIndex::with_pattern(pattern);
    let mut t = ix.tree();
    let mut r = 0;
    for a in 1..=40i64 {
        for b in 1..=10i64 {
            r += 2;
            let key = burrowdb::KeyBuilder::new()
                .int(a)
                .int(b)
                .blob(&vec![0x70; 300])
                .finish();
            t.insert(rec(r), &key, true).unwrap();
        }
    }
    assert!(t.height().unwrap() >= 2);

    let begin = ikey(23);
    let target = RangeTarget {
        begin: begin.as_ref(),
        begin_len: 1,
        after: true,
        end: &[Element::MaxKey, Element::MaxKey],
        end_inclusive: &[false, false],
    };

    let (mut loc, mut pos) = first_pos(&t).unwrap();
    t.advance_to(&mut loc, &mut pos, &target, 1).unwrap();

    assert!(!loc.is_null());
    let b = t.bucket(loc).unwrap();
    let key = b.key_at(pos).unwrap();
    let elems: Vec<Element<'_>> = key.elements().collect();
    assert_eq!(elems[0], Element::Int(24));
    assert_eq!(elems[1], Element::Int(1));
}
