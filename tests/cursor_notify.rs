//! Cursor stability across deletes: a cursor repositioned through the
//! deallocation notification keeps enumerating every remaining key
//! exactly once.

mod common;

use std::sync::Arc;

use burrowdb::{Btree, BucketDeletionListener, IndexKey, Locator};
use common::*;
use parking_lot::Mutex;

struct TestCursor {
    state: Mutex<CursorState>,
    notified: Mutex<Vec<Locator>>,
}

struct CursorState {
    loc: Locator,
    pos: usize,
    current: Option<(IndexKey, Locator)>,
    invalidated: bool,
}

impl BucketDeletionListener for TestCursor {
    fn about_to_delete_bucket(&self, loc: Locator) {
        self.notified.lock().push(loc);
        let mut s = self.state.lock();
        if s.loc == loc {
            s.invalidated = true;
        }
    }
}

impl TestCursor {
    fn at(loc: Locator, pos: usize, key: IndexKey, record: Locator) -> Arc<TestCursor> {
        Arc::new(TestCursor {
            state: Mutex::new(CursorState {
                loc,
                pos,
                current: Some((key, record)),
                invalidated: false,
            }),
            notified: Mutex::new(Vec::new()),
        })
    }

    fn current(&self) -> Option<(IndexKey, Locator)> {
        self.state.lock().current.clone()
    }

    /// Step to the next live entry, re-locating first if the bucket this
    /// cursor sat on was deallocated.
    fn next(&self, t: &Btree<'_>) -> Option<(IndexKey, Locator)> {
        let mut s = self.state.lock();
        let (key, record) = s.current.clone()?;

        if s.invalidated {
            let r = t.locate(t.head(), key.as_ref(), record, 1).unwrap();
            assert!(r.found, "repositioning lost the cursor's current entry");
            s.loc = r.loc;
            s.pos = r.pos;
            s.invalidated = false;
        }

        loop {
            let next = t.advance(s.loc, &mut s.pos, 1, "TestCursor::next").unwrap();
            if next.is_null() {
                s.current = None;
                return None;
            }
            s.loc = next;
            let b = t.bucket(s.loc).unwrap();
            let slot = *b.slot(s.pos).unwrap();
            if slot.is_used() {
                let entry = (b.key_at(s.pos).unwrap().to_owned(), slot.record());
                s.current = Some(entry.clone());
                return Some(entry);
            }
        }
    }
}

#[test]
fn repositioned_cursor_enumerates_remaining_keys_once() {
    let mut ix = TestIndex::new();

    let count = 40i64;
    let cursor = {
        let mut t = ix.tree();
        for v in 0..count {
            t.insert(rec(v as i32 * 2), &padded_key(v, 1500), true).unwrap();
        }
        assert!(t.height().unwrap() >= 2);

        let (loc, pos) = first_pos(&t).unwrap();
        let b = t.bucket(loc).unwrap();
        TestCursor::at(
            loc,
            pos,
            b.key_at(pos).unwrap().to_owned(),
            b.slot(pos).unwrap().record(),
        )
    };
    let as_listener: Arc<dyn BucketDeletionListener> = cursor.clone();
    ix.cursors.register(&as_listener);

    let mut t = ix.tree();
    // enumerate up to the entry for value 10
    let mut seen = vec![cursor.current().unwrap().1.ofs()];
    for _ in 0..10 {
        seen.push(cursor.next(&t).unwrap().1.ofs());
    }
    assert_eq!(seen, (0..=10).map(|v| v * 2).collect::<Vec<_>>());

    // delete everything behind the cursor and well ahead of it, leaving
    // {10, 35..39}; the shrinking leaves merge and free buckets
    for v in (0..=9).chain(11..=34) {
        assert!(t.unindex(&padded_key(v, 1500), rec(v as i32 * 2)).unwrap());
    }
    check_invariants(&t);
    assert!(
        !cursor.notified.lock().is_empty(),
        "merges should have deallocated at least one bucket"
    );

    // force the repositioning path even if this cursor's own bucket
    // happened to survive as the kept merge partner
    cursor.state.lock().invalidated = true;

    let mut rest = Vec::new();
    while let Some((_, record)) = cursor.next(&t) {
        rest.push(record.ofs());
    }
    assert_eq!(rest, (35..40).map(|v| v * 2).collect::<Vec<_>>());
}
