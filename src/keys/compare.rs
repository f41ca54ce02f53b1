//! # Key Comparison
//!
//! Two comparators operate over composite keys:
//!
//! 1. [`compare_keys`] — the total order every bucket is sorted under.
//!    Element-wise, with a per-field ascending/descending mask applied at
//!    comparison time. Keys are stored in field order regardless of
//!    direction; only the comparison flips.
//!
//! 2. [`custom_key_cmp`] — the partial comparator used to seek range-scan
//!    endpoints. The first `r_begin_len` fields of the target are compared
//!    exactly; the remaining fields compare against per-position endpoint
//!    elements with per-position inclusivity, and the `r_sup` flag makes
//!    the target act as +∞/−∞ past the prefix.
//!
//! The direction mask assumes a compound index never has more fields than
//! the mask has bits; [`KeyOrdering::make`] rejects wider patterns.

use std::cmp::Ordering;

use eyre::{ensure, Result};

use super::document::{Element, KeyRef};

/// The indexed fields and their directions, as declared by the index:
/// `(name, direction)` with `direction > 0` ascending, `< 0` descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    fields: Vec<(String, i32)>,
}

impl KeyPattern {
    pub fn new(fields: Vec<(String, i32)>) -> KeyPattern {
        KeyPattern { fields }
    }

    /// Convenience for the common all-ascending case.
    pub fn ascending(names: &[&str]) -> KeyPattern {
        KeyPattern {
            fields: names.iter().map(|n| (n.to_string(), 1)).collect(),
        }
    }

    pub fn fields(&self) -> &[(String, i32)] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// Per-field direction mask: bit `i` set means field `i` sorts descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOrdering {
    descending: u32,
}

impl KeyOrdering {
    /// All fields ascending.
    pub const ASCENDING: KeyOrdering = KeyOrdering { descending: 0 };

    pub fn make(pattern: &KeyPattern) -> Result<KeyOrdering> {
        ensure!(
            pattern.field_count() <= 32,
            "compound index has {} fields, direction mask supports 32",
            pattern.field_count()
        );
        let mut descending = 0u32;
        for (i, (_, dir)) in pattern.fields().iter().enumerate() {
            if *dir < 0 {
                descending |= 1 << i;
            }
        }
        Ok(KeyOrdering { descending })
    }

    pub fn descending(&self, mask: u32) -> bool {
        self.descending & mask != 0
    }
}

/// Total order over whole keys under `order`. Equal prefixes of unequal
/// arity put the shorter key first; keys within one index share the
/// pattern's arity, so that branch only orders degenerate inputs.
pub fn compare_keys(l: KeyRef<'_>, r: KeyRef<'_>, order: &KeyOrdering) -> Ordering {
    let mut ll = l.elements();
    let mut rr = r.elements();
    let mut mask = 1u32;
    loop {
        match (ll.next(), rr.next()) {
            (Some(a), Some(b)) => {
                let mut x = a.compare(&b);
                if order.descending(mask) {
                    x = x.reverse();
                }
                if x != Ordering::Equal {
                    return x;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
        mask = mask.wrapping_shl(1);
    }
}

/// Compare a stored key `l` against a range-scan target.
///
/// The target is `(r_begin, r_begin_len, r_sup, r_end, r_end_inclusive)`:
/// the first `r_begin_len` elements of `r_begin` are matched exactly; if
/// `r_sup` is set the target is strictly past that prefix (+∞ forward,
/// −∞ reverse) and the trailing fields are not consulted; otherwise each
/// remaining element of `l` compares against `r_end[i]`. An equal element
/// at a non-inclusive position places the stored key before (forward) or
/// after (reverse) the target, so the seek skips keys at the bound.
///
/// `r_end` and `r_end_inclusive` are full-arity slices; the first
/// `r_begin_len` positions are not consulted. Returns the usual `<0`, `0`,
/// `>0`.
pub fn custom_key_cmp(
    l: KeyRef<'_>,
    r_begin: KeyRef<'_>,
    r_begin_len: usize,
    r_sup: bool,
    r_end: &[Element<'_>],
    r_end_inclusive: &[bool],
    order: &KeyOrdering,
    direction: i32,
) -> i32 {
    let mut ll = l.elements();
    let mut rr = r_begin.elements();
    let mut mask = 1u32;

    for _ in 0..r_begin_len {
        let (Some(a), Some(b)) = (ll.next(), rr.next()) else {
            return 0;
        };
        let mut x = element_cmp_i32(&a, &b);
        if order.descending(mask) {
            x = -x;
        }
        if x != 0 {
            return x;
        }
        mask = mask.wrapping_shl(1);
    }

    if r_sup {
        return -direction;
    }

    let mut i = r_begin_len;
    for a in ll {
        let b = &r_end[i];
        let mut x = element_cmp_i32(&a, b);
        if order.descending(mask) {
            x = -x;
        }
        if x != 0 {
            return x;
        }
        if !r_end_inclusive[i] {
            return -direction;
        }
        i += 1;
        mask = mask.wrapping_shl(1);
    }
    0
}

fn element_cmp_i32(a: &Element<'_>, b: &Element<'_>) -> i32 {
    match a.compare(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}
