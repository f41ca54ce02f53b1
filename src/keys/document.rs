//! # Composite Key Documents
//!
//! Index keys are small self-describing documents: a flat sequence of typed
//! elements, one per indexed field, encoded into a single byte string whose
//! total length is carried in a prefix. A key read from a bucket page is
//! therefore self-delimiting; the page only stores its starting offset.
//!
//! ## Encoding
//!
//! ```text
//! key        := total_len:u16 LE  element*
//! element    := tag:u8 payload
//!
//! tag   payload
//! 0x00  MinKey   (none)
//! 0x08  Null     (none)
//! 0x10  Bool     1 byte
//! 0x20  Int      8-byte LE i64
//! 0x28  Float    8-byte LE f64
//! 0x30  Text     len:u16 LE + UTF-8 bytes
//! 0x38  Blob     len:u16 LE + bytes
//! 0xFF  MaxKey   (none)
//! ```
//!
//! Keys are compared element-wise (see [`crate::keys::compare`]), never by
//! memcmp, because the per-field direction mask applies at comparison time.
//! `total_len` includes the two prefix bytes, so an empty document encodes
//! as `02 00`.
//!
//! ## Ownership
//!
//! [`KeyRef`] is a validated borrowed view, usually pointing straight into
//! a mapped page. [`IndexKey`] owns its bytes; it is what crosses page
//! mutations (a `KeyRef` into a page must never be held across an operation
//! that may repack or split that page). [`KeyBuilder`] constructs keys
//! field by field.

use std::cmp::Ordering;
use std::fmt;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

mod tag {
    pub const MIN_KEY: u8 = 0x00;
    pub const NULL: u8 = 0x08;
    pub const BOOL: u8 = 0x10;
    pub const INT: u8 = 0x20;
    pub const FLOAT: u8 = 0x28;
    pub const TEXT: u8 = 0x30;
    pub const BLOB: u8 = 0x38;
    pub const MAX_KEY: u8 = 0xFF;
}

/// One field value of a composite key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element<'a> {
    MinKey,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(&'a str),
    Blob(&'a [u8]),
    MaxKey,
}

impl Element<'_> {
    /// Canonical type class. Distinct classes order by this value; numbers
    /// share a class and compare numerically across Int/Float.
    fn canon(&self) -> u8 {
        match self {
            Element::MinKey => 0,
            Element::Null => 1,
            Element::Bool(_) => 2,
            Element::Int(_) | Element::Float(_) => 3,
            Element::Text(_) => 4,
            Element::Blob(_) => 5,
            Element::MaxKey => 255,
        }
    }

    /// Total order over single elements, before any direction mask applies.
    pub fn compare(&self, other: &Element<'_>) -> Ordering {
        let (lc, rc) = (self.canon(), other.canon());
        if lc != rc {
            return lc.cmp(&rc);
        }
        match (self, other) {
            (Element::Bool(a), Element::Bool(b)) => a.cmp(b),
            (Element::Int(a), Element::Int(b)) => a.cmp(b),
            (Element::Float(a), Element::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Element::Int(a), Element::Float(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Element::Float(a), Element::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Element::Text(a), Element::Text(b)) => a.cmp(b),
            (Element::Blob(a), Element::Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for Element<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::MinKey => write!(f, "MinKey"),
            Element::Null => write!(f, "null"),
            Element::Bool(b) => write!(f, "{}", b),
            Element::Int(i) => write!(f, "{}", i),
            Element::Float(x) => write!(f, "{}", x),
            Element::Text(s) => write!(f, "\"{}\"", s),
            Element::Blob(b) => write!(f, "blob({} bytes)", b.len()),
            Element::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// A validated borrowed view of an encoded key. Construction via
/// [`KeyRef::parse`] checks the whole structure, so element iteration is
/// infallible afterwards.
#[derive(Clone, Copy)]
pub struct KeyRef<'a> {
    data: &'a [u8],
}

impl<'a> KeyRef<'a> {
    /// Parse a key starting at the beginning of `data`, trimming the view
    /// to the key's own length. `data` may extend past the key (it usually
    /// is the tail of a page).
    pub fn parse(data: &'a [u8]) -> Result<KeyRef<'a>> {
        ensure!(data.len() >= 2, "key truncated: {} bytes", data.len());
        let total = u16::from_le_bytes([data[0], data[1]]) as usize;
        ensure!(
            total >= 2 && total <= data.len(),
            "key length {} out of range (have {})",
            total,
            data.len()
        );
        let data = &data[..total];
        // validate every element so iteration cannot fail later
        let mut at = 2;
        while at < total {
            at = skip_element(data, at)?;
        }
        Ok(KeyRef { data })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Encoded size in bytes, length prefix included.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn elements(&self) -> ElementIter<'a> {
        ElementIter {
            data: self.data,
            at: 2,
        }
    }

    pub fn element_count(&self) -> usize {
        self.elements().count()
    }

    /// All elements, parsed up front. Range-endpoint comparison needs
    /// indexed access.
    pub fn parsed(&self) -> SmallVec<[Element<'a>; 8]> {
        self.elements().collect()
    }

    pub fn to_owned(&self) -> IndexKey {
        IndexKey {
            bytes: self.data.to_vec(),
        }
    }
}

impl fmt::Debug for KeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for KeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, e) in self.elements().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, " }}")
    }
}

fn skip_element(data: &[u8], at: usize) -> Result<usize> {
    let t = data[at];
    let body = at + 1;
    let end = match t {
        tag::MIN_KEY | tag::NULL | tag::MAX_KEY => body,
        tag::BOOL => body + 1,
        tag::INT | tag::FLOAT => body + 8,
        tag::TEXT | tag::BLOB => {
            ensure!(body + 2 <= data.len(), "key element length truncated");
            let len = u16::from_le_bytes([data[body], data[body + 1]]) as usize;
            let end = body + 2 + len;
            ensure!(end <= data.len(), "key element overruns key bytes");
            if t == tag::TEXT {
                ensure!(
                    std::str::from_utf8(&data[body + 2..end]).is_ok(),
                    "key text element is not UTF-8"
                );
            }
            end
        }
        other => bail!("unknown key element tag {:#04x}", other),
    };
    ensure!(end <= data.len(), "key element overruns key bytes");
    Ok(end)
}

pub struct ElementIter<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Element<'a>;

    fn next(&mut self) -> Option<Element<'a>> {
        if self.at >= self.data.len() {
            return None;
        }
        let d = self.data;
        let t = d[self.at];
        let body = self.at + 1;
        // structure was validated by KeyRef::parse
        let (elem, end) = match t {
            tag::MIN_KEY => (Element::MinKey, body),
            tag::NULL => (Element::Null, body),
            tag::MAX_KEY => (Element::MaxKey, body),
            tag::BOOL => (Element::Bool(d[body] != 0), body + 1),
            tag::INT => (
                Element::Int(i64::from_le_bytes(d[body..body + 8].try_into().unwrap())),
                body + 8,
            ),
            tag::FLOAT => (
                Element::Float(f64::from_le_bytes(d[body..body + 8].try_into().unwrap())),
                body + 8,
            ),
            tag::TEXT | tag::BLOB => {
                let len = u16::from_le_bytes([d[body], d[body + 1]]) as usize;
                let bytes = &d[body + 2..body + 2 + len];
                let elem = if t == tag::TEXT {
                    Element::Text(std::str::from_utf8(bytes).unwrap())
                } else {
                    Element::Blob(bytes)
                };
                (elem, body + 2 + len)
            }
            _ => unreachable!("tag validated at parse"),
        };
        self.at = end;
        Some(elem)
    }
}

/// An owned encoded key.
#[derive(Clone, PartialEq, Eq)]
pub struct IndexKey {
    bytes: Vec<u8>,
}

impl IndexKey {
    /// Wrap already-encoded bytes, validating the structure.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<IndexKey> {
        let r = KeyRef::parse(&bytes)?;
        ensure!(
            r.size() == bytes.len(),
            "trailing bytes after encoded key ({} of {})",
            r.size(),
            bytes.len()
        );
        Ok(IndexKey { bytes })
    }

    pub fn as_ref(&self) -> KeyRef<'_> {
        // bytes were validated at construction
        KeyRef { data: &self.bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_ref(), f)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_ref(), f)
    }
}

/// Builds an [`IndexKey`] field by field.
///
/// ```ignore
/// let key = KeyBuilder::new().int(5).text("abc").finish();
/// ```
pub struct KeyBuilder {
    buf: SmallVec<[u8; 64]>,
}

impl KeyBuilder {
    pub fn new() -> KeyBuilder {
        let mut buf = SmallVec::new();
        buf.extend_from_slice(&[0, 0]); // length prefix, patched in finish()
        KeyBuilder { buf }
    }

    pub fn min_key(mut self) -> Self {
        self.buf.push(tag::MIN_KEY);
        self
    }

    pub fn null(mut self) -> Self {
        self.buf.push(tag::NULL);
        self
    }

    pub fn max_key(mut self) -> Self {
        self.buf.push(tag::MAX_KEY);
        self
    }

    pub fn bool(mut self, v: bool) -> Self {
        self.buf.push(tag::BOOL);
        self.buf.push(v as u8);
        self
    }

    pub fn int(mut self, v: i64) -> Self {
        self.buf.push(tag::INT);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn float(mut self, v: f64) -> Self {
        self.buf.push(tag::FLOAT);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn text(mut self, v: &str) -> Self {
        self.buf.push(tag::TEXT);
        self.buf
            .extend_from_slice(&(v.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn blob(mut self, v: &[u8]) -> Self {
        self.buf.push(tag::BLOB);
        self.buf
            .extend_from_slice(&(v.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(v);
        self
    }

    pub fn finish(mut self) -> IndexKey {
        let total = self.buf.len() as u16;
        self.buf[..2].copy_from_slice(&total.to_le_bytes());
        IndexKey {
            bytes: self.buf.into_vec(),
        }
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        KeyBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_two_bytes() {
        let k = KeyBuilder::new().finish();
        assert_eq!(k.as_bytes(), &[2, 0]);
        assert_eq!(k.as_ref().element_count(), 0);
    }

    #[test]
    fn round_trip_all_element_types() {
        let k = KeyBuilder::new()
            .min_key()
            .null()
            .bool(true)
            .int(-42)
            .float(2.5)
            .text("hi")
            .blob(&[1, 2, 3])
            .max_key()
            .finish();

        let elems: Vec<_> = k.as_ref().elements().collect();
        assert_eq!(
            elems,
            vec![
                Element::MinKey,
                Element::Null,
                Element::Bool(true),
                Element::Int(-42),
                Element::Float(2.5),
                Element::Text("hi"),
                Element::Blob(&[1, 2, 3]),
                Element::MaxKey,
            ]
        );
    }

    #[test]
    fn parse_trims_to_key_length() {
        let k = KeyBuilder::new().int(7).finish();
        let mut page = k.as_bytes().to_vec();
        page.extend_from_slice(&[0xAB; 32]);

        let r = KeyRef::parse(&page).unwrap();
        assert_eq!(r.size(), k.size());
        assert_eq!(r.as_bytes(), k.as_bytes());
    }

    #[test]
    fn parse_rejects_truncation_and_bad_tags() {
        assert!(KeyRef::parse(&[2]).is_err());
        assert!(KeyRef::parse(&[9, 0, 0x20, 1, 2]).is_err()); // int body cut short
        assert!(KeyRef::parse(&[3, 0, 0x77]).is_err()); // unknown tag
    }

    #[test]
    fn element_order_across_classes() {
        let cases = [
            (Element::MinKey, Element::Null),
            (Element::Null, Element::Bool(false)),
            (Element::Bool(true), Element::Int(0)),
            (Element::Int(9), Element::Text("")),
            (Element::Text("z"), Element::Blob(b"a")),
            (Element::Blob(b"z"), Element::MaxKey),
        ];
        for (a, b) in cases {
            assert_eq!(a.compare(&b), Ordering::Less, "{} < {}", a, b);
        }
    }

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert_eq!(Element::Int(2).compare(&Element::Float(2.0)), Ordering::Equal);
        assert_eq!(Element::Int(2).compare(&Element::Float(2.5)), Ordering::Less);
        assert_eq!(
            Element::Float(-0.5).compare(&Element::Int(-1)),
            Ordering::Greater
        );
    }

    #[test]
    fn display_formats_as_document() {
        let k = KeyBuilder::new().int(5).text("ab").finish();
        assert_eq!(format!("{}", k), "{ 5, \"ab\" }");
    }
}
