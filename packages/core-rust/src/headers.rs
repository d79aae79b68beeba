//! Ordered request header set decoded from an SCGI header block.

use std::collections::HashMap;

use serde::ser::{Serialize, Serializer};

/// Name of the header carrying the request body length.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";

/// Ordered mapping of header names to values.
///
/// Keys keep the position of their first insertion. Inserting a key that is
/// already present replaces its value in place, so a header block with
/// duplicate keys resolves to the last value sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl HeaderSet {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, returning the previous value if the key was present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        if let Some(&slot) = self.index.get(&name) {
            return Some(std::mem::replace(&mut self.entries[slot].1, value));
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, value));
        None
    }

    /// Looks up a header value by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(name)
            .map(|&slot| self.entries[slot].1.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Body length announced by `CONTENT_LENGTH`.
    ///
    /// Only the leading decimal digits count, so `"12abc"` is 12. Absent,
    /// non-numeric and negative values yield 0.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.get(CONTENT_LENGTH).map_or(0, leading_integer)
    }
}

/// Leading integer of `raw` after optional whitespace and sign, saturating
/// on overflow. Negative values clamp to 0.
fn leading_integer(raw: &str) -> usize {
    let raw = raw.trim_start();
    let digits = match raw.as_bytes().first() {
        Some(b'-') => return 0,
        Some(b'+') => &raw[1..],
        _ => raw,
    };
    digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0usize, |n, d| {
            n.saturating_mul(10).saturating_add(usize::from(d - b'0'))
        })
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

impl Serialize for HeaderSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}
