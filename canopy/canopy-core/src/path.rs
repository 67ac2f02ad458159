//! Logical paths and their mapping onto store keys.
//!
//! Application code addresses the tree with arbitrary string segments. The
//! store reserves a handful of characters in its key syntax, so every segment
//! is percent-escaped on the way in and unescaped on the way out. This module
//! is the only place that knows about the store-native key syntax.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::PathError;

const SEPARATOR: char = '/';
const ESCAPE: char = '%';

/// Longest encoded segment the store accepts.
pub const MAX_SEGMENT_BYTES: usize = 768;

/// An ordered sequence of segments identifying a location in the tree.
/// The empty sequence is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalPath {
    segments: Vec<String>,
}

impl LogicalPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Concatenates `other` onto this path, e.g. a document path and a field
    /// path within that document.
    pub fn join(&self, other: &LogicalPath) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + other.segments.len());
        segments.extend(self.segments.iter().cloned());
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl<const N: usize> From<[&str; N]> for LogicalPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for LogicalPath {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl From<&[String]> for LogicalPath {
    fn from(segments: &[String]) -> Self {
        Self::new(segments.iter().cloned())
    }
}

impl From<Vec<String>> for LogicalPath {
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl From<Vec<&str>> for LogicalPath {
    fn from(segments: Vec<&str>) -> Self {
        Self::new(segments)
    }
}

impl From<&LogicalPath> for LogicalPath {
    fn from(path: &LogicalPath) -> Self {
        path.clone()
    }
}

fn is_reserved(c: char) -> bool {
    matches!(c, '%' | '.' | '#' | '$' | '[' | ']' | '/') || c.is_ascii_control()
}

/// Escapes a single segment so it is safe as one store key component.
pub fn encode_segment(segment: &str) -> Result<String, PathError> {
    encode_segment_at(segment, 0)
}

fn encode_segment_at(segment: &str, index: usize) -> Result<String, PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment { index });
    }
    let encoded = if segment.chars().any(is_reserved) {
        let mut out = String::with_capacity(segment.len() + 8);
        for c in segment.chars() {
            if is_reserved(c) {
                // reserved characters are all ASCII
                out.push(ESCAPE);
                out.push_str(&format!("{:02X}", c as u32));
            } else {
                out.push(c);
            }
        }
        out
    } else {
        segment.to_string()
    };
    if encoded.len() > MAX_SEGMENT_BYTES {
        return Err(PathError::SegmentTooLong {
            index,
            len: encoded.len(),
            max: MAX_SEGMENT_BYTES,
        });
    }
    Ok(encoded)
}

/// Encodes a full logical path into a store key. The root is the empty key.
pub fn encode(path: &LogicalPath) -> Result<String, PathError> {
    let mut parts = Vec::with_capacity(path.len());
    for (index, segment) in path.segments().iter().enumerate() {
        parts.push(encode_segment_at(segment, index)?);
    }
    Ok(parts.join(&SEPARATOR.to_string()))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes one store key component back into the application segment.
/// Malformed escapes are passed through untouched.
pub fn decode(key_segment: &str) -> String {
    if !key_segment.contains(ESCAPE) {
        return key_segment.to_string();
    }
    let bytes = key_segment.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    // `%XX` escapes only ever stand for ASCII, so this cannot split a code point
    // unless the input was not produced by `encode_segment`.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Splits a full store key and decodes every component.
pub fn decode_key(key: &str) -> LogicalPath {
    if key.is_empty() {
        return LogicalPath::root();
    }
    LogicalPath::new(key.split(SEPARATOR).map(decode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_segments_are_untouched() {
        let path = LogicalPath::from(["docs", "a", "x"]);
        assert_eq!(encode(&path).unwrap(), "docs/a/x");
        assert_eq!(decode_key("docs/a/x"), path);
    }

    #[test]
    fn reserved_characters_round_trip() {
        let path = LogicalPath::from(["user@example.com", "a/b", "50%", "[#$]", "tab\there"]);
        let key = encode(&path).unwrap();
        assert_eq!(key, "user@example%2Ecom/a%2Fb/50%25/%5B%23%24%5D/tab%09here");
        assert_eq!(decode_key(&key), path);
    }

    #[test]
    fn unicode_round_trips() {
        let path = LogicalPath::from(["größe", "日本.語"]);
        let key = encode(&path).unwrap();
        assert_eq!(decode_key(&key), path);
    }

    #[test]
    fn root_encodes_to_empty_key() {
        assert_eq!(encode(&LogicalPath::root()).unwrap(), "");
        assert!(decode_key("").is_root());
    }

    #[test]
    fn empty_segment_is_rejected() {
        let path = LogicalPath::from(["docs", "", "x"]);
        assert_eq!(encode(&path), Err(PathError::EmptySegment { index: 1 }));
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let long = ".".repeat(300);
        let err = encode_segment(&long).unwrap_err();
        assert!(matches!(err, PathError::SegmentTooLong { len: 900, .. }));
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(decode("100%"), "100%");
        assert_eq!(decode("%zz"), "%zz");
        assert_eq!(decode("a%2"), "a%2");
    }

    #[test]
    fn join_and_display() {
        let doc = LogicalPath::from(["docs", "a"]);
        let field = LogicalPath::from(["x"]);
        assert_eq!(doc.join(&field), LogicalPath::from(["docs", "a", "x"]));
        assert_eq!(doc.join(&field).to_string(), "/docs/a/x");
        assert_eq!(LogicalPath::root().to_string(), "/");
    }
}
