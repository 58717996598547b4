//! Extraction of media identifiers from request targets.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use once_cell::sync::Lazy;
use regex::Regex;

/// Number of characters in a media identifier.
pub const ID_LENGTH: usize = 11;

/// An optional `/` or `?v=` followed by the identifier, anchored at the end of the target.
static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/|\?v=)?([A-Za-z0-9_-]{11})$").expect("identifier pattern is valid")
});

/// The 11-character token naming a cacheable resource.
///
/// Identifiers only contain `[A-Za-z0-9_-]`, so they are safe to use as file names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaId(String);

impl MediaId {
    /// Validates `id` as a complete identifier.
    pub fn new(id: &str) -> Option<Self> {
        let valid = id.len() == ID_LENGTH
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        valid.then(|| Self(id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for MediaId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MediaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for MediaId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the media identifier from a request.
///
/// Only `GET` requests are accepted. `target` is the raw request target (path and query), it is
/// neither percent-decoded nor case-folded. The identifier is the last 11 characters of the target
/// if they are all drawn from `[A-Za-z0-9_-]`.
pub fn extract(method: &str, target: &str) -> Option<MediaId> {
    if method != "GET" {
        return None;
    }
    let captures = ID_PATTERN.captures(target)?;
    Some(MediaId(captures[1].to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path() {
        let id = extract("GET", "/dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_watch_query() {
        let id = extract("GET", "/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_trailing_identifier_after_other_segments() {
        let id = extract("GET", "/some/nested/path/abc_def-123").unwrap();
        assert_eq!(id.as_str(), "abc_def-123");

        // the prefix is optional, any 11 trailing characters from the alphabet match
        let id = extract("GET", "/prefixdQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_rejects_malformed_targets() {
        assert_eq!(extract("GET", "/"), None);
        assert_eq!(extract("GET", "/short"), None);
        assert_eq!(extract("GET", "/dQw4w9WgXc!"), None);
        assert_eq!(extract("GET", "/dQw4w9WgXcQ/"), None);
        assert_eq!(extract("GET", "/dQw4w9WgXcQ?x=1"), None);
        // no percent-decoding
        assert_eq!(extract("GET", "/dQw4w9WgX%51"), None);
    }

    #[test]
    fn test_only_get() {
        for method in ["POST", "PUT", "HEAD", "DELETE", "get"] {
            assert_eq!(extract(method, "/dQw4w9WgXcQ"), None, "{method}");
        }
    }

    #[test]
    fn test_case_sensitive() {
        let id = extract("GET", "/DQW4W9WGXCQ").unwrap();
        assert_ne!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_media_id_validation() {
        assert!(MediaId::new("abcdefghijk").is_some());
        assert!(MediaId::new("abcdefghij").is_none());
        assert!(MediaId::new("abcdefghijkl").is_none());
        assert!(MediaId::new("abcdefghij/").is_none());
        assert!(MediaId::new("..abcdefghi").is_none());
    }
}
