use crate::CoreError;
use regex::bytes::Regex;
use std::fmt;
use std::ops::Range;

/// Something to look for in raw console output.
///
/// The console has no structured acknowledgements, so every synchronisation
/// point is expressed as either a literal substring or a regular expression
/// evaluated against the bytes received so far.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// Compile a regular expression pattern.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidPattern` if the expression does not compile.
    pub fn regex(expr: &str) -> Result<Self, CoreError> {
        Regex::new(expr)
            .map(Self::Regex)
            .map_err(|source| CoreError::InvalidPattern {
                pattern: expr.to_string(),
                source,
            })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Literal(text) => text,
            Pattern::Regex(re) => re.as_str(),
        }
    }

    /// Locate the first occurrence of the pattern in `haystack`.
    #[must_use]
    pub fn find(&self, haystack: &[u8]) -> Option<Range<usize>> {
        match self {
            Pattern::Literal(text) => find_literal(haystack, text.as_bytes()),
            Pattern::Regex(re) => re.find(haystack).map(|m| m.range()),
        }
    }

    #[must_use]
    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.find(haystack).is_some()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Pattern::Literal(a), Pattern::Literal(b)) => a == b,
            (Pattern::Regex(a), Pattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "{text:?}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}

impl From<String> for Pattern {
    fn from(text: String) -> Self {
        Self::Literal(text)
    }
}

/// Find the earliest match among `patterns`.
///
/// Returns the index of the winning pattern and the matched byte range. When
/// two patterns match, the one whose match ends first wins; ties go to the
/// pattern listed first.
#[must_use]
pub fn find_first(patterns: &[Pattern], haystack: &[u8]) -> Option<(usize, Range<usize>)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(idx, pattern)| pattern.find(haystack).map(|range| (idx, range)))
        .min_by_key(|(idx, range)| (range.end, *idx))
}

fn find_literal(haystack: &[u8], needle: &[u8]) -> Option<Range<usize>> {
    if needle.is_empty() {
        return Some(0..0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|start| start..start + needle.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_find() {
        let pattern = Pattern::literal("login:");
        assert_eq!(pattern.find(b"\r\nswitch (ttyu0)\r\n\r\nlogin: "), Some(20..26));
        assert!(pattern.find(b"Booting kernel").is_none());
    }

    #[test]
    fn test_literal_longer_than_haystack() {
        assert!(Pattern::literal("Retype new password:").find(b"New").is_none());
    }

    #[test]
    fn test_regex_find() {
        let pattern = Pattern::regex(r"root@[^:]*:~ # ").unwrap();
        assert!(pattern.is_match(b"\r\nroot@:~ # "));
        assert_eq!(pattern.to_string(), "/root@[^:]*:~ # /");
    }

    #[test]
    fn test_invalid_regex() {
        let err = Pattern::regex("(unclosed").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPattern { .. }));
    }

    #[test]
    fn test_find_first_prefers_earliest_match() {
        let patterns = vec![Pattern::literal("#"), Pattern::literal(">")];
        let hit = find_first(&patterns, b"root> show # ");
        assert_eq!(hit, Some((1, 4..5)));
    }

    #[test]
    fn test_pattern_equality() {
        assert_eq!(Pattern::from("#"), Pattern::literal("#"));
        assert_ne!(Pattern::literal("#"), Pattern::regex("#").unwrap());
    }
}
