//! Capability table negotiated by `EHLO`.

use std::collections::HashMap;

/// Extensions advertised by a server, keyed by uppercase keyword.
///
/// Each entry holds the parameter text after the keyword, empty if none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: HashMap<String, String>,
}

impl Extensions {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the lines of an `EHLO` reply.
    ///
    /// The first line is the greeting text; every later line is
    /// `KEYWORD[ parameters]`.
    #[must_use]
    pub fn from_ehlo(lines: &[String]) -> Self {
        let mut extensions = Self::new();
        for line in lines.iter().skip(1) {
            match line.split_once(' ') {
                Some((keyword, params)) => extensions.insert(keyword, params),
                None => extensions.insert(line, ""),
            }
        }
        extensions
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, keyword: &str, params: &str) {
        self.entries
            .insert(keyword.to_ascii_uppercase(), params.to_string());
    }

    /// Returns the parameters of `keyword`, case-insensitively.
    #[must_use]
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.entries
            .get(&keyword.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Returns true if `keyword` is advertised.
    #[must_use]
    pub fn contains(&self, keyword: &str) -> bool {
        self.get(keyword).is_some()
    }

    /// Returns true if the `AUTH` entry lists `mechanism`.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.get("AUTH").is_some_and(|mechanisms| {
            mechanisms
                .split(' ')
                .any(|m| m.eq_ignore_ascii_case(mechanism))
        })
    }

    /// Returns the `SIZE` limit. `Some(0)` means no limit.
    ///
    /// `None` when `SIZE` is absent or carries no number.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.get("SIZE").and_then(|size| size.parse().ok())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn ehlo(lines: &[&str]) -> Extensions {
        let lines: Vec<String> = lines.iter().map(|s| (*s).to_string()).collect();
        Extensions::from_ehlo(&lines)
    }

    #[test]
    fn test_skips_greeting_line() {
        let ext = ehlo(&["mx.example.com Hello", "PIPELINING", "SIZE 35882577"]);
        assert_eq!(ext.len(), 2);
        assert!(ext.contains("pipelining"));
        assert!(!ext.contains("MX.EXAMPLE.COM"));
    }

    #[test]
    fn test_parameters() {
        let ext = ehlo(&["hi", "AUTH PLAIN LOGIN", "SIZE 1000", "LIMITS RCPTMAX=10"]);
        assert_eq!(ext.get("AUTH"), Some("PLAIN LOGIN"));
        assert_eq!(ext.get("limits"), Some("RCPTMAX=10"));
        assert!(ext.supports_auth("login"));
        assert!(!ext.supports_auth("XOAUTH2"));
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(ehlo(&["hi", "SIZE 1000"]).max_message_size(), Some(1000));
        assert_eq!(ehlo(&["hi", "SIZE"]).max_message_size(), None);
        assert_eq!(ehlo(&["hi", "SIZE -5"]).max_message_size(), None);
        assert_eq!(ehlo(&["hi"]).max_message_size(), None);
    }

    #[test]
    fn test_greeting_only() {
        assert!(ehlo(&["hi"]).is_empty());
    }
}
