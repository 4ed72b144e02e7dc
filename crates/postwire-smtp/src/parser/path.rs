//! Reverse-path, forward-path and mailbox grammar (RFC 5321 section 4.1.2).

use crate::error::{Error, Result};

/// Cursor over a `MAIL`/`RCPT`/`VRFY` argument.
///
/// After a successful parse, [`rest`](Self::rest) holds the unparsed tail
/// (the ESMTP parameters).
#[derive(Debug, Clone)]
pub struct PathParser<'a> {
    rest: &'a str,
}

fn malformed(what: &str) -> Error {
    Error::InvalidInput(what.to_string())
}

impl<'a> PathParser<'a> {
    /// Creates a parser over `s`.
    #[must_use]
    pub const fn new(s: &'a str) -> Self {
        Self { rest: s }
    }

    /// Returns the unparsed input.
    #[must_use]
    pub const fn rest(&self) -> &'a str {
        self.rest
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn read(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.rest = &self.rest[ch.len_utf8()..];
        Some(ch)
    }

    fn accept(&mut self, want: char) -> bool {
        if self.peek() == Some(want) {
            self.read();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        if self.accept(want) {
            return Ok(());
        }
        match self.peek() {
            Some(got) => Err(Error::InvalidInput(format!(
                "expected '{want}', got '{got}'"
            ))),
            None => Err(Error::InvalidInput(format!("expected '{want}', got EOF"))),
        }
    }

    /// Parses a reverse-path. `<>` is the null path and yields `""`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the path is malformed.
    pub fn reverse_path(&mut self) -> Result<String> {
        if let Some(rest) = self.rest.strip_prefix("<>") {
            self.rest = rest;
            return Ok(String::new());
        }
        self.path()
    }

    /// Parses a path, with or without angle brackets. A source route
    /// (`<@a,@b:user@c>`) is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the path is malformed.
    pub fn path(&mut self) -> Result<String> {
        let bracketed = self.accept('<');
        if self.accept('@') {
            let Some((_, rest)) = self.rest.split_once(':') else {
                return Err(malformed("malformed a-d-l"));
            };
            self.rest = rest;
        }
        let mailbox = self
            .mailbox()
            .map_err(|err| Error::InvalidInput(format!("in mailbox: {err}")))?;
        if bracketed {
            self.expect('>')?;
        }
        Ok(mailbox)
    }

    /// Parses `local-part@domain`.
    ///
    /// The domain runs up to the next space, tab or `>`. Quoted local parts
    /// are unquoted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if either part is empty or malformed.
    pub fn mailbox(&mut self) -> Result<String> {
        let local = self
            .local_part()
            .map_err(|err| Error::InvalidInput(format!("in local-part: {err}")))?;
        if local.is_empty() {
            return Err(malformed("local-part is empty"));
        }
        self.expect('@')?;

        let mut mailbox = local;
        mailbox.push('@');
        let domain_start = mailbox.len();
        while let Some(ch) = self.peek() {
            if matches!(ch, ' ' | '\t' | '>') {
                break;
            }
            self.read();
            mailbox.push(ch);
        }
        if mailbox.len() == domain_start {
            return Err(malformed("domain is empty"));
        }
        Ok(mailbox)
    }

    fn local_part(&mut self) -> Result<String> {
        let mut local = String::new();

        if self.accept('"') {
            loop {
                let ch = match self.read() {
                    Some('\\') => self.read(),
                    Some('"') => return Ok(local),
                    other => other,
                };
                let Some(ch) = ch else {
                    return Err(malformed("malformed quoted-string"));
                };
                local.push(ch);
            }
        }

        while let Some(ch) = self.peek() {
            match ch {
                '@' => break,
                '(' | ')' | '<' | '>' | '[' | ']' | ':' | ';' | '\\' | ',' | '"' | ' ' | '\t' => {
                    return Err(malformed("malformed dot-string"));
                }
                _ => {
                    self.read();
                    local.push(ch);
                }
            }
        }
        Ok(local)
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

    fn path(s: &str) -> Result<(String, &str)> {
        let mut p = PathParser::new(s);
        let mailbox = p.path()?;
        Ok((mailbox, p.rest()))
    }

    #[test]
    fn test_bracketed_path_with_params() {
        let (mailbox, rest) = path("<user@example.com> SIZE=100").unwrap();
        assert_eq!(mailbox, "user@example.com");
        assert_eq!(rest, " SIZE=100");
    }

    #[test]
    fn test_bare_path() {
        let (mailbox, rest) = path("user@example.com").unwrap();
        assert_eq!(mailbox, "user@example.com");
        assert_eq!(rest, "");
    }

    #[test]
    fn test_source_route_skipped() {
        let (mailbox, _) = path("<@relay.one,@relay.two:joe@example.org>").unwrap();
        assert_eq!(mailbox, "joe@example.org");
        assert!(path("<@relay.one joe@example.org>").is_err());
    }

    #[test]
    fn test_quoted_local_part() {
        let (mailbox, _) = path(r#"<"john \"j\" doe"@example.com>"#).unwrap();
        assert_eq!(mailbox, r#"john "j" doe@example.com"#);
        assert!(path(r#"<"unterminated@example.com>"#).is_err());
    }

    #[test]
    fn test_utf8_mailbox() {
        let (mailbox, _) = path("<δοκιμή@παράδειγμα.δοκιμή>").unwrap();
        assert_eq!(mailbox, "δοκιμή@παράδειγμα.δοκιμή");
    }

    #[test]
    fn test_malformed_paths() {
        assert!(path("<>").is_err());
        assert!(path("<@>").is_err());
        assert!(path("<user>").is_err());
        assert!(path("<user@>").is_err());
        assert!(path("<us er@example.com>").is_err());
        assert!(path("<user@example.com").is_err());
    }

    #[test]
    fn test_reverse_path_null() {
        let mut p = PathParser::new("<> BODY=8BITMIME");
        assert_eq!(p.reverse_path().unwrap(), "");
        assert_eq!(p.rest(), " BODY=8BITMIME");
    }

    #[test]
    fn test_mailbox_alone() {
        let mut p = PathParser::new("admin@example.com");
        assert_eq!(p.mailbox().unwrap(), "admin@example.com");
        assert_eq!(p.rest(), "");
    }
}
