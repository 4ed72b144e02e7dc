//! Protocol status: reply code, enhanced code and message.

use std::borrow::Cow;
use std::fmt;

use super::ReplyCode;

/// Enhanced status code (RFC 2034/3463), `class.subject.detail`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EnhancedCode {
    /// Not provided. Rendered as `class.0.0` for 2xx, 4xx and 5xx replies.
    #[default]
    NotSet,
    /// Never rendered, for replies that must not carry one (greeting, 334, 354).
    Omitted,
    /// An explicit triple.
    Code(u16, u16, u16),
}

impl EnhancedCode {
    /// Creates an explicit enhanced code.
    #[must_use]
    pub const fn new(class: u16, subject: u16, detail: u16) -> Self {
        Self::Code(class, subject, detail)
    }

    /// Parses `X.Y.Z` text. Returns `None` if the text is not a triple.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::Code(class, subject, detail))
    }

    /// Resolves the triple to render for a reply `code`.
    #[must_use]
    pub const fn resolve(self, code: ReplyCode) -> Option<(u16, u16, u16)> {
        match self {
            Self::Code(class, subject, detail) => Some((class, subject, detail)),
            Self::Omitted => None,
            Self::NotSet => match code.as_u16() / 100 {
                class @ (2 | 4 | 5) => Some((class, 0, 0)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(class, subject, detail) => write!(f, "{class}.{subject}.{detail}"),
            Self::NotSet => write!(f, "not set"),
            Self::Omitted => write!(f, "omitted"),
        }
    }
}

/// Protocol status carried between layers and written to the peer.
///
/// The message may span several lines joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Three-digit reply code.
    pub code: ReplyCode,
    /// Enhanced status code.
    pub enhanced: EnhancedCode,
    /// Human-readable text.
    pub message: Cow<'static, str>,
}

impl Status {
    /// Creates a status.
    #[must_use]
    pub fn new(code: u16, enhanced: EnhancedCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ReplyCode::new(code),
            enhanced,
            message: message.into(),
        }
    }

    const fn fixed(code: u16, enhanced: EnhancedCode, message: &'static str) -> Self {
        Self {
            code: ReplyCode::new(code),
            enhanced,
            message: Cow::Borrowed(message),
        }
    }

    /// The client sent `RSET` instead of the next `BDAT` chunk.
    pub const RESET: Self = Self::fixed(250, EnhancedCode::new(2, 0, 0), "Session reset");
    /// Default answer to `VRFY`.
    pub const VRFY: Self = Self::fixed(
        252,
        EnhancedCode::new(2, 5, 0),
        "Cannot VRFY user, but will accept message",
    );
    /// Answer to `NOOP`.
    pub const NOOP: Self = Self::fixed(
        250,
        EnhancedCode::new(2, 0, 0),
        "I have successfully done nothing",
    );
    /// The client sent `QUIT`.
    pub const QUIT: Self = Self::fixed(221, EnhancedCode::new(2, 0, 0), "Bye");
    /// A connection-level failure.
    pub const ERR_CONNECTION: Self =
        Self::fixed(421, EnhancedCode::new(4, 4, 0), "Connection error, sorry");
    /// The message exceeds the configured maximum size.
    pub const ERR_DATA_TOO_LARGE: Self = Self::fixed(
        552,
        EnhancedCode::new(5, 3, 4),
        "Maximum message size exceeded",
    );
    /// Credentials were rejected.
    pub const ERR_AUTH_FAILED: Self =
        Self::fixed(535, EnhancedCode::new(5, 7, 8), "Authentication failed");
    /// Authentication is required first.
    pub const ERR_AUTH_REQUIRED: Self =
        Self::fixed(530, EnhancedCode::new(5, 7, 0), "Authentication required");
    /// The server offers no authentication.
    pub const ERR_AUTH_UNSUPPORTED: Self = Self::fixed(
        502,
        EnhancedCode::new(5, 7, 0),
        "Authentication not supported",
    );
    /// The requested mechanism is not offered.
    pub const ERR_AUTH_UNKNOWN_MECHANISM: Self = Self::fixed(
        504,
        EnhancedCode::new(5, 7, 4),
        "Unsupported authentication mechanism",
    );

    /// Builds a status from a raw reply, parsing a leading enhanced code.
    ///
    /// Per RFC 2034 the enhanced code is repeated on every line; the
    /// repeats are stripped from continuation lines.
    #[must_use]
    pub fn from_reply(code: u16, message: &str) -> Self {
        let Some((first, rest)) = message.split_once(' ') else {
            return Self::new(code, EnhancedCode::NotSet, message.to_string());
        };
        let Some(enhanced) = EnhancedCode::parse(first) else {
            return Self::new(code, EnhancedCode::NotSet, message.to_string());
        };
        let text = rest.replace(&format!("\n{first} "), "\n");
        Self::new(code, enhanced, text)
    }

    /// Returns true if the code is 2xx.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if the code is 4xx.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if the code is 5xx.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }

    /// Renders the status as reply lines without CRLF.
    ///
    /// Every line but the last uses `DDD-text`; the last line is
    /// `DDD X.Y.Z text`, or `DDD text` when no enhanced code applies.
    #[must_use]
    pub fn to_lines(&self) -> Vec<String> {
        let code = self.code.as_u16();
        let text: Vec<&str> = self.message.split('\n').collect();
        let split = text.len().saturating_sub(1);
        let last = text.get(split).copied().unwrap_or_default();

        let mut lines: Vec<String> = text[..split]
            .iter()
            .map(|line| format!("{code}-{line}"))
            .collect();
        match self.enhanced.resolve(self.code) {
            Some((class, subject, detail)) => {
                lines.push(format!("{code} {class}.{subject}.{detail} {last}"));
            }
            None => lines.push(format!("{code} {last}")),
        }
        lines
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SMTP error {:03}", self.code.as_u16())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

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

    mod rendering {
        use super::*;

        #[test]
        fn not_set_derives_class() {
            let status = Status::new(550, EnhancedCode::NotSet, "Denied");
            assert_eq!(status.to_lines(), vec!["550 5.0.0 Denied"]);
        }

        #[test]
        fn omitted_has_no_triple() {
            let status = Status::new(550, EnhancedCode::Omitted, "Denied");
            assert_eq!(status.to_lines(), vec!["550 Denied"]);
        }

        #[test]
        fn not_set_on_3xx_has_no_triple() {
            let status = Status::new(354, EnhancedCode::NotSet, "Go ahead");
            assert_eq!(status.to_lines(), vec!["354 Go ahead"]);
        }

        #[test]
        fn multi_line() {
            let status = Status::new(250, EnhancedCode::Omitted, "Hello\nPIPELINING\nSIZE");
            assert_eq!(
                status.to_lines(),
                vec!["250-Hello", "250-PIPELINING", "250 SIZE"]
            );
        }

        #[test]
        fn explicit_code_on_last_line_only() {
            let status = Status::new(451, EnhancedCode::new(4, 3, 0), "one\ntwo");
            assert_eq!(status.to_lines(), vec!["451-one", "451 4.3.0 two"]);
        }

        #[test]
        fn empty_message() {
            let status = Status::new(334, EnhancedCode::Omitted, "");
            assert_eq!(status.to_lines(), vec!["334 "]);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn enhanced_code_parse() {
            assert_eq!(EnhancedCode::parse("5.7.1"), Some(EnhancedCode::new(5, 7, 1)));
            assert_eq!(EnhancedCode::parse("5.7"), None);
            assert_eq!(EnhancedCode::parse("5.7.1.2"), None);
            assert_eq!(EnhancedCode::parse("a.b.c"), None);
        }

        #[test]
        fn from_reply_without_code() {
            let status = Status::from_reply(550, "Mailbox unavailable");
            assert_eq!(status.enhanced, EnhancedCode::NotSet);
            assert_eq!(status.message, "Mailbox unavailable");
        }

        #[test]
        fn from_reply_strips_repeats() {
            let status = Status::from_reply(550, "5.1.1 first\n5.1.1 second");
            assert_eq!(status.enhanced, EnhancedCode::new(5, 1, 1));
            assert_eq!(status.message, "first\nsecond");
        }
    }

    #[test]
    fn test_predicates() {
        assert!(Status::NOOP.is_positive());
        assert!(Status::ERR_CONNECTION.is_temporary());
        assert!(Status::ERR_DATA_TOO_LARGE.is_permanent());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Status::ERR_AUTH_FAILED.to_string(),
            "SMTP error 535: Authentication failed"
        );
        assert_eq!(
            Status::new(250, EnhancedCode::NotSet, "").to_string(),
            "SMTP error 250"
        );
    }
}
