//! SMTP reply types.

/// A complete reply read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Text of each line, without the code and separator.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Returns the full text with lines joined by `\n`.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns the first whitespace-delimited word of the first line.
    ///
    /// For a greeting this is the server's name.
    #[must_use]
    pub fn first_word(&self) -> &str {
        self.lines
            .first()
            .and_then(|line| line.split(' ').next())
            .unwrap_or_default()
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Checks the code against an expectation.
    ///
    /// `1..=9` checks the hundreds digit, `10..=99` the first two digits
    /// and `100..` the exact code. `0` accepts anything.
    #[must_use]
    pub const fn matches(self, expect: u16) -> bool {
        match expect {
            0 => true,
            1..=9 => self.0 / 100 == expect,
            10..=99 => self.0 / 10 == expect,
            _ => self.0 == expect,
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCEEDED: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
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

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::SERVICE_UNAVAILABLE.is_transient());
            assert!(ReplyCode::SYNTAX_ERROR.is_permanent());
        }

        #[test]
        fn expectation_by_class() {
            assert!(ReplyCode::new(251).matches(2));
            assert!(!ReplyCode::new(354).matches(2));
        }

        #[test]
        fn expectation_by_prefix() {
            assert!(ReplyCode::new(251).matches(25));
            assert!(ReplyCode::new(250).matches(25));
            assert!(!ReplyCode::new(235).matches(25));
        }

        #[test]
        fn expectation_exact_and_disabled() {
            assert!(ReplyCode::new(220).matches(220));
            assert!(!ReplyCode::new(221).matches(220));
            assert!(ReplyCode::new(599).matches(0));
        }

        #[test]
        fn display_pads() {
            assert_eq!(ReplyCode::new(250).to_string(), "250");
        }
    }

    #[test]
    fn test_reply_text_and_first_word() {
        let reply = Reply::new(
            ReplyCode::SERVICE_READY,
            vec!["mx.example.com ESMTP ready".into(), "second".into()],
        );
        assert_eq!(reply.first_word(), "mx.example.com");
        assert_eq!(reply.text(), "mx.example.com ESMTP ready\nsecond");
        assert!(reply.is_success());
    }
}
