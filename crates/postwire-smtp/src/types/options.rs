//! ESMTP parameters of `MAIL`, `RCPT` and `VRFY`.

use std::fmt;

/// Value of the `BODY=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyType {
    /// `7BIT`
    SevenBit,
    /// `8BITMIME` (RFC 6152)
    EightBitMime,
    /// `BINARYMIME` (RFC 3030)
    BinaryMime,
}

impl BodyType {
    /// Parses a body type, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "7BIT" => Some(Self::SevenBit),
            "8BITMIME" => Some(Self::EightBitMime),
            "BINARYMIME" => Some(Self::BinaryMime),
            _ => None,
        }
    }

    /// Returns the wire keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
            Self::BinaryMime => "BINARYMIME",
        }
    }
}

/// Value of the DSN `RET=` parameter (RFC 3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsnReturn {
    /// Return the full message.
    Full,
    /// Return headers only.
    Headers,
}

impl DsnReturn {
    /// Parses a return value, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Some(Self::Full),
            "HDRS" => Some(Self::Headers),
            _ => None,
        }
    }

    /// Returns the wire keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Headers => "HDRS",
        }
    }
}

/// One entry of the DSN `NOTIFY=` parameter (RFC 3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsnNotify {
    /// Never notify. Must not be combined with other values.
    Never,
    /// Notify on delay.
    Delay,
    /// Notify on failure.
    Failure,
    /// Notify on success.
    Success,
}

impl DsnNotify {
    /// Parses a notify keyword, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEVER" => Some(Self::Never),
            "DELAY" => Some(Self::Delay),
            "FAILURE" => Some(Self::Failure),
            "SUCCESS" => Some(Self::Success),
            _ => None,
        }
    }

    /// Returns the wire keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Delay => "DELAY",
            Self::Failure => "FAILURE",
            Self::Success => "SUCCESS",
        }
    }
}

/// Address type of the DSN `ORCPT=` parameter (RFC 3461, RFC 6533).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsnAddressType {
    /// `rfc822`: xtext-encoded ASCII address.
    Rfc822,
    /// `utf-8`: unitext or utf-8-addr-xtext encoded address.
    Utf8,
}

impl DsnAddressType {
    /// Parses an address type, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RFC822" => Some(Self::Rfc822),
            "UTF-8" => Some(Self::Utf8),
            _ => None,
        }
    }

    /// Returns the wire keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rfc822 => "RFC822",
            Self::Utf8 => "UTF-8",
        }
    }
}

impl fmt::Display for DsnAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a received `MAIL FROM` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailOptions {
    /// Value of `BODY=`.
    pub body: Option<BodyType>,
    /// Declared message size, 0 when absent.
    pub size: u64,
    /// `REQUIRETLS` was given (RFC 8689).
    pub require_tls: bool,
    /// `SMTPUTF8` was given (RFC 6531).
    pub utf8: bool,
    /// Value of `RET=`.
    pub ret: Option<DsnReturn>,
    /// Decoded value of `ENVID=`.
    pub envelope_id: Option<String>,
    /// Decoded `AUTH=` mailbox (RFC 4954). `Some("")` means `AUTH=<>`.
    pub auth: Option<String>,
    /// Decoded value of `XOORG=`.
    pub xoorg: Option<String>,
}

/// Parameters of a received `RCPT TO` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcptOptions {
    /// Value of `NOTIFY=`, in wire order.
    pub notify: Vec<DsnNotify>,
    /// Decoded `ORCPT=` address and its type.
    pub original_recipient: Option<(DsnAddressType, String)>,
}

/// Parameters of a received `VRFY` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VrfyOptions {
    /// `SMTPUTF8` was given.
    pub utf8: bool,
}

/// How the client uses SMTPUTF8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Utf8Mode {
    /// Send `SMTPUTF8` when the server advertises it.
    #[default]
    Prefer,
    /// Always send it; fail locally when the server lacks it.
    Force,
    /// Never send it.
    Disabled,
}

/// Parameters the client sends with `MAIL FROM`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Size hint, sent as `SIZE=` when non-zero and advertised.
    pub size: u64,
    /// Demand `REQUIRETLS`. Fails locally when not advertised.
    pub require_tls: bool,
    /// SMTPUTF8 usage.
    pub utf8: Utf8Mode,
    /// DSN `RET=`.
    pub ret: Option<DsnReturn>,
    /// DSN `ENVID=`, printable ASCII.
    pub envelope_id: Option<String>,
    /// `AUTH=` identity. `Some("")` sends `AUTH=<>`.
    pub auth: Option<String>,
    /// `XOORG=` accepted domain.
    pub xoorg: Option<String>,
}

/// Parameters the client sends with `VRFY`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// SMTPUTF8 usage.
    pub utf8: Utf8Mode,
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

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert_eq!(BodyType::parse("8bitmime"), Some(BodyType::EightBitMime));
        assert_eq!(DsnReturn::parse("hdrs"), Some(DsnReturn::Headers));
        assert_eq!(DsnNotify::parse("Failure"), Some(DsnNotify::Failure));
        assert_eq!(DsnAddressType::parse("utf-8"), Some(DsnAddressType::Utf8));
        assert_eq!(BodyType::parse("9BIT"), None);
    }

    #[test]
    fn test_wire_keywords() {
        assert_eq!(BodyType::BinaryMime.as_str(), "BINARYMIME");
        assert_eq!(DsnReturn::Full.as_str(), "FULL");
        assert_eq!(DsnAddressType::Rfc822.to_string(), "RFC822");
    }
}
