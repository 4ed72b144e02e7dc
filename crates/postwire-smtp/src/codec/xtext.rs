//! `xtext` (RFC 3461) and `utf-8-addr-xtext` / `utf-8-addr-unitext`
//! (RFC 6533) encodings for ESMTP parameter values.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{DsnAddressType, DsnNotify};

/// A `+` followed by up to two hex digits. Matches short forms too so they
/// can be reported as errors.
#[allow(clippy::unwrap_used)]
static HEXCHAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\+[0-9A-F]?[0-9A-F]?").unwrap());

/// An `\x{HEX}` escape, or a character that may not appear unescaped.
#[allow(clippy::unwrap_used)]
static EMBEDDED_OR_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\x[{][0-9A-F]+[}]|[[:cntrl:] \\+=]").unwrap());

const fn is_xchar(ch: char) -> bool {
    ch >= '!' && ch <= '~' && ch != '+' && ch != '='
}

/// Returns true if every character is printable US-ASCII (space included).
#[must_use]
pub fn is_printable_ascii(s: &str) -> bool {
    s.chars().all(|ch| (' '..='~').contains(&ch))
}

/// Encodes `raw` as xtext. Bytes outside `!`..`~`, plus `+` and `=`, become
/// `+HH`.
#[must_use]
pub fn encode_xtext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for &byte in raw.as_bytes() {
        let ch = char::from(byte);
        if byte.is_ascii() && is_xchar(ch) {
            out.push(ch);
        } else {
            let _ = write!(out, "+{byte:02X}");
        }
    }
    out
}

/// Decodes xtext. Only ASCII may be encoded.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an incomplete `+HH` sequence or an
/// encoded value above `0x7F`.
pub fn decode_xtext(val: &str) -> Result<String> {
    if !val.contains('+') {
        return Ok(val.to_string());
    }
    replace_all(&HEXCHAR, val, |hexchar| {
        if hexchar.len() != 3 {
            return Err(Error::InvalidInput("incomplete hexchar".to_string()));
        }
        u8::from_str_radix(&hexchar[1..], 16)
            .ok()
            .filter(u8::is_ascii)
            .map(char::from)
            .ok_or_else(|| Error::InvalidInput(format!("invalid hexchar: {hexchar}")))
    })
}

/// Encodes `raw` in the `utf-8-addr-unitext` form. Non-ASCII characters are
/// kept as they are.
#[must_use]
pub fn encode_utf8_addr_unitext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if is_xchar(ch) || !ch.is_ascii() {
            out.push(ch);
        } else {
            let _ = write!(out, "\\x{{{:02X}}}", u32::from(ch));
        }
    }
    out
}

/// Encodes `raw` in the ASCII-only `utf-8-addr-xtext` form.
#[must_use]
pub fn encode_utf8_addr_xtext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if is_xchar(ch) {
            out.push(ch);
        } else {
            let _ = write!(out, "\\x{{{:02X}}}", u32::from(ch));
        }
    }
    out
}

/// Decodes either `utf-8-addr-xtext` or `utf-8-addr-unitext`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an unescaped control character, space,
/// `\`, `+` or `=`, and for escapes outside the forms RFC 6533 allows.
pub fn decode_utf8_addr_xtext(val: &str) -> Result<String> {
    replace_all(&EMBEDDED_OR_DISALLOWED, val, |found| {
        if found.len() == 1 {
            return Err(Error::InvalidInput(format!("disallowed character: {found:?}")));
        }
        let hexpoint = &found[3..found.len() - 1];
        let illegal = || Error::InvalidInput(format!("illegal hexpoint: {hexpoint}"));
        let point = u32::from_str_radix(hexpoint, 16).map_err(|_| illegal())?;

        let allowed = match hexpoint.len() {
            2 => matches!(
                point,
                0x01..=0x09 | 0x10..=0x19 | 0x20 | 0x2B | 0x3D | 0x5C | 0x7F | 0x80..=0xFF
            ),
            3 => (0x100..=0xFFF).contains(&point),
            4 => matches!(point, 0x1000..=0xD7FF | 0xE000..=0xFFFF),
            5 => (0x1_0000..=0xF_FFFF).contains(&point),
            6 => (0x10_0000..=0x10_FFFF).contains(&point),
            _ => false,
        };
        if !allowed {
            return Err(illegal());
        }
        char::from_u32(point).ok_or_else(illegal)
    })
}

/// Decodes an `ORCPT` value of the form `addr-type;xtext`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a missing part, an unknown address
/// type, or a value that does not decode. RFC 822 addresses must be
/// printable ASCII.
pub fn decode_typed_address(val: &str) -> Result<(DsnAddressType, String)> {
    let bad = || Error::InvalidInput("bad address".to_string());
    let (kind, addr) = val.split_once(';').ok_or_else(bad)?;
    if kind.is_empty() || addr.is_empty() {
        return Err(bad());
    }

    let kind = DsnAddressType::parse(kind)
        .ok_or_else(|| Error::InvalidInput(format!("unknown address type: {kind}")))?;
    let addr = match kind {
        DsnAddressType::Rfc822 => {
            let addr = decode_xtext(addr)?;
            if !is_printable_ascii(&addr) {
                return Err(Error::InvalidInput(format!("illegal address: {addr}")));
            }
            addr
        }
        DsnAddressType::Utf8 => decode_utf8_addr_xtext(addr)?,
    };
    Ok((kind, addr))
}

/// Checks a `NOTIFY` list: non-empty, no duplicates, `NEVER` alone.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the set is malformed.
pub fn check_notify_set(values: &[DsnNotify]) -> Result<()> {
    let malformed = || Error::InvalidInput("malformed NOTIFY parameter value".to_string());
    if values.is_empty() {
        return Err(malformed());
    }
    let mut seen = HashSet::new();
    for value in values {
        if !seen.insert(*value) {
            return Err(malformed());
        }
    }
    if seen.contains(&DsnNotify::Never) && seen.len() > 1 {
        return Err(malformed());
    }
    Ok(())
}

fn replace_all<F>(re: &Regex, val: &str, mut decode: F) -> Result<String>
where
    F: FnMut(&str) -> Result<char>,
{
    let mut out = String::with_capacity(val.len());
    let mut last = 0;
    for found in re.find_iter(val) {
        out.push_str(&val[last..found.start()]);
        out.push(decode(found.as_str())?);
        last = found.end();
    }
    out.push_str(&val[last..]);
    Ok(out)
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
    fn test_encode_xtext() {
        assert_eq!(encode_xtext("abc"), "abc");
        assert_eq!(encode_xtext("a+b=c d"), "a+2Bb+3Dc+20d");
        assert_eq!(encode_xtext("tab\there"), "tab+09here");
    }

    #[test]
    fn test_decode_xtext() {
        assert_eq!(decode_xtext("plain").unwrap(), "plain");
        assert_eq!(decode_xtext("a+2Bb+3Dc+20d").unwrap(), "a+b=c d");
        assert!(decode_xtext("+2").is_err());
        assert!(decode_xtext("+").is_err());
        assert!(decode_xtext("+E9").is_err());
        assert!(decode_xtext("+2b").is_err());
    }

    #[test]
    fn test_xtext_round_trip_ascii() {
        let raw = "<envid+42=x @ host>";
        assert_eq!(decode_xtext(&encode_xtext(raw)).unwrap(), raw);
    }

    #[test]
    fn test_encode_utf8_forms() {
        assert_eq!(encode_utf8_addr_unitext("δ+x"), "δ\\x{2B}x");
        assert_eq!(encode_utf8_addr_xtext("δ+x"), "\\x{3B4}\\x{2B}x");
        assert_eq!(encode_utf8_addr_xtext("a b"), "a\\x{20}b");
        assert_eq!(encode_utf8_addr_xtext("\t"), "\\x{09}");
    }

    #[test]
    fn test_decode_utf8_addr_xtext() {
        assert_eq!(
            decode_utf8_addr_xtext("\\x{3B4}\\x{2B}x").unwrap(),
            "δ+x"
        );
        assert_eq!(decode_utf8_addr_xtext("δ\\x{2B}x").unwrap(), "δ+x");
        assert_eq!(decode_utf8_addr_xtext("\\x{1F600}").unwrap(), "😀");
        assert_eq!(decode_utf8_addr_xtext("\\x{09}").unwrap(), "\t");
    }

    #[test]
    fn test_decode_utf8_addr_xtext_rejects() {
        assert!(decode_utf8_addr_xtext("a b").is_err());
        assert!(decode_utf8_addr_xtext("a+b").is_err());
        assert!(decode_utf8_addr_xtext("a=b").is_err());
        assert!(decode_utf8_addr_xtext("a\\b").is_err());
        assert!(decode_utf8_addr_xtext("\\x{41}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{1A}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{0D}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{0041}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{D800}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{110000}").is_err());
        assert!(decode_utf8_addr_xtext("\\x{1234567}").is_err());
    }

    #[test]
    fn test_utf8_round_trip() {
        let raw = "δοκιμή user+tag@例え.jp";
        assert_eq!(
            decode_utf8_addr_xtext(&encode_utf8_addr_xtext(raw)).unwrap(),
            raw
        );
        assert_eq!(
            decode_utf8_addr_xtext(&encode_utf8_addr_unitext(raw)).unwrap(),
            raw
        );
    }

    #[test]
    fn test_decode_typed_address() {
        assert_eq!(
            decode_typed_address("rfc822;joe+2Bx@example.com").unwrap(),
            (DsnAddressType::Rfc822, "joe+x@example.com".to_string())
        );
        assert_eq!(
            decode_typed_address("UTF-8;δ@example.com").unwrap(),
            (DsnAddressType::Utf8, "δ@example.com".to_string())
        );
        assert!(decode_typed_address("rfc822").is_err());
        assert!(decode_typed_address(";joe@example.com").is_err());
        assert!(decode_typed_address("rfc822;").is_err());
        assert!(decode_typed_address("x400;joe").is_err());
        assert!(decode_typed_address("rfc822;joe+0A@example.com").is_err());
        assert!(decode_typed_address("rfc822;δ@example.com").is_err());
    }

    #[test]
    fn test_check_notify_set() {
        use DsnNotify::{Delay, Failure, Never, Success};
        assert!(check_notify_set(&[Never]).is_ok());
        assert!(check_notify_set(&[Success, Failure, Delay]).is_ok());
        assert!(check_notify_set(&[]).is_err());
        assert!(check_notify_set(&[Never, Success]).is_err());
        assert!(check_notify_set(&[Failure, Failure]).is_err());
    }

    #[test]
    fn test_is_printable_ascii() {
        assert!(is_printable_ascii("Hello world ~"));
        assert!(!is_printable_ascii("tab\t"));
        assert!(!is_printable_ascii("é"));
    }
}
