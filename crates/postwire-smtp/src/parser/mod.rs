//! Parsers for the text side of SMTP: command lines, ESMTP parameters and
//! reply lines.

mod path;

pub use path::PathParser;

use crate::error::{Error, Result};

/// Parses one reply line into `(code, continued, text)`.
///
/// `continued` is true for `DDD-text` lines.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for short lines, a bad separator, or a code
/// below 100.
pub fn parse_reply_line(line: &str) -> Result<(u16, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || (bytes[3] != b' ' && bytes[3] != b'-') {
        return Err(Error::Protocol(format!("short response: {line}")));
    }
    let code = line
        .get(..3)
        .and_then(|digits| digits.parse::<u16>().ok())
        .filter(|code| *code >= 100)
        .ok_or_else(|| Error::Protocol(format!("invalid response code: {line}")))?;
    Ok((code, bytes[3] == b'-', &line[4..]))
}

/// Splits a command line into the upper-cased verb and its trimmed argument.
///
/// An empty line yields an empty verb. Any line starting with `STARTTLS` is
/// taken as `STARTTLS` with no argument.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for lines that are too short or lack the
/// space after the verb.
pub fn parse_command(line: &str) -> Result<(String, String)> {
    let line = line.trim_end_matches(['\r', '\n']);

    let starttls = line
        .get(..8)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("STARTTLS"));
    if starttls {
        return Ok(("STARTTLS".to_string(), String::new()));
    }

    match line.len() {
        0 => return Ok((String::new(), String::new())),
        1..=3 => return Err(Error::Protocol(format!("command too short: {line:?}"))),
        4 => return Ok((line.to_ascii_uppercase(), String::new())),
        5 => return Err(Error::Protocol(format!("mangled command: {line:?}"))),
        _ => {}
    }

    match (line.get(..4), line.get(4..5), line.get(5..)) {
        (Some(verb), Some(" "), Some(arg)) => {
            Ok((verb.to_ascii_uppercase(), arg.trim().to_string()))
        }
        _ => Err(Error::Protocol(format!("mangled command: {line:?}"))),
    }
}

/// Parses space-separated `KEY[=value]` parameters.
///
/// Keys are upper-cased; values are kept verbatim. Order is preserved.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a token with more than one `=`.
pub fn parse_args(s: &str) -> Result<Vec<(String, String)>> {
    s.split_whitespace()
        .map(|arg| {
            let mut parts = arg.split('=');
            let key = parts.next().unwrap_or_default().to_ascii_uppercase();
            let value = parts.next().unwrap_or_default().to_string();
            if parts.next().is_some() {
                return Err(Error::Protocol(format!("failed to parse arg string: {arg:?}")));
            }
            Ok((key, value))
        })
        .collect()
}

/// Extracts the domain from a `HELO`/`EHLO` argument.
///
/// # Errors
///
/// Returns [`Error::Protocol`] when the domain is empty.
pub fn hello_argument(arg: &str) -> Result<&str> {
    let domain = arg.split_once(' ').map_or(arg, |(domain, _)| domain);
    if domain.is_empty() {
        return Err(Error::Protocol("invalid domain".to_string()));
    }
    Ok(domain)
}

/// Case-insensitive `strip_prefix` for ASCII prefixes.
#[must_use]
pub fn cut_prefix_fold<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
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

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("250 OK").unwrap(), (250, false, "OK"));
        assert_eq!(
            parse_reply_line("250-PIPELINING").unwrap(),
            (250, true, "PIPELINING")
        );
        assert_eq!(parse_reply_line("354 ").unwrap(), (354, false, ""));
    }

    #[test]
    fn test_parse_reply_line_errors() {
        assert!(parse_reply_line("").is_err());
        assert!(parse_reply_line("250").is_err());
        assert!(parse_reply_line("250_x").is_err());
        assert!(parse_reply_line("2x0 x").is_err());
        assert!(parse_reply_line("099 x").is_err());
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("ehlo mx.example.com\r\n").unwrap(),
            ("EHLO".to_string(), "mx.example.com".to_string())
        );
        assert_eq!(
            parse_command("MAIL FROM:<a@b>  SIZE=10 ").unwrap(),
            ("MAIL".to_string(), "FROM:<a@b>  SIZE=10".to_string())
        );
        assert_eq!(
            parse_command("quit").unwrap(),
            ("QUIT".to_string(), String::new())
        );
        assert_eq!(parse_command("").unwrap(), (String::new(), String::new()));
    }

    #[test]
    fn test_parse_command_starttls_prefix() {
        assert_eq!(parse_command("starttls junk").unwrap().0, "STARTTLS");
        assert_eq!(parse_command("STARTTLS").unwrap().1, "");
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(parse_command("abc").is_err());
        assert!(parse_command("QUITX").is_err());
        assert!(parse_command("MAILFROM:<a@b>").is_err());
        assert!(parse_command("MAÏL x").is_err());
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(" BODY=8BITMIME SIZE=1024 smtputf8").unwrap();
        assert_eq!(
            args,
            vec![
                ("BODY".to_string(), "8BITMIME".to_string()),
                ("SIZE".to_string(), "1024".to_string()),
                ("SMTPUTF8".to_string(), String::new()),
            ]
        );
        assert!(parse_args("").unwrap().is_empty());
        assert!(parse_args("A=b=c").is_err());
    }

    #[test]
    fn test_hello_argument() {
        assert_eq!(hello_argument("mx.example.com").unwrap(), "mx.example.com");
        assert_eq!(hello_argument("[127.0.0.1] extra").unwrap(), "[127.0.0.1]");
        assert!(hello_argument("").is_err());
        assert!(hello_argument(" leading").is_err());
    }

    #[test]
    fn test_cut_prefix_fold() {
        assert_eq!(cut_prefix_fold("from:<a@b>", "FROM:"), Some("<a@b>"));
        assert_eq!(cut_prefix_fold("TO:<a@b>", "FROM:"), None);
        assert_eq!(cut_prefix_fold("FR", "FROM:"), None);
    }
}
