//! Argument parsing for `MAIL`, `RCPT` and `VRFY`.
//!
//! Every rejection is a ready-to-send [`Status`]. Parameters tied to a
//! disabled capability are refused with `504`.

use super::ServerConfig;
use crate::codec::xtext::{check_notify_set, decode_typed_address, decode_xtext, is_printable_ascii};
use crate::parser::{PathParser, cut_prefix_fold, parse_args};
use crate::types::{
    BodyType, DsnNotify, DsnReturn, EnhancedCode, MailOptions, RcptOptions, Status, VrfyOptions,
};

fn syntax(code: u16, detail: u16, message: &'static str) -> Status {
    Status::new(code, EnhancedCode::new(5, 5, detail), message)
}

fn not_implemented(message: &'static str) -> Status {
    syntax(504, 4, message)
}

fn parse_size(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u32>().ok().map(u64::from)
}

/// Parses the argument of `MAIL` into the reverse path and its options.
///
/// # Errors
///
/// Returns the status to send back when the argument is refused.
pub fn parse_mail(config: &ServerConfig, arg: &str) -> Result<(String, MailOptions), Status> {
    let bad_path = || syntax(501, 2, "Was expecting MAIL arg syntax of FROM:<address>");
    let arg = cut_prefix_fold(arg, "FROM:").ok_or_else(bad_path)?;
    let mut parser = PathParser::new(arg.trim());
    let from = parser.reverse_path().map_err(|_| bad_path())?;
    let args = parse_args(parser.rest())
        .map_err(|_| syntax(501, 4, "Unable to parse MAIL ESMTP parameters"))?;

    let mut opts = MailOptions::default();
    for (key, value) in args {
        match key.as_str() {
            "SIZE" => {
                let size = parse_size(&value)
                    .ok_or_else(|| syntax(501, 4, "Unable to parse SIZE as an integer"))?;
                if config.max_message_bytes > 0 && size > config.max_message_bytes {
                    return Err(Status::new(
                        552,
                        EnhancedCode::new(5, 3, 4),
                        "Max message size exceeded",
                    ));
                }
                opts.size = size;
            }
            "XOORG" => {
                let value = decode_xtext(&value)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| syntax(500, 4, "Malformed XOORG parameter value"))?;
                if !config.enable_xoorg {
                    return Err(not_implemented("XOORG is not implemented"));
                }
                opts.xoorg = Some(value);
            }
            "SMTPUTF8" => {
                if !config.enable_smtputf8 {
                    return Err(not_implemented("SMTPUTF8 is not implemented"));
                }
                opts.utf8 = true;
            }
            "REQUIRETLS" => {
                if !config.enable_requiretls {
                    return Err(not_implemented("REQUIRETLS is not implemented"));
                }
                opts.require_tls = true;
            }
            "BODY" => {
                let body =
                    BodyType::parse(&value).ok_or_else(|| syntax(501, 4, "Unknown BODY value"))?;
                if body == BodyType::BinaryMime && !config.enable_binarymime {
                    return Err(not_implemented("BINARYMIME is not implemented"));
                }
                opts.body = Some(body);
            }
            "RET" => {
                if !config.enable_dsn {
                    return Err(not_implemented("RET is not implemented"));
                }
                let ret =
                    DsnReturn::parse(&value).ok_or_else(|| syntax(501, 4, "Unknown RET value"))?;
                opts.ret = Some(ret);
            }
            "ENVID" => {
                if !config.enable_dsn {
                    return Err(not_implemented("ENVID is not implemented"));
                }
                let value = decode_xtext(&value)
                    .ok()
                    .filter(|v| !v.is_empty() && is_printable_ascii(v))
                    .ok_or_else(|| syntax(501, 4, "Malformed ENVID parameter value"))?;
                opts.envelope_id = Some(value);
            }
            "AUTH" => {
                let value = decode_xtext(&value)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| syntax(500, 4, "Malformed AUTH parameter value"))?;
                let mailbox = if value == "<>" {
                    String::new()
                } else {
                    let mut parser = PathParser::new(&value);
                    match parser.mailbox() {
                        Ok(mailbox) if parser.rest().is_empty() => mailbox,
                        _ => return Err(syntax(500, 4, "Malformed AUTH parameter mailbox")),
                    }
                };
                opts.auth = Some(mailbox);
            }
            _ => return Err(syntax(500, 4, "Unknown MAIL FROM argument")),
        }
    }

    Ok((from, opts))
}

/// Parses the argument of `RCPT` into the forward path and its options.
///
/// `accepted` is the number of recipients already in the transaction.
///
/// # Errors
///
/// Returns the status to send back when the argument is refused.
pub fn parse_rcpt(
    config: &ServerConfig,
    arg: &str,
    accepted: usize,
) -> Result<(String, RcptOptions), Status> {
    let bad_path = || syntax(501, 2, "Was expecting RCPT arg syntax of TO:<address>");
    let arg = cut_prefix_fold(arg, "TO:").ok_or_else(bad_path)?;
    let mut parser = PathParser::new(arg.trim());
    let to = parser.path().map_err(|_| bad_path())?;

    if config.max_recipients > 0 && accepted >= config.max_recipients {
        return Err(Status::new(
            452,
            EnhancedCode::new(4, 5, 3),
            format!(
                "Maximum limit of {} recipients reached",
                config.max_recipients
            ),
        ));
    }

    let args = parse_args(parser.rest())
        .map_err(|_| syntax(501, 4, "Unable to parse RCPT ESMTP parameters"))?;

    let mut opts = RcptOptions::default();
    for (key, value) in args {
        match key.as_str() {
            "NOTIFY" => {
                if !config.enable_dsn {
                    return Err(not_implemented("NOTIFY is not implemented"));
                }
                let malformed = || syntax(501, 4, "Malformed NOTIFY parameter value");
                let notify = value
                    .split(',')
                    .map(DsnNotify::parse)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(malformed)?;
                check_notify_set(&notify).map_err(|_| malformed())?;
                opts.notify = notify;
            }
            "ORCPT" => {
                if !config.enable_dsn {
                    return Err(not_implemented("ORCPT is not implemented"));
                }
                let original = decode_typed_address(&value)
                    .ok()
                    .filter(|(_, addr)| !addr.is_empty())
                    .ok_or_else(|| syntax(501, 4, "Malformed ORCPT parameter value"))?;
                opts.original_recipient = Some(original);
            }
            _ => return Err(syntax(500, 4, "Unknown RCPT TO argument")),
        }
    }

    Ok((to, opts))
}

/// Parses the argument of `VRFY`.
///
/// # Errors
///
/// Returns the status to send back when the argument is refused.
pub fn parse_vrfy(config: &ServerConfig, arg: &str) -> Result<(String, VrfyOptions), Status> {
    let mut parser = PathParser::new(arg.trim());
    let addr = parser
        .path()
        .map_err(|_| syntax(501, 2, "Was expecting <address>"))?;
    let args = parse_args(parser.rest())
        .map_err(|_| syntax(501, 4, "Unable to parse VRFY ESMTP parameters"))?;

    let mut opts = VrfyOptions::default();
    if args.iter().any(|(key, _)| key == "SMTPUTF8") {
        if !config.enable_smtputf8 {
            return Err(not_implemented("SMTPUTF8 is not implemented"));
        }
        opts.utf8 = true;
    }
    Ok((addr, opts))
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
    use crate::types::DsnAddressType;

    fn all_enabled() -> ServerConfig {
        ServerConfig::builder()
            .enable_smtputf8(true)
            .enable_requiretls(true)
            .enable_binarymime(true)
            .enable_dsn(true)
            .enable_xoorg(true)
            .build()
    }

    fn rejected(result: Result<(String, impl std::fmt::Debug), Status>) -> (u16, String) {
        let status = result.unwrap_err();
        (status.code.as_u16(), status.message.into_owned())
    }

    mod mail {
        use super::*;

        #[test]
        fn test_plain_and_null_sender() {
            let config = ServerConfig::default();
            let (from, opts) = parse_mail(&config, "FROM:<a@example.com>").unwrap();
            assert_eq!(from, "a@example.com");
            assert_eq!(opts, MailOptions::default());

            let (from, _) = parse_mail(&config, "from: <>").unwrap();
            assert_eq!(from, "");
        }

        #[test]
        fn test_all_parameters() {
            let (from, opts) = parse_mail(
                &all_enabled(),
                "FROM:<a@example.com> SIZE=1000 BODY=8bitmime SMTPUTF8 REQUIRETLS RET=HDRS \
                 ENVID=QQ+2B314 AUTH=<> XOORG=example.org",
            )
            .unwrap();
            assert_eq!(from, "a@example.com");
            assert_eq!(opts.size, 1000);
            assert_eq!(opts.body, Some(BodyType::EightBitMime));
            assert!(opts.utf8);
            assert!(opts.require_tls);
            assert_eq!(opts.ret, Some(DsnReturn::Headers));
            assert_eq!(opts.envelope_id.as_deref(), Some("QQ+314"));
            assert_eq!(opts.auth.as_deref(), Some(""));
            assert_eq!(opts.xoorg.as_deref(), Some("example.org"));
        }

        #[test]
        fn test_auth_mailbox() {
            let (_, opts) =
                parse_mail(&all_enabled(), "FROM:<a@example.com> AUTH=e+3Dmc2@example.com")
                    .unwrap();
            assert_eq!(opts.auth.as_deref(), Some("e=mc2@example.com"));

            let result = parse_mail(&all_enabled(), "FROM:<a@example.com> AUTH=nobody");
            assert_eq!(rejected(result).0, 500);
        }

        #[test]
        fn test_syntax_errors() {
            let config = ServerConfig::default();
            assert_eq!(rejected(parse_mail(&config, "TO:<a@example.com>")).0, 501);
            assert_eq!(rejected(parse_mail(&config, "FROM:<a@example.com")).0, 501);
            assert_eq!(
                rejected(parse_mail(&config, "FROM:<a@example.com> SIZE=+5")),
                (501, "Unable to parse SIZE as an integer".to_string())
            );
            assert_eq!(
                rejected(parse_mail(&config, "FROM:<a@example.com> BODY=9BIT")).0,
                501
            );
            assert_eq!(
                rejected(parse_mail(&config, "FROM:<a@example.com> FOO=BAR")),
                (500, "Unknown MAIL FROM argument".to_string())
            );
            assert_eq!(
                rejected(parse_mail(&config, "FROM:<a@example.com> A=B=C")).0,
                501
            );
        }

        #[test]
        fn test_size_limit() {
            let config = ServerConfig::builder().max_message_bytes(100).build();
            assert!(parse_mail(&config, "FROM:<a@example.com> SIZE=100").is_ok());
            assert_eq!(
                rejected(parse_mail(&config, "FROM:<a@example.com> SIZE=101")).0,
                552
            );
        }

        #[test]
        fn test_capability_gating() {
            let config = ServerConfig::default();
            for param in [
                "SMTPUTF8",
                "REQUIRETLS",
                "BODY=BINARYMIME",
                "RET=FULL",
                "ENVID=abc",
                "XOORG=example.org",
            ] {
                let result = parse_mail(&config, &format!("FROM:<a@example.com> {param}"));
                assert_eq!(rejected(result).0, 504, "{param}");
            }
        }

        #[test]
        fn test_envid_must_be_printable() {
            let result = parse_mail(&all_enabled(), "FROM:<a@example.com> ENVID=a+01");
            assert_eq!(rejected(result).0, 501);
        }
    }

    mod rcpt {
        use super::*;

        #[test]
        fn test_notify_gated_by_dsn() {
            let result = parse_rcpt(
                &ServerConfig::default(),
                "TO:<b@example.com> NOTIFY=NEVER",
                0,
            );
            assert_eq!(rejected(result).0, 504);

            let (to, opts) =
                parse_rcpt(&all_enabled(), "TO:<b@example.com> NOTIFY=NEVER", 0).unwrap();
            assert_eq!(to, "b@example.com");
            assert_eq!(opts.notify, vec![DsnNotify::Never]);
        }

        #[test]
        fn test_notify_list() {
            let (_, opts) = parse_rcpt(
                &all_enabled(),
                "TO:<b@example.com> NOTIFY=success,FAILURE",
                0,
            )
            .unwrap();
            assert_eq!(opts.notify, vec![DsnNotify::Success, DsnNotify::Failure]);

            for bad in ["NEVER,DELAY", "SUCCESS,SUCCESS", "SOMETIMES", ""] {
                let result = parse_rcpt(&all_enabled(), &format!("TO:<b@example.com> NOTIFY={bad}"), 0);
                assert_eq!(rejected(result).0, 501, "{bad}");
            }
        }

        #[test]
        fn test_orcpt() {
            let (_, opts) = parse_rcpt(
                &all_enabled(),
                "TO:<b@example.com> ORCPT=rfc822;b+2Bx@example.com",
                0,
            )
            .unwrap();
            assert_eq!(
                opts.original_recipient,
                Some((DsnAddressType::Rfc822, "b+x@example.com".to_string()))
            );

            let (_, opts) = parse_rcpt(
                &all_enabled(),
                "TO:<b@example.com> ORCPT=UTF-8;\\x{E9}@example.com",
                0,
            )
            .unwrap();
            assert_eq!(
                opts.original_recipient,
                Some((DsnAddressType::Utf8, "\u{e9}@example.com".to_string()))
            );

            let result = parse_rcpt(&all_enabled(), "TO:<b@example.com> ORCPT=x400;abc", 0);
            assert_eq!(rejected(result).0, 501);
        }

        #[test]
        fn test_recipient_limit() {
            let config = ServerConfig::builder().max_recipients(2).build();
            assert!(parse_rcpt(&config, "TO:<b@example.com>", 1).is_ok());
            assert_eq!(
                rejected(parse_rcpt(&config, "TO:<b@example.com>", 2)),
                (452, "Maximum limit of 2 recipients reached".to_string())
            );
        }

        #[test]
        fn test_bad_path() {
            let config = ServerConfig::default();
            assert_eq!(rejected(parse_rcpt(&config, "TO:<>", 0)).0, 501);
            assert_eq!(rejected(parse_rcpt(&config, "<b@example.com>", 0)).0, 501);
            assert_eq!(
                rejected(parse_rcpt(&config, "TO:<b@example.com> X=1", 0)).0,
                500
            );
        }
    }

    mod vrfy {
        use super::*;

        #[test]
        fn test_vrfy() {
            let (addr, opts) = parse_vrfy(&ServerConfig::default(), "<b@example.com>").unwrap();
            assert_eq!(addr, "b@example.com");
            assert!(!opts.utf8);

            let result = parse_vrfy(&ServerConfig::default(), "<b@example.com> SMTPUTF8");
            assert_eq!(rejected(result).0, 504);

            let (_, opts) = parse_vrfy(&all_enabled(), "<b@example.com> SMTPUTF8").unwrap();
            assert!(opts.utf8);

            assert_eq!(rejected(parse_vrfy(&all_enabled(), "nobody")).0, 501);
        }
    }
}
