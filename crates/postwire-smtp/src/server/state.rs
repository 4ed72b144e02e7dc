//! Connection states and the per-state command table.
//!
//! Everything here is pure: the connection asks which [`Action`] a command
//! maps to in its current state and which state follows a greeting, then
//! performs the I/O itself.

use std::fmt;

use super::ServerConfig;
use crate::types::{EnhancedCode, Status};

/// Protocol state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Before the first `HELO`/`EHLO`.
    Init,
    /// After `STARTTLS`, before the client greets again.
    Upgrade,
    /// Greeted, waiting for `AUTH`.
    EnforceAuthentication,
    /// Greeted over plain text, waiting for `STARTTLS`.
    EnforceSecureConnection,
    /// Ready for `MAIL`.
    Greeted,
    /// Inside a transaction.
    Mail,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Upgrade => "upgrade",
            Self::EnforceAuthentication => "enforce authentication",
            Self::EnforceSecureConnection => "enforce secure connection",
            Self::Greeted => "greeted",
            Self::Mail => "mail",
        };
        f.write_str(name)
    }
}

/// What the connection should do with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `HELO` (`extended == false`) or `EHLO`.
    Hello {
        /// The command was `EHLO`.
        extended: bool,
    },
    /// `MAIL FROM`.
    Mail,
    /// `RCPT TO`.
    Rcpt,
    /// `DATA`.
    Data,
    /// `BDAT`.
    Bdat,
    /// `AUTH`.
    Auth,
    /// `STARTTLS`.
    StartTls,
    /// `NOOP`.
    Noop,
    /// `VRFY`.
    Verify,
    /// `RSET`.
    Reset,
    /// `QUIT`.
    Quit,
    /// Refuse with this status.
    Reject(Status),
}

/// Connection facts that change the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    /// `BDAT` is enabled.
    pub chunking: bool,
    /// At least one SASL mechanism was advertised.
    pub auth: bool,
}

fn unknown(cmd: &str, state: State) -> Action {
    Action::Reject(Status::new(
        502,
        EnhancedCode::new(5, 5, 1),
        format!("{cmd} command unknown, state {state}"),
    ))
}

/// Maps an upper-cased command verb to an action in `state`.
#[must_use]
pub fn dispatch(state: State, cmd: &str, policy: Policy) -> Action {
    if cmd.is_empty() {
        return Action::Reject(Status::new(
            500,
            EnhancedCode::new(5, 5, 2),
            "Error: bad syntax",
        ));
    }

    let common = match cmd {
        "HELO" => Some(Action::Hello { extended: false }),
        "EHLO" => Some(Action::Hello { extended: true }),
        "NOOP" => Some(Action::Noop),
        "VRFY" => Some(Action::Verify),
        "QUIT" => Some(Action::Quit),
        _ => None,
    };
    if let Some(action) = common {
        return action;
    }

    match (state, cmd) {
        (State::EnforceSecureConnection, "STARTTLS") => Action::StartTls,
        (State::EnforceSecureConnection, _) => Action::Reject(Status::new(
            530,
            EnhancedCode::new(5, 7, 0),
            "Must issue a STARTTLS command first",
        )),

        (State::EnforceAuthentication, "RSET") => Action::Reset,
        (State::EnforceAuthentication, "AUTH") => Action::Auth,
        (State::EnforceAuthentication, "STARTTLS") => Action::StartTls,
        (State::EnforceAuthentication, _) => Action::Reject(Status::ERR_AUTH_REQUIRED),

        (State::Init | State::Upgrade | State::Greeted | State::Mail, "RSET") => Action::Reset,

        (State::Greeted, "MAIL") => Action::Mail,
        (State::Greeted, "AUTH") if policy.auth => Action::Auth,
        (State::Greeted, "AUTH") => Action::Reject(Status::ERR_AUTH_UNSUPPORTED),
        (State::Greeted | State::Mail, "STARTTLS") => Action::StartTls,

        (State::Mail, "RCPT") => Action::Rcpt,
        (State::Mail, "DATA") => Action::Data,
        (State::Mail, "BDAT") if policy.chunking => Action::Bdat,
        (State::Mail, "BDAT") => Action::Reject(Status::new(
            504,
            EnhancedCode::new(5, 5, 4),
            "CHUNKING is not implemented",
        )),
        (State::Mail, "AUTH") => Action::Reject(Status::new(
            503,
            EnhancedCode::new(5, 5, 1),
            "AUTH not permitted during a mail transaction",
        )),

        _ => unknown(cmd, state),
    }
}

/// Returns true if a greeting in `state` must reset the session first.
///
/// RFC 5321 treats a repeated `EHLO` like `RSET`.
#[must_use]
pub const fn hello_resets(state: State) -> bool {
    !matches!(
        state,
        State::Init | State::EnforceSecureConnection | State::EnforceAuthentication
    )
}

/// Returns the state after a successful greeting.
#[must_use]
pub const fn after_hello(
    enforce_secure: bool,
    is_tls: bool,
    enforce_auth: bool,
    authenticated: bool,
) -> State {
    if enforce_secure && !is_tls {
        State::EnforceSecureConnection
    } else if enforce_auth && !authenticated {
        State::EnforceAuthentication
    } else {
        State::Greeted
    }
}

/// Returns the state once a transaction ends.
#[must_use]
pub const fn after_transaction(state: State) -> State {
    match state {
        State::Mail => State::Greeted,
        other => other,
    }
}

/// Builds the `EHLO` capability lines.
#[must_use]
pub fn capabilities(config: &ServerConfig, is_tls: bool, mechanisms: &[String]) -> Vec<String> {
    let mut caps = vec![
        "PIPELINING".to_string(),
        "8BITMIME".to_string(),
        "ENHANCEDSTATUSCODES".to_string(),
    ];

    if config.enable_chunking {
        caps.push("CHUNKING".to_string());
    }
    if !is_tls && config.tls.is_some() {
        caps.push("STARTTLS".to_string());
    }
    if !mechanisms.is_empty() {
        caps.push(format!("AUTH {}", mechanisms.join(" ")));
    }
    if config.enable_smtputf8 {
        caps.push("SMTPUTF8".to_string());
    }
    if is_tls && config.enable_requiretls {
        caps.push("REQUIRETLS".to_string());
    }
    if config.enable_binarymime {
        caps.push("BINARYMIME".to_string());
    }
    if config.enable_dsn {
        caps.push("DSN".to_string());
    }
    if config.enable_xoorg {
        caps.push("XOORG".to_string());
    }
    if config.max_message_bytes > 0 {
        caps.push(format!("SIZE {}", config.max_message_bytes));
    } else {
        caps.push("SIZE".to_string());
    }
    if config.max_recipients > 0 {
        caps.push(format!("LIMITS RCPTMAX={}", config.max_recipients));
    }
    caps
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

    const OPEN: Policy = Policy {
        chunking: true,
        auth: true,
    };

    fn code(action: &Action) -> u16 {
        match action {
            Action::Reject(status) => status.code.as_u16(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    mod dispatch_table {
        use super::*;

        #[test]
        fn test_rcpt_before_mail_rejected() {
            let action = dispatch(State::Greeted, "RCPT", OPEN);
            assert_eq!(code(&action), 502);
            let Action::Reject(status) = action else {
                unreachable!()
            };
            assert_eq!(status.message, "RCPT command unknown, state greeted");
        }

        #[test]
        fn test_mail_twice_rejected() {
            assert_eq!(code(&dispatch(State::Mail, "MAIL", OPEN)), 502);
        }

        #[test]
        fn test_init_accepts_only_basics() {
            assert_eq!(
                dispatch(State::Init, "EHLO", OPEN),
                Action::Hello { extended: true }
            );
            assert_eq!(dispatch(State::Init, "RSET", OPEN), Action::Reset);
            assert_eq!(code(&dispatch(State::Init, "MAIL", OPEN)), 502);
            assert_eq!(code(&dispatch(State::Init, "STARTTLS", OPEN)), 502);
            assert_eq!(code(&dispatch(State::Upgrade, "MAIL", OPEN)), 502);
        }

        #[test]
        fn test_enforce_secure_connection() {
            let state = State::EnforceSecureConnection;
            assert_eq!(dispatch(state, "STARTTLS", OPEN), Action::StartTls);
            assert_eq!(dispatch(state, "VRFY", OPEN), Action::Verify);
            assert_eq!(dispatch(state, "QUIT", OPEN), Action::Quit);
            assert_eq!(code(&dispatch(state, "MAIL", OPEN)), 530);
            assert_eq!(code(&dispatch(state, "RSET", OPEN)), 530);
            assert_eq!(code(&dispatch(state, "AUTH", OPEN)), 530);
        }

        #[test]
        fn test_enforce_authentication() {
            let state = State::EnforceAuthentication;
            assert_eq!(dispatch(state, "AUTH", OPEN), Action::Auth);
            assert_eq!(dispatch(state, "STARTTLS", OPEN), Action::StartTls);
            assert_eq!(dispatch(state, "RSET", OPEN), Action::Reset);
            assert_eq!(
                dispatch(state, "MAIL", OPEN),
                Action::Reject(Status::ERR_AUTH_REQUIRED)
            );
        }

        #[test]
        fn test_greeted() {
            assert_eq!(dispatch(State::Greeted, "MAIL", OPEN), Action::Mail);
            assert_eq!(dispatch(State::Greeted, "AUTH", OPEN), Action::Auth);
            let no_auth = Policy {
                auth: false,
                ..OPEN
            };
            assert_eq!(
                dispatch(State::Greeted, "AUTH", no_auth),
                Action::Reject(Status::ERR_AUTH_UNSUPPORTED)
            );
            assert_eq!(code(&dispatch(State::Greeted, "DATA", OPEN)), 502);
        }

        #[test]
        fn test_mail() {
            assert_eq!(dispatch(State::Mail, "RCPT", OPEN), Action::Rcpt);
            assert_eq!(dispatch(State::Mail, "DATA", OPEN), Action::Data);
            assert_eq!(dispatch(State::Mail, "BDAT", OPEN), Action::Bdat);
            assert_eq!(dispatch(State::Mail, "STARTTLS", OPEN), Action::StartTls);
            assert_eq!(code(&dispatch(State::Mail, "AUTH", OPEN)), 503);
            let no_chunking = Policy {
                chunking: false,
                ..OPEN
            };
            assert_eq!(code(&dispatch(State::Mail, "BDAT", no_chunking)), 504);
        }

        #[test]
        fn test_empty_command() {
            assert_eq!(code(&dispatch(State::Greeted, "", OPEN)), 500);
        }
    }

    mod transitions {
        use super::*;

        #[test]
        fn test_hello_resets() {
            assert!(!hello_resets(State::Init));
            assert!(!hello_resets(State::EnforceSecureConnection));
            assert!(hello_resets(State::Upgrade));
            assert!(hello_resets(State::Greeted));
            assert!(hello_resets(State::Mail));
        }

        #[test]
        fn test_after_hello() {
            assert_eq!(
                after_hello(true, false, true, false),
                State::EnforceSecureConnection
            );
            assert_eq!(
                after_hello(true, true, true, false),
                State::EnforceAuthentication
            );
            assert_eq!(after_hello(false, false, true, true), State::Greeted);
            assert_eq!(after_hello(false, false, false, false), State::Greeted);
        }

        #[test]
        fn test_after_transaction() {
            assert_eq!(after_transaction(State::Mail), State::Greeted);
            assert_eq!(after_transaction(State::Upgrade), State::Upgrade);
        }
    }

    mod capability_list {
        use super::*;

        #[test]
        fn test_minimal() {
            let config = ServerConfig::builder().enable_chunking(false).build();
            assert_eq!(
                capabilities(&config, false, &[]),
                vec!["PIPELINING", "8BITMIME", "ENHANCEDSTATUSCODES", "SIZE"]
            );
        }

        #[test]
        fn test_everything() {
            let config = ServerConfig::builder()
                .enable_smtputf8(true)
                .enable_requiretls(true)
                .enable_binarymime(true)
                .enable_dsn(true)
                .enable_xoorg(true)
                .max_message_bytes(1000)
                .max_recipients(10)
                .build();
            let mechanisms = vec!["PLAIN".to_string(), "LOGIN".to_string()];
            assert_eq!(
                capabilities(&config, true, &mechanisms),
                vec![
                    "PIPELINING",
                    "8BITMIME",
                    "ENHANCEDSTATUSCODES",
                    "CHUNKING",
                    "AUTH PLAIN LOGIN",
                    "SMTPUTF8",
                    "REQUIRETLS",
                    "BINARYMIME",
                    "DSN",
                    "XOORG",
                    "SIZE 1000",
                    "LIMITS RCPTMAX=10",
                ]
            );
        }

        #[test]
        fn test_requiretls_only_over_tls() {
            let config = ServerConfig::builder().enable_requiretls(true).build();
            assert!(!capabilities(&config, false, &[]).contains(&"REQUIRETLS".to_string()));
        }
    }
}
