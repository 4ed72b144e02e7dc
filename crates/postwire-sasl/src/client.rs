//! Client-side SASL mechanisms.
//!
//! Implements:
//! - PLAIN (RFC 4616) - Basic username/password authentication
//! - LOGIN - Legacy username/password prompt exchange
//! - OAUTHBEARER (RFC 7628) - Standard `OAuth2` authentication
//! - XOAUTH2 (Google/Microsoft proprietary) - Legacy `OAuth2` authentication

use crate::error::{Error, Result};

/// A client-side SASL mechanism.
///
/// The protocol layer calls [`Mechanism::start`] once to learn the
/// mechanism name and optional initial response, then [`Mechanism::next`]
/// for every server challenge until the server reports success or failure.
pub trait Mechanism: Send {
    /// Returns the mechanism name and the initial response.
    ///
    /// `None` means no initial response is sent. `Some(vec![])` means an
    /// empty initial response (`=` on the wire).
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism cannot start.
    fn start(&mut self) -> Result<(&'static str, Option<Vec<u8>>)>;

    /// Answers a server challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge is unexpected or signals failure.
    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// PLAIN mechanism (RFC 4616).
///
/// Format: `<authzid>\0<authcid>\0<password>`
#[derive(Debug, Clone)]
pub struct Plain {
    identity: String,
    username: String,
    password: String,
}

impl Plain {
    /// Creates a PLAIN mechanism. An empty `identity` acts as `username`.
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Mechanism for Plain {
    fn start(&mut self) -> Result<(&'static str, Option<Vec<u8>>)> {
        let message = format!("{}\0{}\0{}", self.identity, self.username, self.password);
        Ok((crate::PLAIN, Some(message.into_bytes())))
    }

    fn next(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::UnexpectedChallenge)
    }
}

/// LOGIN mechanism.
///
/// Sends the username as initial response and the password once the
/// server prompts with `Password:`.
#[derive(Debug, Clone)]
pub struct Login {
    username: String,
    password: String,
}

impl Login {
    /// Creates a LOGIN mechanism.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Mechanism for Login {
    fn start(&mut self) -> Result<(&'static str, Option<Vec<u8>>)> {
        Ok((crate::LOGIN, Some(self.username.clone().into_bytes())))
    }

    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if challenge.eq_ignore_ascii_case(b"Password:") {
            Ok(self.password.clone().into_bytes())
        } else {
            Err(Error::UnexpectedChallenge)
        }
    }
}

/// XOAUTH2 mechanism (Google/Microsoft proprietary).
///
/// Format: `user=<user>\x01auth=Bearer <token>\x01\x01`
#[derive(Debug, Clone)]
pub struct XOAuth2 {
    user: String,
    token: String,
}

impl XOAuth2 {
    /// Creates an XOAUTH2 mechanism.
    #[must_use]
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
        }
    }
}

impl Mechanism for XOAuth2 {
    fn start(&mut self) -> Result<(&'static str, Option<Vec<u8>>)> {
        let message = format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token);
        Ok((crate::XOAUTH2, Some(message.into_bytes())))
    }

    // A challenge carries the JSON error document.
    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Rejected(String::from_utf8_lossy(challenge).into_owned()))
    }
}

/// OAUTHBEARER mechanism (RFC 7628).
///
/// Format: `n,a=<user>,\x01host=<host>\x01port=<port>\x01auth=Bearer <token>\x01\x01`
#[derive(Debug, Clone)]
pub struct OAuthBearer {
    user: String,
    token: String,
    host: Option<String>,
    port: Option<u16>,
}

impl OAuthBearer {
    /// Creates an OAUTHBEARER mechanism.
    #[must_use]
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
            host: None,
            port: None,
        }
    }

    /// Sets the server host and port sent in the `host` and `port` keys.
    #[must_use]
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

impl Mechanism for OAuthBearer {
    fn start(&mut self) -> Result<(&'static str, Option<Vec<u8>>)> {
        let mut message = format!("n,a={},\x01", self.user);
        if let Some(host) = &self.host {
            message.push_str(&format!("host={host}\x01"));
        }
        if let Some(port) = self.port {
            message.push_str(&format!("port={port}\x01"));
        }
        message.push_str(&format!("auth=Bearer {}\x01\x01", self.token));
        Ok((crate::OAUTHBEARER, Some(message.into_bytes())))
    }

    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Rejected(String::from_utf8_lossy(challenge).into_owned()))
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
    fn test_plain_initial_response() {
        let mut plain = Plain::new("", "user@example.com", "password123");
        let (name, initial) = plain.start().unwrap();
        assert_eq!(name, "PLAIN");
        assert_eq!(initial.unwrap(), b"\0user@example.com\0password123");
    }

    #[test]
    fn test_plain_with_identity() {
        let mut plain = Plain::new("admin", "user", "pw");
        let (_, initial) = plain.start().unwrap();
        assert_eq!(initial.unwrap(), b"admin\0user\0pw");
    }

    #[test]
    fn test_plain_rejects_challenge() {
        let mut plain = Plain::new("", "user", "pw");
        assert_eq!(plain.next(b"anything"), Err(Error::UnexpectedChallenge));
    }

    #[test]
    fn test_login_exchange() {
        let mut login = Login::new("user", "secret");
        let (name, initial) = login.start().unwrap();
        assert_eq!(name, "LOGIN");
        assert_eq!(initial.unwrap(), b"user");
        assert_eq!(login.next(b"Password:").unwrap(), b"secret");
        assert!(login.next(b"Username:").is_err());
    }

    #[test]
    fn test_xoauth2_format() {
        let mut mech = XOAuth2::new("user@gmail.com", "token123");
        let (name, initial) = mech.start().unwrap();
        assert_eq!(name, "XOAUTH2");
        assert_eq!(
            initial.unwrap(),
            b"user=user@gmail.com\x01auth=Bearer token123\x01\x01"
        );
    }

    #[test]
    fn test_oauthbearer_format() {
        let mut mech = OAuthBearer::new("user@example.com", "token123");
        let (name, initial) = mech.start().unwrap();
        assert_eq!(name, "OAUTHBEARER");
        assert_eq!(
            initial.unwrap(),
            b"n,a=user@example.com,\x01auth=Bearer token123\x01\x01"
        );
    }

    #[test]
    fn test_oauthbearer_with_server() {
        let mut mech = OAuthBearer::new("u", "t").with_server("smtp.example.com", 587);
        let (_, initial) = mech.start().unwrap();
        let text = String::from_utf8(initial.unwrap()).unwrap();
        assert!(text.contains("host=smtp.example.com\x01port=587\x01"));
    }

    #[test]
    fn test_oauth_error_challenge() {
        let mut mech = OAuthBearer::new("u", "t");
        let err = mech.next(br#"{"status":"401"}"#).unwrap_err();
        assert!(matches!(err, Error::Rejected(msg) if msg.contains("401")));
    }
}
