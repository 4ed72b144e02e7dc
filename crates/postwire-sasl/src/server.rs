//! Server-side SASL mechanisms.

use crate::error::{Error, Result};

/// Outcome of one server step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this challenge and wait for the next client response.
    Challenge(Vec<u8>),
    /// The exchange completed successfully.
    Done,
}

/// A server-side SASL mechanism.
pub trait ServerMechanism: Send {
    /// Processes the next client response.
    ///
    /// The first call receives the initial response, or `None` when the
    /// client sent none.
    ///
    /// # Errors
    ///
    /// Returns an error if the response is malformed or the credentials
    /// are rejected.
    fn next(&mut self, response: Option<&[u8]>) -> Result<Step>;
}

/// Credential check for PLAIN: `(identity, username, password)`.
pub type PlainAuthenticator =
    Box<dyn FnMut(&str, &str, &str) -> Result<()> + Send>;

/// Credential check for LOGIN: `(username, password)`.
pub type LoginAuthenticator = Box<dyn FnMut(&str, &str) -> Result<()> + Send>;

/// PLAIN mechanism (RFC 4616), server role.
pub struct PlainServer {
    authenticate: PlainAuthenticator,
    done: bool,
}

impl PlainServer {
    /// Creates a PLAIN server that checks credentials with `authenticate`.
    pub fn new(
        authenticate: impl FnMut(&str, &str, &str) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            authenticate: Box::new(authenticate),
            done: false,
        }
    }
}

impl std::fmt::Debug for PlainServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainServer")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ServerMechanism for PlainServer {
    fn next(&mut self, response: Option<&[u8]>) -> Result<Step> {
        if self.done {
            return Err(Error::AlreadyDone);
        }
        let Some(response) = response else {
            return Ok(Step::Challenge(Vec::new()));
        };

        let text = std::str::from_utf8(response)
            .map_err(|_| Error::InvalidResponse("PLAIN message is not UTF-8".into()))?;
        let mut parts = text.split('\0');
        let (Some(identity), Some(username), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidResponse(
                "PLAIN message must have three NUL-separated fields".into(),
            ));
        };

        self.done = true;
        (self.authenticate)(identity, username, password)?;
        Ok(Step::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStep {
    Username,
    Password,
    Done,
}

/// LOGIN mechanism, server role.
pub struct LoginServer {
    authenticate: LoginAuthenticator,
    step: LoginStep,
    username: String,
}

impl LoginServer {
    /// Creates a LOGIN server that checks credentials with `authenticate`.
    pub fn new(authenticate: impl FnMut(&str, &str) -> Result<()> + Send + 'static) -> Self {
        Self {
            authenticate: Box::new(authenticate),
            step: LoginStep::Username,
            username: String::new(),
        }
    }
}

impl std::fmt::Debug for LoginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginServer")
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::InvalidResponse("LOGIN field is not UTF-8".into()))
}

impl ServerMechanism for LoginServer {
    fn next(&mut self, response: Option<&[u8]>) -> Result<Step> {
        match (self.step, response) {
            (LoginStep::Username, None) => Ok(Step::Challenge(b"Username:".to_vec())),
            (LoginStep::Username, Some(username)) => {
                self.username = utf8(username)?;
                self.step = LoginStep::Password;
                Ok(Step::Challenge(b"Password:".to_vec()))
            }
            (LoginStep::Password, Some(password)) => {
                let password = utf8(password)?;
                self.step = LoginStep::Done;
                (self.authenticate)(&self.username, &password)?;
                Ok(Step::Done)
            }
            (LoginStep::Password, None) => {
                Err(Error::InvalidResponse("missing password".into()))
            }
            (LoginStep::Done, _) => Err(Error::AlreadyDone),
        }
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
    use crate::client::{Login, Mechanism, Plain};

    fn check(user: &str, pass: &str) -> Result<()> {
        if user == "user" && pass == "secret" {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }

    #[test]
    fn test_plain_with_initial_response() {
        let mut server = PlainServer::new(|_, user, pass| check(user, pass));
        assert_eq!(server.next(Some(b"\0user\0secret")).unwrap(), Step::Done);
    }

    #[test]
    fn test_plain_without_initial_response() {
        let mut server = PlainServer::new(|_, user, pass| check(user, pass));
        assert_eq!(server.next(None).unwrap(), Step::Challenge(Vec::new()));
        assert_eq!(server.next(Some(b"\0user\0secret")).unwrap(), Step::Done);
        assert_eq!(server.next(Some(b"")), Err(Error::AlreadyDone));
    }

    #[test]
    fn test_plain_wrong_password() {
        let mut server = PlainServer::new(|_, user, pass| check(user, pass));
        assert_eq!(
            server.next(Some(b"\0user\0nope")),
            Err(Error::AuthenticationFailed)
        );
    }

    #[test]
    fn test_plain_malformed() {
        let mut server = PlainServer::new(|_, _, _| Ok(()));
        assert!(matches!(
            server.next(Some(b"user\0secret")),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_plain_passes_identity() {
        let mut server = PlainServer::new(|identity, _, _| {
            if identity == "admin" {
                Ok(())
            } else {
                Err(Error::AuthenticationFailed)
            }
        });
        assert_eq!(server.next(Some(b"admin\0user\0pw")).unwrap(), Step::Done);
    }

    #[test]
    fn test_login_prompts() {
        let mut server = LoginServer::new(check);
        assert_eq!(
            server.next(None).unwrap(),
            Step::Challenge(b"Username:".to_vec())
        );
        assert_eq!(
            server.next(Some(b"user")).unwrap(),
            Step::Challenge(b"Password:".to_vec())
        );
        assert_eq!(server.next(Some(b"secret")).unwrap(), Step::Done);
    }

    #[test]
    fn test_client_and_server_agree() {
        let mut client = Login::new("user", "secret");
        let mut server = LoginServer::new(check);

        let (_, initial) = client.start().unwrap();
        let Step::Challenge(prompt) = server.next(initial.as_deref()).unwrap() else {
            panic!("expected a password prompt");
        };
        let answer = client.next(&prompt).unwrap();
        assert_eq!(server.next(Some(&answer)).unwrap(), Step::Done);

        let mut client = Plain::new("", "user", "secret");
        let mut server = PlainServer::new(|_, user, pass| check(user, pass));
        let (_, initial) = client.start().unwrap();
        assert_eq!(server.next(initial.as_deref()).unwrap(), Step::Done);
    }
}
