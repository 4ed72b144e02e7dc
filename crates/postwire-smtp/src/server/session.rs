//! Backend traits the server drives.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use postwire_sasl::ServerMechanism;

use super::body::Body;
use crate::types::{MailOptions, RcptOptions, Status, VrfyOptions};
use crate::{Error, Result};

/// What a backend learns about a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Server-unique connection id, also recorded on the tracing span.
    pub id: u64,
    /// Remote address, if the transport has one.
    pub peer: Option<SocketAddr>,
    /// The transport was already encrypted when the connection was accepted.
    pub tls: bool,
}

/// Creates a [`Session`] for every accepted connection.
pub trait Backend: Send + Sync + 'static {
    /// Session type handed to the connection.
    type Session: Session + 'static;

    /// Creates a session. An error closes the connection before the greeting.
    fn new_session(&self, conn: &ConnInfo) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Per-connection callbacks, one method per SMTP command.
///
/// Methods returning `Result<()>` may fail with [`Error::Status`] to send
/// that reply. A positive status (2xx) counts as acceptance and replaces the
/// default reply. Any other error is logged and answered with a generic
/// `451`, or closes the connection where noted.
pub trait Session: Send {
    /// Discards the current transaction.
    ///
    /// `upgrade` is true for the first greeting after STARTTLS; any earlier
    /// authentication has been revoked.
    fn reset(&mut self, _upgrade: bool) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Releases the session. Always called once, with the error that ended
    /// the connection if any.
    fn close(&mut self, _err: Option<&Error>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Sets the reverse path of a new transaction. `from` is empty for the
    /// null sender `<>`.
    fn mail(&mut self, from: &str, opts: &MailOptions) -> impl Future<Output = Result<()>> + Send;

    /// Adds a recipient to the transaction.
    fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> impl Future<Output = Result<()>> + Send;

    /// Answers `VRFY`. `Ok` sends the default `252`.
    ///
    /// Errors other than a status close the connection.
    fn verify(&mut self, _addr: &str, _opts: &VrfyOptions) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Receives the message body and returns a queue id, possibly empty.
    ///
    /// For `DATA` the `354` reply is only sent on the first read, so a
    /// session may refuse the transaction without reading. Whatever the
    /// session leaves unread is discarded afterwards. Errors other than a
    /// status close the connection.
    fn data(&mut self, body: &mut Body<'_>) -> impl Future<Output = Result<String>> + Send;

    /// Mechanisms advertised in `EHLO`. Empty disables `AUTH`.
    fn auth_mechanisms(&mut self) -> impl Future<Output = Vec<String>> + Send {
        async { Vec::new() }
    }

    /// Returns the handler for one of the advertised mechanisms.
    fn auth(
        &mut self,
        _mechanism: &str,
    ) -> impl Future<Output = Result<Box<dyn ServerMechanism>>> + Send {
        async { Err(Status::ERR_AUTH_UNSUPPORTED.into()) }
    }

    /// Chooses the TLS configuration for `STARTTLS`, given the server's.
    fn starttls(
        &mut self,
        config: Arc<rustls::ServerConfig>,
    ) -> impl Future<Output = Result<Arc<rustls::ServerConfig>>> + Send {
        async move { Ok(config) }
    }
}
