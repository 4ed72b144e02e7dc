//! Error types for SMTP operations.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Status;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
///
/// Errors are cloneable so a client can replay a cached handshake failure
/// on every later call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Server name is not a valid DNS name or IP address.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(String),

    /// Protocol status: a reply code, an enhanced code and a message.
    #[error(transparent)]
    Status(Status),

    /// Reply that did not match the expected code, before enhanced-code parsing.
    #[error("SMTP error {code}: {message}")]
    SmtpError {
        /// Reply code (e.g., 550).
        code: u16,
        /// Reply text, lines joined with `\n`.
        message: String,
    },

    /// Malformed data on the wire. The stream is out of sync.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A line exceeded the configured maximum length.
    ///
    /// Sticky: every later read on the same connection fails the same way.
    #[error("Line too long")]
    LineTooLong,

    /// The peer sent `RSET` where another `BDAT` chunk was expected.
    #[error("Transaction reset by client")]
    Reset,

    /// The peer sent `QUIT` where another `BDAT` chunk was expected.
    #[error("Client quit during transaction")]
    Quit,

    /// The peer went away before the message body was complete.
    #[error("Connection lost")]
    ConnectionLost,

    /// Local input rejected before any network I/O.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Feature not supported by the peer.
    #[error("Server does not support {0}")]
    NotSupported(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// A deadline expired.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server was already closed or shut down.
    #[error("Server closed")]
    ServerClosed,

    /// SASL mechanism error.
    #[error("SASL error: {0}")]
    Sasl(#[from] postwire_sasl::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<rustls::pki_types::InvalidDnsNameError> for Error {
    fn from(err: rustls::pki_types::InvalidDnsNameError) -> Self {
        Self::InvalidDnsName(err.to_string())
    }
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::SmtpError {
            code,
            message: message.into(),
        }
    }

    /// Converts a generic reply error into a [`Status`], parsing the
    /// enhanced code when present. Other errors are returned unchanged.
    #[must_use]
    pub fn into_status_error(self) -> Self {
        match self {
            Self::SmtpError { code, message } => Self::Status(Status::from_reply(code, &message)),
            other => other,
        }
    }

    /// Returns the protocol status carried by this error.
    ///
    /// The `Reset` and `Quit` sentinels map to their reply statuses.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Status(status) => Some(status.clone()),
            Self::Reset => Some(Status::RESET),
            Self::Quit => Some(Status::QUIT),
            _ => None,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status(status) => status.is_permanent(),
            Self::SmtpError { code, .. } => *code >= 500 && *code < 600,
            _ => false,
        }
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Status(status) => status.is_temporary(),
            Self::SmtpError { code, .. } => *code >= 400 && *code < 500,
            _ => false,
        }
    }

    /// Returns true if the connection cannot be used after this error.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::Protocol(_)
                | Self::LineTooLong
                | Self::ConnectionLost
                | Self::Timeout(_)
        )
    }

    /// Returns true if the peer closed the stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
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
    use crate::types::EnhancedCode;

    #[test]
    fn test_into_status_error_parses_enhanced_code() {
        let err = Error::smtp_error(550, "5.1.1 No such user").into_status_error();
        let Error::Status(status) = err else {
            panic!("expected status");
        };
        assert_eq!(status.code.as_u16(), 550);
        assert_eq!(status.enhanced, EnhancedCode::new(5, 1, 1));
        assert_eq!(status.message, "No such user");
    }

    #[test]
    fn test_sentinels_map_to_status() {
        assert_eq!(Error::Reset.status(), Some(Status::RESET));
        assert_eq!(Error::Quit.status(), Some(Status::QUIT));
        assert_eq!(Error::ConnectionLost.status(), None);
    }

    #[test]
    fn test_classification() {
        assert!(Error::smtp_error(451, "later").is_temporary());
        assert!(Error::smtp_error(550, "no").is_permanent());
        assert!(Error::Status(Status::ERR_DATA_TOO_LARGE).is_permanent());
        assert!(Error::LineTooLong.is_connection_fatal());
        assert!(!Error::Status(Status::ERR_CONNECTION).is_connection_fatal());
    }

    #[test]
    fn test_eof_detection() {
        let err = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "closed"));
        assert!(err.is_eof());
        assert!(!Error::ConnectionLost.is_eof());
    }

    #[test]
    fn test_clone_keeps_io_error() {
        let err = Error::from(io::Error::other("boom"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
