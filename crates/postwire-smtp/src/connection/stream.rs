//! Transport streams for SMTP connections.

#![allow(clippy::missing_errors_doc)]

use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use super::with_deadline;
use crate::{Error, Result};

/// Byte stream usable as an SMTP transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A stream that is plaintext or TLS, on either side of the conversation.
///
/// STARTTLS upgrades happen in place, so the framing layer above keeps
/// its buffers and pipeline state across the handshake.
pub enum SmtpStream {
    /// Plaintext stream.
    Plain(Box<dyn AsyncStream>),
    /// TLS stream opened by this side as a client.
    ClientTls(Box<client::TlsStream<Box<dyn AsyncStream>>>),
    /// TLS stream accepted by this side as a server.
    ServerTls(Box<server::TlsStream<Box<dyn AsyncStream>>>),
    /// The transport was consumed by a failed handshake.
    Detached,
}

impl std::fmt::Debug for SmtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::ClientTls(_) => "ClientTls",
            Self::ServerTls(_) => "ServerTls",
            Self::Detached => "Detached",
        };
        f.debug_tuple("SmtpStream").field(&kind).finish()
    }
}

impl SmtpStream {
    /// Wraps a plaintext transport.
    pub fn plain<S: AsyncStream + 'static>(stream: S) -> Self {
        Self::Plain(Box::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::ClientTls(_) | Self::ServerTls(_))
    }

    fn take_plain(&mut self) -> Result<Box<dyn AsyncStream>> {
        match mem::replace(self, Self::Detached) {
            Self::Plain(inner) => Ok(inner),
            other => {
                *self = other;
                Err(Error::InvalidState("Stream is already TLS".to_string()))
            }
        }
    }

    /// Runs a client TLS handshake over the current plaintext stream.
    ///
    /// On failure the stream is left detached and must be dropped.
    pub async fn start_tls_client(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let inner = self.take_plain()?;
        let tls = connector.connect(server_name, inner).await?;
        *self = Self::ClientTls(Box::new(tls));
        Ok(())
    }

    /// Runs a server TLS handshake over the current plaintext stream.
    ///
    /// On failure the stream is left detached and must be dropped.
    pub async fn accept_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let inner = self.take_plain()?;
        let tls = acceptor.accept(inner).await?;
        *self = Self::ServerTls(Box::new(tls));
        Ok(())
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream detached after TLS failure")
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
            Self::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Detached => Poll::Ready(Ok(())),
        }
    }
}

/// Creates a TLS connector trusting the bundled web PKI roots.
#[must_use]
pub fn create_tls_connector() -> TlsConnector {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Resolves the name presented for certificate verification.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    Ok(ServerName::try_from(host.to_string())?)
}

/// Opens a plaintext TCP connection.
pub async fn connect_plain(addr: &str, timeout: Option<Duration>) -> Result<SmtpStream> {
    let tcp = with_deadline(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
    Ok(SmtpStream::plain(tcp))
}

/// Opens a TCP connection and runs the TLS handshake immediately.
pub async fn connect_tls(
    addr: &str,
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    dial_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
) -> Result<SmtpStream> {
    let mut stream = connect_plain(addr, dial_timeout).await?;
    with_deadline(
        handshake_timeout,
        stream.start_tls_client(connector, server_name),
    )
    .await?;
    Ok(stream)
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_server_name() {
        assert!(server_name("mail.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(matches!(
            server_name("bad name!"),
            Err(Error::InvalidDnsName(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_stream_passes_bytes() {
        let (left, mut right) = tokio::io::duplex(64);
        let mut stream = SmtpStream::plain(left);
        assert!(!stream.is_tls());

        stream.write_all(b"EHLO x\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EHLO x\r\n");
    }

    #[tokio::test]
    async fn test_failed_handshake_detaches() {
        let (left, mut right) = tokio::io::duplex(8192);
        let mut stream = SmtpStream::plain(left);
        right.write_all(b"not a tls record\r\n").await.unwrap();

        let connector = create_tls_connector();
        let name = server_name("example.com").unwrap();
        assert!(stream.start_tls_client(&connector, name).await.is_err());
        assert!(matches!(stream, SmtpStream::Detached));

        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
