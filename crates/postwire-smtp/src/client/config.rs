//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsConnector;

use crate::connection::create_tls_connector;

/// Default per-chunk limit for `BDAT`, 2 MiB.
pub(crate) const DEFAULT_CHUNKING_MAX_SIZE: usize = 2 * 1024 * 1024;

/// How [`Client::connect`](super::Client::connect) secures the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Security {
    /// Upgrade with STARTTLS when the server offers it, stay plain otherwise.
    #[default]
    PreferStartTls,
    /// Never encrypt.
    Plain,
    /// TLS from the first byte (implicit TLS, usually port 465).
    Tls,
    /// Require STARTTLS; fail if the server does not offer it.
    StartTls,
}

/// SMTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name sent with `EHLO` and `HELO`.
    pub local_name: String,
    /// Connection security.
    pub security: Security,
    /// TLS configuration. `None` trusts the bundled web PKI roots.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Deadline for establishing the TCP connection.
    pub dial_timeout: Option<Duration>,
    /// Deadline for the TLS handshake.
    pub tls_handshake_timeout: Option<Duration>,
    /// Deadline for each command and its reply, and for the greeting.
    pub command_timeout: Option<Duration>,
    /// Deadline for the final reply after the message body.
    pub submission_timeout: Option<Duration>,
    /// Maximum reply line length, 0 for no limit.
    pub max_line_length: usize,
    /// Read buffer size.
    pub reader_size: usize,
    /// Write buffer size.
    pub writer_size: usize,
    /// Largest `BDAT` chunk. 0 means no limit, a negative value disables
    /// `BDAT` altogether.
    pub chunking_max_size: i64,
    /// Collect small writes into full chunks when the body size is unknown.
    pub chunking_buffer: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_name: "localhost".to_string(),
            security: Security::default(),
            tls: None,
            dial_timeout: Some(Duration::from_secs(30)),
            tls_handshake_timeout: Some(Duration::from_secs(30)),
            // RFC 5321 recommends 5 minutes.
            command_timeout: Some(Duration::from_secs(5 * 60)),
            // 10 minutes for the final reply plus slack for relays that
            // forward before answering.
            submission_timeout: Some(Duration::from_secs(12 * 60)),
            max_line_length: 2000,
            reader_size: 4096,
            writer_size: 4096,
            chunking_max_size: 2 * 1024 * 1024,
            chunking_buffer: true,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        match &self.tls {
            Some(tls) => TlsConnector::from(Arc::clone(tls)),
            None => create_tls_connector(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `EHLO` name.
    #[must_use]
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.config.local_name = name.into();
        self
    }

    /// Sets the connection security.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.config.security = security;
        self
    }

    /// Sets the TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Sets the dial deadline.
    #[must_use]
    pub const fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = Some(timeout);
        self
    }

    /// Sets the TLS handshake deadline.
    #[must_use]
    pub const fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.tls_handshake_timeout = Some(timeout);
        self
    }

    /// Sets the per-command deadline.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = Some(timeout);
        self
    }

    /// Sets the deadline for the reply to a complete message.
    #[must_use]
    pub const fn submission_timeout(mut self, timeout: Duration) -> Self {
        self.config.submission_timeout = Some(timeout);
        self
    }

    /// Sets the reply line length limit.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the read buffer size.
    #[must_use]
    pub const fn reader_size(mut self, size: usize) -> Self {
        self.config.reader_size = size;
        self
    }

    /// Sets the write buffer size.
    #[must_use]
    pub const fn writer_size(mut self, size: usize) -> Self {
        self.config.writer_size = size;
        self
    }

    /// Sets the largest `BDAT` chunk; see [`ClientConfig::chunking_max_size`].
    #[must_use]
    pub const fn chunking_max_size(mut self, size: i64) -> Self {
        self.config.chunking_max_size = size;
        self
    }

    /// Toggles chunk buffering.
    #[must_use]
    pub const fn chunking_buffer(mut self, enabled: bool) -> Self {
        self.config.chunking_buffer = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
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
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.local_name, "localhost");
        assert_eq!(config.security, Security::PreferStartTls);
        assert_eq!(config.command_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.submission_timeout, Some(Duration::from_secs(720)));
        assert_eq!(config.chunking_max_size, 2_097_152);
        assert!(config.chunking_buffer);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .local_name("client.example.com")
            .security(Security::Plain)
            .command_timeout(Duration::from_secs(10))
            .chunking_max_size(-1)
            .chunking_buffer(false)
            .max_line_length(0)
            .build();
        assert_eq!(config.local_name, "client.example.com");
        assert_eq!(config.security, Security::Plain);
        assert_eq!(config.command_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.chunking_max_size, -1);
        assert!(!config.chunking_buffer);
        assert_eq!(config.max_line_length, 0);
    }
}
