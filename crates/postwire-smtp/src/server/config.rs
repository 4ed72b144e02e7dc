//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

/// Default line length limit for commands, RFC 5321 allows 512.
const DEFAULT_MAX_LINE_LENGTH: usize = 2000;

/// Default read and write buffer size.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// SMTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name announced in the greeting.
    pub hostname: String,
    /// Address used by [`Server::listen_and_serve`](super::Server::listen_and_serve).
    pub addr: String,
    /// TLS configuration for STARTTLS and implicit TLS.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Perform the TLS handshake before the greeting.
    pub implicit_tls: bool,
    /// Refuse mail commands until the connection is encrypted.
    pub enforce_secure_connection: bool,
    /// Refuse mail commands until the client authenticated.
    pub enforce_authentication: bool,
    /// Maximum command line length, 0 for no limit.
    pub max_line_length: usize,
    /// Maximum message size in bytes, 0 for no limit.
    pub max_message_bytes: u64,
    /// Maximum recipients per transaction, 0 for no limit.
    pub max_recipients: usize,
    /// Deadline for every read from the client.
    pub read_timeout: Option<Duration>,
    /// Deadline for every reply written to the client.
    pub write_timeout: Option<Duration>,
    /// Read buffer size.
    pub reader_size: usize,
    /// Write buffer size.
    pub writer_size: usize,
    /// Advertise CHUNKING (RFC 3030) and accept `BDAT`.
    pub enable_chunking: bool,
    /// Advertise SMTPUTF8 (RFC 6531).
    pub enable_smtputf8: bool,
    /// Advertise REQUIRETLS (RFC 8689) on encrypted connections.
    pub enable_requiretls: bool,
    /// Advertise BINARYMIME (RFC 3030).
    pub enable_binarymime: bool,
    /// Advertise DSN (RFC 3461).
    pub enable_dsn: bool,
    /// Advertise XOORG.
    pub enable_xoorg: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            addr: "0.0.0.0:25".to_string(),
            tls: None,
            implicit_tls: false,
            enforce_secure_connection: false,
            enforce_authentication: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_message_bytes: 0,
            max_recipients: 0,
            read_timeout: None,
            write_timeout: None,
            reader_size: DEFAULT_BUFFER_SIZE,
            writer_size: DEFAULT_BUFFER_SIZE,
            enable_chunking: true,
            enable_smtputf8: false,
            enable_requiretls: false,
            enable_binarymime: false,
            enable_dsn: false,
            enable_xoorg: false,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the greeting hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Sets the listen address.
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Sets the TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Enables implicit TLS.
    #[must_use]
    pub const fn implicit_tls(mut self, enabled: bool) -> Self {
        self.config.implicit_tls = enabled;
        self
    }

    /// Requires TLS before mail commands.
    #[must_use]
    pub const fn enforce_secure_connection(mut self, enabled: bool) -> Self {
        self.config.enforce_secure_connection = enabled;
        self
    }

    /// Requires authentication before mail commands.
    #[must_use]
    pub const fn enforce_authentication(mut self, enabled: bool) -> Self {
        self.config.enforce_authentication = enabled;
        self
    }

    /// Sets the command line length limit.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the message size limit.
    #[must_use]
    pub const fn max_message_bytes(mut self, max: u64) -> Self {
        self.config.max_message_bytes = max;
        self
    }

    /// Sets the recipient limit.
    #[must_use]
    pub const fn max_recipients(mut self, max: usize) -> Self {
        self.config.max_recipients = max;
        self
    }

    /// Sets the read deadline.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Sets the write deadline.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
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

    /// Toggles CHUNKING.
    #[must_use]
    pub const fn enable_chunking(mut self, enabled: bool) -> Self {
        self.config.enable_chunking = enabled;
        self
    }

    /// Toggles SMTPUTF8.
    #[must_use]
    pub const fn enable_smtputf8(mut self, enabled: bool) -> Self {
        self.config.enable_smtputf8 = enabled;
        self
    }

    /// Toggles REQUIRETLS.
    #[must_use]
    pub const fn enable_requiretls(mut self, enabled: bool) -> Self {
        self.config.enable_requiretls = enabled;
        self
    }

    /// Toggles BINARYMIME.
    #[must_use]
    pub const fn enable_binarymime(mut self, enabled: bool) -> Self {
        self.config.enable_binarymime = enabled;
        self
    }

    /// Toggles DSN.
    #[must_use]
    pub const fn enable_dsn(mut self, enabled: bool) -> Self {
        self.config.enable_dsn = enabled;
        self
    }

    /// Toggles XOORG.
    #[must_use]
    pub const fn enable_xoorg(mut self, enabled: bool) -> Self {
        self.config.enable_xoorg = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
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
        let config = ServerConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.addr, "0.0.0.0:25");
        assert_eq!(config.max_line_length, 2000);
        assert_eq!(config.reader_size, 4096);
        assert!(config.enable_chunking);
        assert!(!config.enable_dsn);
        assert!(config.tls.is_none());
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .hostname("mx.example.com")
            .addr("127.0.0.1:2525")
            .max_message_bytes(1024)
            .max_recipients(5)
            .read_timeout(Duration::from_secs(30))
            .enable_dsn(true)
            .enable_chunking(false)
            .build();

        assert_eq!(config.hostname, "mx.example.com");
        assert_eq!(config.addr, "127.0.0.1:2525");
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.max_recipients, 5);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert!(config.enable_dsn);
        assert!(!config.enable_chunking);
    }
}
