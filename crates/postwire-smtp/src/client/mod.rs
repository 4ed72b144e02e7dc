//! SMTP client.
//!
//! A [`Client`] drives one connection: greeting, `EHLO` (falling back to
//! `HELO`), STARTTLS, SASL `AUTH`, the envelope and a `DATA` or `BDAT`
//! body. Operations run one at a time; use one client per concurrent
//! delivery.
//!
//! Server replies that are not the expected code come back as
//! [`Error::Status`]. Once an operation fails with a connection-fatal
//! error (see [`Error::is_connection_fatal`]) every later operation returns
//! the same error until the client is closed.

mod config;
mod data;

pub use config::{ClientConfig, ClientConfigBuilder, Security};
pub use data::MessageWriter;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use postwire_sasl::Mechanism;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::codec::xtext::{
    check_notify_set, encode_utf8_addr_unitext, encode_utf8_addr_xtext, encode_xtext,
    is_printable_ascii,
};
use crate::connection::{
    AsyncStream, SmtpStream, TextConn, connect_plain, connect_tls, server_name as tls_name,
    with_deadline,
};
use crate::types::{
    DsnAddressType, DsnNotify, Extensions, RcptOptions, Reply, SendOptions, Utf8Mode,
    VerifyOptions,
};
use crate::{Error, Result};

/// Below this chunk size, buffering writes costs more than it saves.
const MIN_BUFFERED_CHUNK: usize = 4096;

fn closed() -> Error {
    Error::InvalidState("client is closed".to_string())
}

/// Rejects values that would smuggle extra lines into a command.
fn validate_line(line: &str) -> Result<()> {
    if line.contains(['\r', '\n']) {
        return Err(Error::InvalidInput(
            "a line must not contain CR or LF".to_string(),
        ));
    }
    Ok(())
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// SMTP client connection.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    text: Option<TextConn<SmtpStream>>,
    greeting: Option<Result<()>>,
    hello: Option<Result<()>>,
    /// Connection-fatal error returned by every later operation.
    failed: Option<Error>,
    extensions: Extensions,
    server_name: String,
    recipients: Vec<String>,
}

impl Client {
    /// Connects to `addr` (`host:port`) as configured by
    /// [`ClientConfig::security`], and completes the greeting and `EHLO`.
    ///
    /// # Errors
    ///
    /// Fails on dial, TLS and handshake errors, and with
    /// [`Error::NotSupported`] when [`Security::StartTls`] is required but
    /// not offered.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self> {
        let host = host_of(addr);
        let security = config.security;

        if security == Security::Tls {
            let connector = config.connector();
            let stream = connect_tls(
                addr,
                &connector,
                tls_name(host)?,
                config.dial_timeout,
                config.tls_handshake_timeout,
            )
            .await?;
            let mut client = Self::with_transport(stream, config);
            client.hello().await?;
            return Ok(client);
        }

        let stream = connect_plain(addr, config.dial_timeout).await?;
        let mut client = Self::with_transport(stream, config);
        client.hello().await?;

        match security {
            Security::StartTls if !client.extensions.contains("STARTTLS") => {
                client.shutdown().await;
                Err(Error::NotSupported("STARTTLS".to_string()))
            }
            Security::StartTls => {
                client.starttls(host).await?;
                Ok(client)
            }
            Security::PreferStartTls if client.extensions.contains("STARTTLS") => {
                client.starttls(host).await?;
                Ok(client)
            }
            Security::PreferStartTls => {
                warn!("{addr} does not offer STARTTLS, continuing without encryption");
                Ok(client)
            }
            Security::Plain | Security::Tls => Ok(client),
        }
    }

    /// Wraps an established transport. Nothing is exchanged until the
    /// first operation.
    ///
    /// [`ClientConfig::security`] is not applied; call
    /// [`starttls`](Self::starttls) to upgrade.
    pub fn from_stream<S: AsyncStream + 'static>(stream: S, config: ClientConfig) -> Self {
        Self::with_transport(SmtpStream::plain(stream), config)
    }

    fn with_transport(stream: SmtpStream, config: ClientConfig) -> Self {
        let text = TextConn::with_buffer_sizes(
            config.reader_size,
            config.writer_size,
            stream,
            config.max_line_length,
        );
        Self {
            config,
            text: Some(text),
            greeting: None,
            hello: None,
            failed: None,
            extensions: Extensions::new(),
            server_name: String::new(),
            recipients: Vec::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the name the server announced in its greeting.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Returns true if the connection is encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.text.as_ref().is_some_and(|text| text.get_ref().is_tls())
    }

    /// Returns the parameters of an advertised extension, if present.
    #[must_use]
    pub fn extension(&self, keyword: &str) -> Option<&str> {
        self.extensions.get(keyword)
    }

    /// Returns every advertised extension.
    #[must_use]
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Returns true if the server advertised the SASL `mechanism`.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.extensions.supports_auth(mechanism)
    }

    /// Returns the advertised `SIZE` limit; `Some(0)` means no limit.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.extensions.max_message_size()
    }

    /// Returns the recipients accepted since the last `MAIL`.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    fn transport(&mut self) -> Result<&mut TextConn<SmtpStream>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.text.as_mut().ok_or_else(closed)
    }

    /// Hands the transport to a body writer along with the sticky error
    /// slot, so the writer can report a connection it left out of step.
    fn open_body(&mut self) -> Result<(&mut TextConn<SmtpStream>, &mut Option<Error>)> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let text = self.text.as_mut().ok_or_else(closed)?;
        Ok((text, &mut self.failed))
    }

    /// Sends a command and reads its reply. `logged` replaces the line in
    /// the debug log.
    async fn exchange(&mut self, expect: u16, line: &str, logged: &str) -> Result<Reply> {
        let timeout = self.config.command_timeout;
        let text = self.transport()?;
        debug!("C: {logged}");
        let result = with_deadline(timeout, text.cmd(expect, line))
            .await
            .map_err(Error::into_status_error);
        match &result {
            Ok(reply) => debug!("S: {} {}", reply.code, reply.text()),
            Err(e) if e.is_connection_fatal() => {
                debug!("connection failed: {e}");
                self.failed = Some(e.clone());
            }
            Err(e) => debug!("S: {e}"),
        }
        result
    }

    async fn cmd(&mut self, expect: u16, line: &str) -> Result<Reply> {
        self.exchange(expect, line, line).await
    }

    /// Drops the transport after a failed handshake step.
    async fn shutdown(&mut self) {
        if let Some(mut text) = self.text.take()
            && let Err(e) = text.shutdown().await
        {
            debug!("shutdown failed: {e}");
        }
    }

    /// Reads the server greeting once. Later calls return the same outcome.
    async fn greet(&mut self) -> Result<()> {
        if let Some(outcome) = &self.greeting {
            return outcome.clone();
        }

        let timeout = self.config.command_timeout;
        let text = self.transport()?;
        let result = with_deadline(timeout, text.read_response(220))
            .await
            .map_err(Error::into_status_error);
        let outcome = match result {
            Ok(reply) => {
                debug!("S: {} {}", reply.code, reply.text());
                self.server_name = reply.first_word().to_string();
                Ok(())
            }
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        };
        self.greeting = Some(outcome.clone());
        outcome
    }

    /// Reads the greeting if needed and runs `EHLO`, or `HELO` when the
    /// server does not know `EHLO`.
    ///
    /// Runs once per connection and again after STARTTLS; every other
    /// operation calls it first. A failure closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the greeting or hello failure.
    pub async fn hello(&mut self) -> Result<()> {
        if let Some(outcome) = &self.hello {
            return outcome.clone();
        }
        validate_line(&self.config.local_name)?;
        self.greet().await?;

        let ehlo = self.ehlo().await;
        let outcome = match ehlo {
            Err(e) if e.status().is_some_and(|s| matches!(s.code.as_u16(), 500 | 502)) => {
                warn!("EHLO refused ({e}), falling back to HELO");
                self.helo().await
            }
            other => other,
        };
        if outcome.is_err() {
            self.shutdown().await;
        }
        self.hello = Some(outcome.clone());
        outcome
    }

    async fn ehlo(&mut self) -> Result<()> {
        let line = format!("EHLO {}", self.config.local_name);
        let reply = self.cmd(250, &line).await?;
        self.extensions = Extensions::from_ehlo(&reply.lines);
        Ok(())
    }

    async fn helo(&mut self) -> Result<()> {
        self.extensions.clear();
        let line = format!("HELO {}", self.config.local_name);
        self.cmd(250, &line).await.map(|_| ())
    }

    /// Upgrades the connection with STARTTLS and greets again.
    ///
    /// `server_name` is checked against the server certificate. Cached
    /// capabilities are discarded.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal (after sending `QUIT`), a handshake
    /// error (the connection is closed), or a protocol error if the server
    /// sent data ahead of the handshake.
    pub async fn starttls(&mut self, server_name: &str) -> Result<()> {
        let name = tls_name(server_name)?;
        self.hello().await?;
        if self.is_tls() {
            return Err(Error::InvalidState(
                "connection is already encrypted".to_string(),
            ));
        }

        if let Err(e) = self.cmd(220, "STARTTLS").await {
            if let Err(quit) = self.quit().await {
                debug!("QUIT after refused STARTTLS failed: {quit}");
            }
            return Err(e);
        }

        let connector = self.config.connector();
        let timeout = self.config.tls_handshake_timeout;
        let text = self.transport()?;
        // Bytes that arrived before the handshake were not protected by it.
        if text.has_buffered_input() {
            self.shutdown().await;
            return Err(Error::Protocol(
                "data received ahead of the TLS handshake".to_string(),
            ));
        }
        let handshake =
            with_deadline(timeout, text.get_mut().start_tls_client(&connector, name)).await;
        if let Err(e) = handshake {
            self.shutdown().await;
            return Err(e);
        }
        debug!("TLS established with {server_name}");

        self.extensions.clear();
        self.hello = None;
        self.hello().await
    }

    /// Authenticates with a SASL mechanism.
    ///
    /// If the mechanism fails mid-exchange the client sends `*` to abort
    /// before returning the error. Responses are never logged.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or the mechanism's error.
    pub async fn auth<M>(&mut self, mechanism: &mut M) -> Result<()>
    where
        M: Mechanism + ?Sized,
    {
        self.hello().await?;
        let (name, initial) = mechanism.start()?;

        let (mut line, mut logged) = match initial {
            None => (format!("AUTH {name}"), format!("AUTH {name}")),
            Some(response) if response.is_empty() => {
                (format!("AUTH {name} ="), format!("AUTH {name} ="))
            }
            Some(response) => (
                format!("AUTH {name} {}", STANDARD.encode(response)),
                format!("AUTH {name} ****"),
            ),
        };

        loop {
            let reply = self.exchange(0, &line, &logged).await?;
            match reply.code.as_u16() {
                235 => return Ok(()),
                334 => {
                    let response = STANDARD
                        .decode(reply.text())
                        .map_err(|e| Error::Protocol(format!("invalid SASL challenge: {e}")))
                        .and_then(|challenge| mechanism.next(&challenge).map_err(Error::from));
                    match response {
                        Ok(response) => {
                            line = STANDARD.encode(response);
                            logged = "****".to_string();
                        }
                        Err(e) => {
                            if let Err(abort) = self.cmd(501, "*").await {
                                debug!("AUTH abort failed: {abort}");
                            }
                            return Err(e);
                        }
                    }
                }
                code => return Err(Error::smtp_error(code, reply.text()).into_status_error()),
            }
        }
    }

    /// Starts a transaction with `MAIL FROM:<from>`. An empty `from` is the
    /// null sender.
    ///
    /// `BODY=8BITMIME` is added when the server supports it. Other
    /// parameters are sent only when their extension is advertised, except
    /// `REQUIRETLS` and a forced `SMTPUTF8`, which fail locally instead.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for CR/LF in `from` or a non-printable
    /// envelope id, [`Error::NotSupported`] for a demanded extension the
    /// server lacks, or the server's refusal.
    pub async fn mail(&mut self, from: &str, opts: &SendOptions) -> Result<()> {
        validate_line(from)?;
        self.hello().await?;

        let ext = &self.extensions;
        let mut line = format!("MAIL FROM:<{from}>");
        if ext.contains("8BITMIME") {
            line.push_str(" BODY=8BITMIME");
        }
        if ext.contains("SIZE") && opts.size != 0 {
            line.push_str(&format!(" SIZE={}", opts.size));
        }
        if opts.require_tls {
            if !ext.contains("REQUIRETLS") {
                return Err(Error::NotSupported("REQUIRETLS".to_string()));
            }
            line.push_str(" REQUIRETLS");
        }
        match opts.utf8 {
            Utf8Mode::Disabled => {}
            _ if ext.contains("SMTPUTF8") => line.push_str(" SMTPUTF8"),
            Utf8Mode::Force => return Err(Error::NotSupported("SMTPUTF8".to_string())),
            Utf8Mode::Prefer => {}
        }
        if ext.contains("DSN") {
            if let Some(ret) = opts.ret {
                line.push_str(" RET=");
                line.push_str(ret.as_str());
            }
            if let Some(id) = opts.envelope_id.as_deref().filter(|id| !id.is_empty()) {
                if !is_printable_ascii(id) {
                    return Err(Error::InvalidInput(
                        "malformed ENVID parameter value".to_string(),
                    ));
                }
                line.push_str(" ENVID=");
                line.push_str(&encode_xtext(id));
            }
        }
        // Both are optional for the server; dropping them is safe.
        if let Some(auth) = opts.auth.as_deref()
            && ext.contains("AUTH")
        {
            line.push_str(" AUTH=");
            if auth.is_empty() {
                line.push_str("<>");
            } else {
                line.push_str(&encode_xtext(auth));
            }
        }
        if let Some(xoorg) = opts.xoorg.as_deref()
            && ext.contains("XOORG")
        {
            line.push_str(" XOORG=");
            line.push_str(&encode_xtext(xoorg));
        }

        self.recipients.clear();
        self.cmd(250, &line).await.map(|_| ())
    }

    /// Adds a recipient with `RCPT TO:<to>`.
    ///
    /// DSN parameters are sent only when the server advertises `DSN`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for CR/LF in `to`, a malformed `NOTIFY` set
    /// or a non-printable RFC 822 original recipient, or the server's
    /// refusal.
    pub async fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> Result<()> {
        validate_line(to)?;
        self.hello().await?;

        let mut line = format!("RCPT TO:<{to}>");
        if self.extensions.contains("DSN") {
            if !opts.notify.is_empty() {
                check_notify_set(&opts.notify)?;
                let notify: Vec<&str> =
                    opts.notify.iter().copied().map(DsnNotify::as_str).collect();
                line.push_str(" NOTIFY=");
                line.push_str(&notify.join(","));
            }
            if let Some((kind, addr)) = &opts.original_recipient
                && !addr.is_empty()
            {
                let encoded = match kind {
                    DsnAddressType::Rfc822 => {
                        if !is_printable_ascii(addr) {
                            return Err(Error::InvalidInput(format!("illegal address: {addr}")));
                        }
                        encode_xtext(addr)
                    }
                    DsnAddressType::Utf8 if self.extensions.contains("SMTPUTF8") => {
                        encode_utf8_addr_unitext(addr)
                    }
                    DsnAddressType::Utf8 => encode_utf8_addr_xtext(addr),
                };
                line.push_str(&format!(" ORCPT={kind};{encoded}"));
            }
        }

        self.cmd(25, &line).await?;
        self.recipients.push(to.to_string());
        Ok(())
    }

    /// Asks the server to verify an address.
    ///
    /// Both `250` and the non-committal `252` count as success.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for CR/LF in `addr`, [`Error::NotSupported`]
    /// for a forced `SMTPUTF8` the server lacks, or the server's refusal.
    pub async fn verify(&mut self, addr: &str, opts: &VerifyOptions) -> Result<Reply> {
        validate_line(addr)?;
        self.hello().await?;

        let mut line = format!("VRFY {addr}");
        match opts.utf8 {
            Utf8Mode::Disabled => {}
            _ if self.extensions.contains("SMTPUTF8") => line.push_str(" SMTPUTF8"),
            Utf8Mode::Force => return Err(Error::NotSupported("SMTPUTF8".to_string())),
            Utf8Mode::Prefer => {}
        }
        self.cmd(25, &line).await
    }

    /// Aborts the current transaction with `RSET`.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a connection error.
    pub async fn reset(&mut self) -> Result<()> {
        self.hello().await?;
        self.recipients.clear();
        self.cmd(250, "RSET").await.map(|_| ())
    }

    /// Sends `NOOP` to check the connection.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a connection error.
    pub async fn noop(&mut self) -> Result<()> {
        self.hello().await?;
        self.cmd(250, "NOOP").await.map(|_| ())
    }

    /// Starts the message body, with `BDAT` when the server supports
    /// CHUNKING and it is not disabled, with `DATA` otherwise.
    ///
    /// `size` is the exact body length when known, 0 otherwise. It only
    /// affects `BDAT`.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal of `DATA` or a connection error.
    pub async fn content(&mut self, size: u64) -> Result<MessageWriter<'_>> {
        self.hello().await?;
        if self.config.chunking_max_size >= 0 && self.extensions.contains("CHUNKING") {
            self.bdat(size).await
        } else {
            self.data().await
        }
    }

    /// Starts a dot-terminated body with `DATA`.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a connection error.
    pub async fn data(&mut self) -> Result<MessageWriter<'_>> {
        self.hello().await?;
        self.cmd(354, "DATA").await?;
        let write_timeout = self.config.command_timeout;
        let submission_timeout = self.config.submission_timeout;
        let (text, failed) = self.open_body()?;
        Ok(MessageWriter::dot(
            text,
            failed,
            write_timeout,
            submission_timeout,
        ))
    }

    /// Starts a chunked body. Nothing is sent until the first write.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] when the server lacks CHUNKING and
    /// [`Error::InvalidState`] when chunking is disabled in the
    /// configuration.
    pub async fn bdat(&mut self, size: u64) -> Result<MessageWriter<'_>> {
        self.hello().await?;
        let Ok(max_chunk_size) = usize::try_from(self.config.chunking_max_size) else {
            return Err(Error::InvalidState(
                "chunking is disabled by a negative chunking_max_size".to_string(),
            ));
        };
        if !self.extensions.contains("CHUNKING") {
            return Err(Error::NotSupported("CHUNKING".to_string()));
        }

        let buffer = (self.config.chunking_buffer
            && size == 0
            && (max_chunk_size == 0 || max_chunk_size > MIN_BUFFERED_CHUNK))
            .then(|| {
                if max_chunk_size > 0 {
                    max_chunk_size
                } else {
                    config::DEFAULT_CHUNKING_MAX_SIZE
                }
            });
        let write_timeout = self.config.command_timeout;
        let submission_timeout = self.config.submission_timeout;
        let (text, failed) = self.open_body()?;
        Ok(MessageWriter::chunked(
            text,
            failed,
            max_chunk_size,
            size,
            buffer,
            write_timeout,
            submission_timeout,
        ))
    }

    /// Sends `QUIT` and closes the connection. The connection is closed
    /// even if `QUIT` fails. Does nothing on a closed client.
    ///
    /// # Errors
    ///
    /// Returns the `QUIT` failure.
    pub async fn quit(&mut self) -> Result<()> {
        if self.text.is_none() {
            return Ok(());
        }
        self.hello().await?;
        let result = self.cmd(221, "QUIT").await;
        self.shutdown().await;
        result.map(|_| ())
    }

    /// Closes the connection without `QUIT`.
    ///
    /// # Errors
    ///
    /// Returns the transport's shutdown error.
    pub async fn close(&mut self) -> Result<()> {
        self.failed = None;
        match self.text.take() {
            Some(mut text) => Ok(text.shutdown().await?),
            None => Ok(()),
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
    use crate::types::DsnReturn;
    use postwire_sasl::{Login, Plain};
    use tokio_test::io::Builder;

    const GREETING: &[u8] = b"220 mx.example.com ESMTP ready\r\n";

    fn client(mock: tokio_test::io::Mock) -> Client {
        let config = ClientConfig::builder().local_name("client.example.com").build();
        Client::from_stream(mock, config)
    }

    fn greeted(ehlo_reply: &'static [u8]) -> Builder {
        let mut builder = Builder::new();
        builder
            .read(GREETING)
            .write(b"EHLO client.example.com\r\n")
            .read(ehlo_reply);
        builder
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("mx.example.com:25"), "mx.example.com");
        assert_eq!(host_of("[::1]:2525"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_hello_parses_capabilities() {
        let mock = greeted(b"250-mx.example.com Hello\r\n250-SIZE 1000\r\n250 AUTH PLAIN LOGIN\r\n")
            .build();
        let mut client = client(mock);
        client.hello().await.unwrap();
        client.hello().await.unwrap();

        assert_eq!(client.server_name(), "mx.example.com");
        assert_eq!(client.max_message_size(), Some(1000));
        assert!(client.supports_auth("login"));
        assert!(!client.supports_auth("XOAUTH2"));
        assert_eq!(client.extension("size"), Some("1000"));
        assert!(!client.is_tls());
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mock = greeted(b"502 5.5.1 Command not implemented\r\n")
            .write(b"HELO client.example.com\r\n")
            .read(b"250 mx.example.com\r\n")
            .build();
        let mut client = client(mock);
        client.hello().await.unwrap();
        assert!(client.extensions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_greeting_is_cached() {
        let mock = Builder::new().read(b"554 5.3.2 No service\r\n").build();
        let mut client = client(mock);

        let first = client.hello().await.unwrap_err();
        assert_eq!(first.status().unwrap().code.as_u16(), 554);
        let second = client.noop().await.unwrap_err();
        assert_eq!(second.status().unwrap().code.as_u16(), 554);
    }

    #[tokio::test]
    async fn test_local_name_injection() {
        let config = ClientConfig::builder()
            .local_name("evil\r\nMAIL FROM:<x>")
            .build();
        let mut client = Client::from_stream(Builder::new().build(), config);
        assert!(matches!(
            client.hello().await.unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    mod envelope {
        use super::*;

        const FULL_EHLO: &[u8] = b"250-mx.example.com\r\n250-SIZE\r\n250-8BITMIME\r\n\
250-SMTPUTF8\r\n250-DSN\r\n250-AUTH PLAIN\r\n250 XOORG\r\n";

        #[tokio::test]
        async fn test_mail_with_every_parameter() {
            let mock = greeted(FULL_EHLO)
                .write(
                    b"MAIL FROM:<a@example.com> BODY=8BITMIME SIZE=1000 SMTPUTF8 \
RET=HDRS ENVID=id+2B1 AUTH=<> XOORG=example.com\r\n",
                )
                .read(b"250 2.0.0 OK\r\n")
                .build();
            let mut client = client(mock);
            let opts = SendOptions {
                size: 1000,
                ret: Some(DsnReturn::Headers),
                envelope_id: Some("id+1".to_string()),
                auth: Some(String::new()),
                xoorg: Some("example.com".to_string()),
                ..SendOptions::default()
            };
            client.mail("a@example.com", &opts).await.unwrap();
        }

        #[tokio::test]
        async fn test_mail_omits_unadvertised_parameters() {
            let mock = greeted(b"250 mx.example.com\r\n")
                .write(b"MAIL FROM:<>\r\n")
                .read(b"250 2.0.0 OK\r\n")
                .build();
            let mut client = client(mock);
            let opts = SendOptions {
                size: 1000,
                ret: Some(DsnReturn::Full),
                auth: Some("a@example.com".to_string()),
                ..SendOptions::default()
            };
            client.mail("", &opts).await.unwrap();
        }

        #[tokio::test]
        async fn test_forced_extensions_fail_locally() {
            let mock = greeted(b"250 mx.example.com\r\n").build();
            let mut client = client(mock);

            let utf8 = SendOptions {
                utf8: Utf8Mode::Force,
                ..SendOptions::default()
            };
            assert!(matches!(
                client.mail("a@example.com", &utf8).await.unwrap_err(),
                Error::NotSupported(ref ext) if ext == "SMTPUTF8"
            ));

            let require_tls = SendOptions {
                require_tls: true,
                ..SendOptions::default()
            };
            assert!(matches!(
                client.mail("a@example.com", &require_tls).await.unwrap_err(),
                Error::NotSupported(ref ext) if ext == "REQUIRETLS"
            ));

            let vrfy = VerifyOptions {
                utf8: Utf8Mode::Force,
            };
            assert!(matches!(
                client.verify("a@example.com", &vrfy).await.unwrap_err(),
                Error::NotSupported(_)
            ));
        }

        #[tokio::test]
        async fn test_injection_rejected_before_io() {
            let mut client = client(Builder::new().build());
            let err = client
                .mail("a@example.com>\r\nRCPT TO:<b@example.com", &SendOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
            let err = client
                .rcpt("b@example.com\n", &RcptOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }

        #[tokio::test]
        async fn test_rcpt_with_dsn() {
            let mock = greeted(FULL_EHLO)
                .write(
                    b"RCPT TO:<b@example.com> NOTIFY=SUCCESS,FAILURE \
ORCPT=RFC822;b+2Bx@example.com\r\n",
                )
                .read(b"250 2.0.0 OK\r\n")
                .write(b"RCPT TO:<c@example.com> ORCPT=UTF-8;\xc3\xa9\\x{20}x@example.com\r\n")
                .read(b"251 2.1.5 Will forward\r\n")
                .build();
            let mut client = client(mock);

            let opts = RcptOptions {
                notify: vec![DsnNotify::Success, DsnNotify::Failure],
                original_recipient: Some((DsnAddressType::Rfc822, "b+x@example.com".to_string())),
            };
            client.rcpt("b@example.com", &opts).await.unwrap();

            let opts = RcptOptions {
                notify: Vec::new(),
                original_recipient: Some((DsnAddressType::Utf8, "é x@example.com".to_string())),
            };
            client.rcpt("c@example.com", &opts).await.unwrap();
            assert_eq!(client.recipients(), ["b@example.com", "c@example.com"]);
        }

        #[tokio::test]
        async fn test_rcpt_rejects_bad_notify() {
            let mock = greeted(FULL_EHLO).build();
            let mut client = client(mock);
            let opts = RcptOptions {
                notify: vec![DsnNotify::Never, DsnNotify::Success],
                original_recipient: None,
            };
            assert!(matches!(
                client.rcpt("b@example.com", &opts).await.unwrap_err(),
                Error::InvalidInput(_)
            ));
        }

        #[tokio::test]
        async fn test_refused_recipient() {
            let mock = greeted(b"250 mx.example.com\r\n")
                .write(b"RCPT TO:<nobody@example.com>\r\n")
                .read(b"550 5.1.1 No such user\r\n")
                .build();
            let mut client = client(mock);
            let err = client
                .rcpt("nobody@example.com", &RcptOptions::default())
                .await
                .unwrap_err();
            assert!(err.is_permanent());
            assert!(!err.is_connection_fatal());
            assert!(client.recipients().is_empty());
        }

        #[tokio::test]
        async fn test_verify_accepts_252() {
            let mock = greeted(b"250 mx.example.com\r\n")
                .write(b"VRFY postmaster\r\n")
                .read(b"252 2.5.0 Cannot VRFY user, but will accept message\r\n")
                .build();
            let mut client = client(mock);
            let reply = client
                .verify("postmaster", &VerifyOptions::default())
                .await
                .unwrap();
            assert_eq!(reply.code.as_u16(), 252);
        }
    }

    mod auth {
        use super::*;

        #[tokio::test]
        async fn test_plain_with_initial_response() {
            let mock = greeted(b"250-mx.example.com\r\n250 AUTH PLAIN\r\n")
                .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
                .read(b"235 2.7.0 Authentication succeeded\r\n")
                .build();
            let mut client = client(mock);
            client
                .auth(&mut Plain::new("", "user", "pass"))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_login_challenges() {
            let mock = greeted(b"250-mx.example.com\r\n250 AUTH LOGIN\r\n")
                .write(b"AUTH LOGIN dXNlcg==\r\n")
                .read(b"334 UGFzc3dvcmQ6\r\n")
                .write(b"cGFzcw==\r\n")
                .read(b"235 2.7.0 Authentication succeeded\r\n")
                .build();
            let mut client = client(mock);
            client.auth(&mut Login::new("user", "pass")).await.unwrap();
        }

        #[tokio::test]
        async fn test_mechanism_failure_aborts() {
            let mock = greeted(b"250-mx.example.com\r\n250 AUTH LOGIN\r\n")
                .write(b"AUTH LOGIN dXNlcg==\r\n")
                .read(b"334 VXNlcm5hbWU6\r\n")
                .write(b"*\r\n")
                .read(b"501 5.0.0 Negotiation cancelled\r\n")
                .build();
            let mut client = client(mock);
            let err = client
                .auth(&mut Login::new("user", "pass"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Sasl(_)));
        }

        #[tokio::test]
        async fn test_rejected_credentials() {
            let mock = greeted(b"250-mx.example.com\r\n250 AUTH PLAIN\r\n")
                .write(b"AUTH PLAIN AHVzZXIAYmFk\r\n")
                .read(b"535 5.7.8 Authentication credentials invalid\r\n")
                .build();
            let mut client = client(mock);
            let err = client
                .auth(&mut Plain::new("", "user", "bad"))
                .await
                .unwrap_err();
            let status = err.status().unwrap();
            assert_eq!(status.code.as_u16(), 535);
            assert_eq!(status.message, "Authentication credentials invalid");
        }
    }

    mod body {
        use super::*;

        #[tokio::test]
        async fn test_content_prefers_bdat() {
            let mock = greeted(b"250-mx.example.com\r\n250 CHUNKING\r\n")
                .write(b"BDAT 4 LAST\r\n")
                .write(b"hi\r\n")
                .read(b"250 2.0.0 OK: queued as 42\r\n")
                .build();
            let mut client = client(mock);
            let mut body = client.content(4).await.unwrap();
            assert!(body.is_chunked());
            body.write(b"hi\r\n").await.unwrap();
            let reply = body.close().await.unwrap();
            assert_eq!(reply.text(), "2.0.0 OK: queued as 42");
        }

        #[tokio::test]
        async fn test_negative_chunk_size_uses_data() {
            let mock = greeted(b"250-mx.example.com\r\n250 CHUNKING\r\n")
                .write(b"DATA\r\n")
                .read(b"354 Go ahead\r\n")
                .write(b"hi\r\n")
                .write(b".\r\n")
                .read(b"250 2.0.0 OK: queued\r\n")
                .build();
            let config = ClientConfig::builder()
                .local_name("client.example.com")
                .chunking_max_size(-1)
                .build();
            let mut client = Client::from_stream(mock, config);
            let mut body = client.content(0).await.unwrap();
            assert!(!body.is_chunked());
            body.write(b"hi\n").await.unwrap();
            body.close().await.unwrap();

            assert!(matches!(
                client.bdat(0).await.unwrap_err(),
                Error::InvalidState(_)
            ));
        }

        #[tokio::test]
        async fn test_late_final_reply_poisons_client() {
            let mock = greeted(b"250 mx.example.com\r\n")
                .write(b"DATA\r\n")
                .read(b"354 Go ahead\r\n")
                .write(b"hi\r\n.\r\n")
                .wait(std::time::Duration::from_millis(200))
                .build();
            let config = ClientConfig::builder()
                .local_name("client.example.com")
                .submission_timeout(std::time::Duration::from_millis(50))
                .build();
            let mut client = Client::from_stream(mock, config);
            let mut body = client.content(0).await.unwrap();
            body.write(b"hi\r\n").await.unwrap();
            let err = body.close().await.unwrap_err();
            assert!(matches!(err, Error::Timeout(_)));

            // The queued reply may still arrive; nothing more is sent.
            assert!(matches!(client.noop().await.unwrap_err(), Error::Timeout(_)));
            assert!(matches!(client.reset().await.unwrap_err(), Error::Timeout(_)));
            client.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_dropped_body_poisons_client() {
            let mock = greeted(b"250 mx.example.com\r\n")
                .write(b"DATA\r\n")
                .read(b"354 Go ahead\r\n")
                .write(b"partial\r\n")
                .build();
            let mut client = client(mock);
            let mut body = client.data().await.unwrap();
            body.write(b"partial\r\n").await.unwrap();
            drop(body);

            assert!(matches!(
                client.noop().await.unwrap_err(),
                Error::InvalidState(_)
            ));
            assert!(client.data().await.is_err());
        }

        #[tokio::test]
        async fn test_refused_chunk_keeps_client() {
            let mock = greeted(b"250-mx.example.com\r\n250 CHUNKING\r\n")
                .write(b"BDAT 3\r\n")
                .write(b"abc")
                .read(b"552 5.3.4 Message too big\r\n")
                .write(b"NOOP\r\n")
                .read(b"250 2.0.0 OK\r\n")
                .build();
            let config = ClientConfig::builder()
                .local_name("client.example.com")
                .chunking_max_size(3)
                .build();
            let mut client = Client::from_stream(mock, config);
            let mut body = client.content(6).await.unwrap();
            let err = body.write(b"abcdef").await.unwrap_err();
            assert_eq!(err.status().unwrap().code.as_u16(), 552);
            drop(body);

            client.noop().await.unwrap();
        }

        #[tokio::test]
        async fn test_bdat_needs_chunking() {
            let mock = greeted(b"250 mx.example.com\r\n").build();
            let mut client = client(mock);
            assert!(matches!(
                client.bdat(0).await.unwrap_err(),
                Error::NotSupported(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_long_reply_is_sticky() {
        let mut long = b"250 ".to_vec();
        long.extend(std::iter::repeat_n(b'x', 64));
        long.extend_from_slice(b"\r\n");
        let mock = greeted(b"250 mx.example.com\r\n")
            .write(b"NOOP\r\n")
            .read(&long)
            .build();
        let config = ClientConfig::builder()
            .local_name("client.example.com")
            .max_line_length(32)
            .build();
        let mut client = Client::from_stream(mock, config);

        assert!(matches!(client.noop().await.unwrap_err(), Error::LineTooLong));
        assert!(matches!(client.noop().await.unwrap_err(), Error::LineTooLong));
        client.close().await.unwrap();
        assert!(matches!(
            client.noop().await.unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_quit_closes() {
        let mock = greeted(b"250 mx.example.com\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 2.0.0 Bye\r\n")
            .build();
        let mut client = client(mock);
        client.quit().await.unwrap();
        client.quit().await.unwrap();
    }
}
