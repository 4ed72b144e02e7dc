//! One server connection: the command loop and the per-command handlers.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::FutureExt;
use postwire_sasl::Step;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{Span, debug, error, info, warn};

use super::body::{Body, Timeouts};
use super::params::{parse_mail, parse_rcpt, parse_vrfy};
use super::session::{Backend, ConnInfo, Session};
use super::state::{
    Action, Policy, State, after_hello, after_transaction, capabilities, dispatch, hello_resets,
};
use super::ServerConfig;
use crate::codec::parse_bdat_args;
use crate::connection::{SmtpStream, TextConn, with_deadline};
use crate::parser::{hello_argument, parse_command};
use crate::types::{BodyType, EnhancedCode, Status};
use crate::{Error, Result};

/// Longest queue id echoed back in full.
const MAX_QUEUE_ID_LEN: usize = 977;

fn status(code: u16, enhanced: (u16, u16, u16), message: &'static str) -> Error {
    Status::new(code, EnhancedCode::new(enhanced.0, enhanced.1, enhanced.2), message).into()
}

/// Runs a connection to completion. Never panics and never fails: every
/// outcome ends in [`Session::close`].
pub(crate) async fn serve_conn<B: Backend>(
    backend: Arc<B>,
    config: Arc<ServerConfig>,
    stream: SmtpStream,
    info: ConnInfo,
) {
    let session = match backend.new_session(&info).await {
        Ok(session) => session,
        Err(err) => {
            warn!("session refused: {err}");
            let mut stream = stream;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let mut conn = Conn::new(info.id, config, stream, session);
    info!("connection opened");

    if conn.config.implicit_tls {
        if let Err(err) = conn.accept_implicit_tls().await {
            warn!("TLS handshake failed: {err}");
            conn.close(Some(&err)).await;
            return;
        }
    }

    match AssertUnwindSafe(conn.run()).catch_unwind().await {
        Ok(err) => conn.handle_error(err).await,
        Err(panic) => {
            error!(
                panic = panic_message(panic.as_ref()),
                backtrace = %Backtrace::force_capture(),
                "panic serving connection"
            );
            let internal = Status::new(421, EnhancedCode::new(4, 0, 0), "Internal server error");
            let _ = conn.write_status(&internal).await;
            let err = Error::InvalidState("recovered from panic while serving".to_string());
            conn.close(Some(&err)).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

fn decode_sasl_response(encoded: &str) -> Result<Vec<u8>> {
    if encoded == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(encoded)
        .map_err(|_| status(454, (4, 7, 0), "Invalid base64 data"))
}

fn auth_failure(err: Error) -> Error {
    match err {
        Error::Status(status) => status.into(),
        Error::Sasl(postwire_sasl::Error::AuthenticationFailed) => Status::ERR_AUTH_FAILED.into(),
        other => {
            debug!("authentication failed: {other}");
            status(454, (4, 7, 0), "Authentication failed")
        }
    }
}

/// Turns a session verdict into the reply override, if any.
///
/// A positive status replaces the default reply; other statuses are sent as
/// they are; anything else becomes a generic `451`.
fn verdict(result: Result<()>, refusal: &'static str) -> Result<Option<Status>> {
    match result {
        Ok(()) => Ok(None),
        Err(Error::Status(status)) if status.is_positive() => Ok(Some(status)),
        Err(Error::Status(status)) => Err(status.into()),
        Err(err) => {
            warn!("{refusal}: {err}");
            Err(status(451, (4, 0, 0), refusal))
        }
    }
}

fn queued(id: &str) -> Status {
    if id.is_empty() {
        return Status::new(250, EnhancedCode::new(2, 0, 0), "OK: queued");
    }
    let id = if id.len() > MAX_QUEUE_ID_LEN {
        let mut end = MAX_QUEUE_ID_LEN - 3;
        while !id.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &id[..end])
    } else {
        id.to_string()
    };
    Status::new(250, EnhancedCode::new(2, 0, 0), format!("OK: queued as {id}"))
}

struct Conn<S> {
    id: u64,
    config: Arc<ServerConfig>,
    text: TextConn<SmtpStream>,
    session: S,
    state: State,
    binarymime: bool,
    mechanisms: Vec<String>,
    recipients: usize,
    did_auth: bool,
}

impl<S: Session> Conn<S> {
    fn new(id: u64, config: Arc<ServerConfig>, stream: SmtpStream, session: S) -> Self {
        let text = TextConn::with_buffer_sizes(
            config.reader_size,
            config.writer_size,
            stream,
            config.max_line_length,
        );
        Self {
            id,
            config,
            text,
            session,
            state: State::Init,
            binarymime: false,
            mechanisms: Vec::new(),
            recipients: 0,
            did_auth: false,
        }
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.config.read_timeout,
            write: self.config.write_timeout,
        }
    }

    fn is_tls(&self) -> bool {
        self.text.get_ref().is_tls()
    }

    async fn accept_implicit_tls(&mut self) -> Result<()> {
        let tls = self
            .config
            .tls
            .clone()
            .ok_or_else(|| Error::InvalidState("implicit TLS without a TLS config".to_string()))?;
        let acceptor = TlsAcceptor::from(tls);
        with_deadline(self.config.read_timeout, self.text.get_mut().accept_tls(&acceptor)).await
    }

    async fn write_status(&mut self, status: &Status) -> Result<()> {
        debug!(
            code = status.code.as_u16(),
            enhanced = ?status.enhanced,
            text = %status.message,
            "write"
        );
        with_deadline(self.config.write_timeout, self.text.write_status(status)).await
    }

    async fn read_line(&mut self) -> Result<String> {
        with_deadline(self.config.read_timeout, self.text.read_line()).await
    }

    async fn next_command(&mut self) -> Result<(String, String)> {
        let line = self.read_line().await?;
        debug!(line = %line, "read");
        parse_command(&line)
    }

    /// Serves commands until one ends the connection, and returns why.
    async fn run(&mut self) -> Error {
        let greeting = Status::new(
            220,
            EnhancedCode::Omitted,
            format!("{} ESMTP Service Ready", self.config.hostname),
        );
        if let Err(err) = self.write_status(&greeting).await {
            return err;
        }

        loop {
            let (cmd, arg) = match self.next_command().await {
                Ok(command) => command,
                Err(err) => return err,
            };
            let reply = match self.handle(&cmd, &arg).await {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(Error::Status(reply)) => reply,
                Err(err) => return err,
            };
            if let Err(err) = self.write_status(&reply).await {
                return err;
            }
        }
    }

    async fn handle_error(&mut self, err: Error) {
        match &err {
            Error::Quit => {
                let _ = self.write_status(&Status::QUIT).await;
                self.close(None).await;
                return;
            }
            e if e.is_eof() || matches!(e, Error::ConnectionLost) => {}
            Error::Timeout(_) => {
                let idle = Status::new(421, EnhancedCode::new(4, 4, 2), "Idle timeout, bye bye");
                let _ = self.write_status(&idle).await;
            }
            Error::Status(reply) => {
                let _ = self.write_status(reply).await;
            }
            Error::LineTooLong => {
                let too_long = Status::new(500, EnhancedCode::new(5, 4, 0), "Too long line");
                let _ = self.write_status(&too_long).await;
            }
            _ => {
                let _ = self.write_status(&Status::ERR_CONNECTION).await;
            }
        }
        self.close(Some(&err)).await;
    }

    async fn close(&mut self, err: Option<&Error>) {
        if let Err(e) = self.text.get_mut().shutdown().await {
            debug!("shutdown failed: {e}");
        }
        match err {
            Some(err) => info!(id = self.id, "connection closed: {err}"),
            None => info!(id = self.id, "connection closed"),
        }
        self.session.close(err).await;
    }

    async fn handle(&mut self, cmd: &str, arg: &str) -> Result<Option<Status>> {
        let policy = Policy {
            chunking: self.config.enable_chunking,
            auth: !self.mechanisms.is_empty(),
        };
        match dispatch(self.state, cmd, policy) {
            Action::Hello { extended } => self.hello(extended, arg).await.map(Some),
            Action::Mail => self.mail(arg).await.map(Some),
            Action::Rcpt => self.rcpt(arg).await.map(Some),
            Action::Data => self.data(arg).await.map(Some),
            Action::Bdat => self.bdat(arg).await.map(Some),
            Action::Auth => self.auth(arg).await.map(Some),
            Action::StartTls => self.starttls().await.map(|()| None),
            Action::Noop => Ok(Some(Status::NOOP)),
            Action::Verify => self.verify(arg).await.map(Some),
            Action::Reset => {
                self.reset().await?;
                Ok(Some(Status::RESET))
            }
            Action::Quit => Err(Error::Quit),
            Action::Reject(reply) => Err(reply.into()),
        }
    }

    /// Ends the transaction. After STARTTLS this also revokes
    /// authentication.
    async fn reset(&mut self) -> Result<()> {
        self.state = after_transaction(self.state);
        self.recipients = 0;
        self.binarymime = false;

        let upgrade = self.state == State::Upgrade;
        if upgrade {
            self.did_auth = false;
        }
        self.session.reset(upgrade).await
    }

    async fn hello(&mut self, extended: bool, arg: &str) -> Result<Status> {
        let domain = hello_argument(arg)
            .map_err(|_| status(501, (5, 5, 2), "Domain/address argument required for HELO"))?
            .to_string();
        Span::current().record("helo", domain.as_str());

        if hello_resets(self.state) {
            self.reset().await?;
        }

        let is_tls = self.is_tls();
        self.state = after_hello(
            self.config.enforce_secure_connection,
            is_tls,
            self.config.enforce_authentication,
            self.did_auth,
        );

        if !extended {
            return Ok(Status::new(
                250,
                EnhancedCode::new(2, 0, 0),
                format!("Hello {domain}"),
            ));
        }

        self.mechanisms = self.session.auth_mechanisms().await;
        if self.mechanisms.is_empty() && self.config.enforce_authentication {
            return Err(status(
                451,
                (4, 0, 0),
                "No auth mechanism available but authentication enforced",
            ));
        }

        let mut lines = vec![format!("Hello {domain}")];
        lines.extend(capabilities(&self.config, is_tls, &self.mechanisms));
        Ok(Status::new(250, EnhancedCode::Omitted, lines.join("\n")))
    }

    async fn mail(&mut self, arg: &str) -> Result<Status> {
        let (from, opts) = parse_mail(&self.config, arg)?;
        self.binarymime = opts.body == Some(BodyType::BinaryMime);

        let reply = verdict(self.session.mail(&from, &opts).await, "Mail not accepted")?;
        self.state = State::Mail;
        Ok(reply.unwrap_or_else(|| {
            Status::new(
                250,
                EnhancedCode::new(2, 0, 0),
                format!("Roger, accepting mail from <{from}>"),
            )
        }))
    }

    async fn rcpt(&mut self, arg: &str) -> Result<Status> {
        let (to, opts) = parse_rcpt(&self.config, arg, self.recipients)?;

        let reply = verdict(self.session.rcpt(&to, &opts).await, "Recipient not accepted")?;
        self.recipients += 1;
        Ok(reply.unwrap_or_else(|| {
            Status::new(
                250,
                EnhancedCode::new(2, 0, 0),
                format!("I'll make sure <{to}> gets this"),
            )
        }))
    }

    async fn verify(&mut self, arg: &str) -> Result<Status> {
        let (addr, opts) = parse_vrfy(&self.config, arg)?;
        self.session.verify(&addr, &opts).await?;
        Ok(Status::VRFY)
    }

    async fn auth(&mut self, arg: &str) -> Result<Status> {
        if self.did_auth {
            return Err(status(503, (5, 5, 1), "Already authenticated"));
        }
        let mut parts = arg.split_whitespace();
        let Some(mechanism) = parts.next() else {
            return Err(status(502, (5, 5, 4), "Missing parameter"));
        };
        let mechanism = mechanism.to_ascii_uppercase();
        if !self.mechanisms.contains(&mechanism) {
            return Err(Status::ERR_AUTH_UNKNOWN_MECHANISM.into());
        }

        let mut response = parts.next().map(decode_sasl_response).transpose()?;
        let mut handler = self
            .session
            .auth(&mechanism)
            .await
            .map_err(auth_failure)?;

        loop {
            let step = handler
                .next(response.as_deref())
                .map_err(|e| auth_failure(e.into()))?;
            let Step::Challenge(challenge) = step else {
                break;
            };
            let prompt = Status::new(334, EnhancedCode::Omitted, BASE64.encode(challenge));
            self.write_status(&prompt).await?;

            // Responses carry credentials and are not logged.
            let line = self.read_line().await?;
            if line == "*" {
                return Err(status(501, (5, 0, 0), "Negotiation cancelled"));
            }
            response = Some(decode_sasl_response(&line)?);
        }

        self.did_auth = true;
        if self.state == State::EnforceAuthentication {
            self.state = State::Greeted;
        }
        debug!(mechanism = %mechanism, "authenticated");
        Ok(Status::new(
            235,
            EnhancedCode::new(2, 0, 0),
            "Authentication succeeded",
        ))
    }

    async fn starttls(&mut self) -> Result<()> {
        if self.is_tls() {
            return Err(status(502, (5, 5, 1), "Already running in TLS"));
        }
        let Some(tls) = self.config.tls.clone() else {
            return Err(status(502, (5, 5, 1), "TLS not supported"));
        };
        // Plaintext pipelined behind STARTTLS must not survive into TLS.
        if self.text.has_buffered_input() {
            return Err(Error::Protocol(
                "data received after STARTTLS before the handshake".to_string(),
            ));
        }

        let tls = match self.session.starttls(tls).await {
            Ok(tls) => tls,
            Err(Error::Status(reply)) => return Err(reply.into()),
            Err(err) => {
                warn!("TLS config retrieval failed: {err}");
                return Err(status(451, (4, 0, 0), "TLS config retrieval failed"));
            }
        };

        let ready = Status::new(220, EnhancedCode::new(2, 0, 0), "Ready to start TLS");
        self.write_status(&ready).await?;

        let acceptor = TlsAcceptor::from(tls);
        let handshake = with_deadline(
            self.config.read_timeout,
            self.text.get_mut().accept_tls(&acceptor),
        )
        .await;
        if let Err(err) = handshake {
            // The plaintext stream went into the failed handshake; there is
            // nobody left to reply to.
            warn!("STARTTLS handshake failed: {err}");
            return Err(Error::ConnectionLost);
        }

        self.state = State::Upgrade;
        self.mechanisms.clear();
        self.binarymime = false;
        Ok(())
    }

    async fn data(&mut self, arg: &str) -> Result<Status> {
        if !arg.is_empty() {
            return Err(status(501, (5, 5, 4), "DATA command should not have any arguments"));
        }
        if self.binarymime {
            return Err(status(502, (5, 5, 1), "DATA not allowed for BINARYMIME messages"));
        }

        let timeouts = self.timeouts();
        let max_bytes = self.config.max_message_bytes;
        let result = {
            let mut body = Body::data(&mut self.text, timeouts, max_bytes);
            let mut result = self.session.data(&mut body).await;
            if matches!(result, Ok(_) | Err(Error::Status(_))) {
                if let Err(err) = body.finish().await {
                    result = Err(err);
                }
            }
            result
        };

        match result {
            Ok(id) => {
                self.reset().await?;
                Ok(queued(&id))
            }
            Err(Error::Status(reply)) => {
                self.reset().await?;
                Err(reply.into())
            }
            Err(err) => Err(err),
        }
    }

    async fn bdat(&mut self, arg: &str) -> Result<Status> {
        let (size, last) = parse_bdat_args(arg)?;

        let timeouts = self.timeouts();
        let max_bytes = self.config.max_message_bytes;
        let result = {
            let mut body = Body::chunks(&mut self.text, timeouts, size, last, max_bytes);
            let mut result = self.session.data(&mut body).await;
            if result.is_ok() {
                if let Err(err) = body.finish().await {
                    result = Err(err);
                }
            }
            if matches!(result, Err(Error::Status(_))) {
                // The client sends nothing after a refused chunk, so only
                // the rest of the current one is discarded.
                body.close_chunks();
                let _ = body.finish().await;
            }
            result
        };

        match result {
            Ok(id) => {
                self.reset().await?;
                Ok(queued(&id))
            }
            Err(Error::Reset) => {
                self.reset().await?;
                Ok(Status::RESET)
            }
            Err(err @ (Error::Quit | Error::Status(_))) => {
                self.reset().await?;
                Err(err)
            }
            Err(err) => Err(err),
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

    #[test]
    fn test_queued_reply() {
        assert_eq!(queued("").message, "OK: queued");
        assert_eq!(queued("abc").message, "OK: queued as abc");

        let long = "x".repeat(1200);
        let reply = queued(&long);
        assert_eq!(reply.message.len(), "OK: queued as ".len() + 974 + 3);
        assert!(reply.message.ends_with("..."));

        let exact = "y".repeat(977);
        assert_eq!(queued(&exact).message.len(), "OK: queued as ".len() + 977);
    }

    #[test]
    fn test_queued_reply_respects_char_boundaries() {
        let long = "\u{e9}".repeat(600);
        let reply = queued(&long);
        assert!(reply.message.ends_with("..."));
        assert!(reply.message.len() <= "OK: queued as ".len() + 974 + 3);
    }

    #[test]
    fn test_sasl_response_decoding() {
        assert_eq!(decode_sasl_response("=").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_sasl_response("AGEAYg==").unwrap(), b"\0a\0b");
        let err = decode_sasl_response("!!!").unwrap_err();
        assert!(matches!(err, Error::Status(ref s) if s.code.as_u16() == 454));
    }

    #[test]
    fn test_verdict() {
        assert_eq!(verdict(Ok(()), "nope").unwrap(), None);

        let custom = Status::new(251, EnhancedCode::new(2, 1, 5), "Will forward");
        assert_eq!(
            verdict(Err(custom.clone().into()), "nope").unwrap(),
            Some(custom)
        );

        let refused = Status::new(550, EnhancedCode::new(5, 1, 1), "No such user");
        let err = verdict(Err(refused.clone().into()), "nope").unwrap_err();
        assert!(matches!(err, Error::Status(ref s) if *s == refused));

        let err = verdict(Err(Error::ConnectionLost), "Mail not accepted").unwrap_err();
        assert!(matches!(err, Error::Status(ref s)
            if s.code.as_u16() == 451 && s.message == "Mail not accepted"));
    }

    #[test]
    fn test_auth_failure_mapping() {
        let err = auth_failure(postwire_sasl::Error::AuthenticationFailed.into());
        assert!(matches!(err, Error::Status(ref s) if s.code.as_u16() == 535));

        let err = auth_failure(postwire_sasl::Error::InvalidResponse("x".to_string()).into());
        assert!(matches!(err, Error::Status(ref s) if s.code.as_u16() == 454));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
