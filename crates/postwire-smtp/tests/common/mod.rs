//! Shared fixtures: an in-memory backend and a raw protocol peer.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
    duplex, split,
};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use postwire_sasl::{LoginServer, PlainServer, ServerMechanism};
use postwire_smtp::server::tls::load_server_config;
use postwire_smtp::server::{Backend, Body, ConnInfo, Server, ServerConfig, Session};
use postwire_smtp::types::{DsnNotify, MailOptions, RcptOptions};
use postwire_smtp::{EnhancedCode, Result, Status};

/// Installs a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Recipients containing this local part are refused with `550`.
pub const UNKNOWN_USER: &str = "nobody";

/// Recipients containing this local part make the session panic.
pub const CRASHING_USER: &str = "crash";

/// A message accepted by [`Sink`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: Vec<String>,
    pub notify: Vec<DsnNotify>,
    pub body: Vec<u8>,
    pub chunked: bool,
}

/// Backend that keeps every accepted message in memory.
#[derive(Debug, Clone, Default)]
pub struct Sink {
    mechanisms: Vec<String>,
    delivered: Arc<Mutex<Vec<Delivery>>>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers PLAIN and LOGIN, accepting `user` / `pass`.
    pub fn with_auth() -> Self {
        Self {
            mechanisms: vec!["PLAIN".to_string(), "LOGIN".to_string()],
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }
}

fn check(_identity: &str, username: &str, password: &str) -> postwire_sasl::Result<()> {
    if username == "user" && password == "pass" {
        Ok(())
    } else {
        Err(postwire_sasl::Error::AuthenticationFailed)
    }
}

pub struct SinkSession {
    mechanisms: Vec<String>,
    delivered: Arc<Mutex<Vec<Delivery>>>,
    current: Delivery,
}

impl Backend for Sink {
    type Session = SinkSession;

    async fn new_session(&self, _conn: &ConnInfo) -> Result<SinkSession> {
        Ok(SinkSession {
            mechanisms: self.mechanisms.clone(),
            delivered: Arc::clone(&self.delivered),
            current: Delivery::default(),
        })
    }
}

impl Session for SinkSession {
    async fn reset(&mut self, _upgrade: bool) -> Result<()> {
        self.current = Delivery::default();
        Ok(())
    }

    async fn mail(&mut self, from: &str, _opts: &MailOptions) -> Result<()> {
        self.current = Delivery {
            from: from.to_string(),
            ..Delivery::default()
        };
        Ok(())
    }

    async fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> Result<()> {
        assert!(!to.starts_with(CRASHING_USER), "recipient store crashed");
        if to.starts_with(UNKNOWN_USER) {
            return Err(Status::new(550, EnhancedCode::new(5, 1, 1), "No such user").into());
        }
        self.current.to.push(to.to_string());
        self.current.notify.extend(opts.notify.iter().copied());
        Ok(())
    }

    async fn data(&mut self, body: &mut Body<'_>) -> Result<String> {
        let mut message = Vec::new();
        body.read_to_end(&mut message).await?;

        let mut delivered = self.delivered.lock().unwrap();
        let mut delivery = self.current.clone();
        delivery.body = message;
        delivery.chunked = body.is_chunked();
        delivered.push(delivery);
        Ok(format!("Q{}", delivered.len()))
    }

    async fn auth_mechanisms(&mut self) -> Vec<String> {
        self.mechanisms.clone()
    }

    async fn auth(&mut self, mechanism: &str) -> Result<Box<dyn ServerMechanism>> {
        match mechanism {
            "PLAIN" => Ok(Box::new(PlainServer::new(check))),
            "LOGIN" => Ok(Box::new(LoginServer::new(|user, pass| check("", user, pass)))),
            _ => Err(Status::ERR_AUTH_UNKNOWN_MECHANISM.into()),
        }
    }
}

/// Client end of an in-memory connection, speaking raw protocol lines.
pub struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    /// Reads one reply, all of its lines.
    pub async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap() == 0 {
                return lines;
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                return lines;
            }
        }
    }

    /// Writes raw bytes.
    pub async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
    }

    /// Sends a command line and returns the final line of its reply.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(&format!("{line}\r\n")).await;
        self.reply().await.pop().unwrap_or_default()
    }

    /// Sends a command line and returns every line of its reply.
    pub async fn cmd_lines(&mut self, line: &str) -> Vec<String> {
        self.send(&format!("{line}\r\n")).await;
        self.reply().await
    }

    /// Reads everything the server sends until it closes the connection.
    pub async fn drain(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = self.reader.read_to_end(&mut rest).await;
        rest
    }

    /// Returns true once the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap_or(0) == 0
    }
}

/// Serves one in-memory connection and returns the peer after the
/// greeting has been read.
pub async fn connect(
    config: ServerConfig,
    sink: Sink,
) -> (Peer, Server<Sink>, JoinHandle<Result<()>>) {
    init_tracing();
    let server = Server::new(config, sink);
    let (peer, handle) = attach(&server).await;
    (peer, server, handle)
}

/// Opens another in-memory connection to a running server.
pub async fn attach(server: &Server<Sink>) -> (Peer, JoinHandle<Result<()>>) {
    let (local, remote) = duplex(64 * 1024);

    let handle = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_stream(remote, None).await })
    };

    let (reader, writer) = split(local);
    let mut peer = Peer {
        reader: BufReader::new(reader),
        writer,
    };
    let greeting = peer.reply().await;
    assert!(greeting[0].starts_with("220 "), "greeting: {greeting:?}");
    (peer, handle)
}

/// Server configuration shared by most tests.
pub fn config() -> postwire_smtp::server::ServerConfigBuilder {
    ServerConfig::builder().hostname("mx.test")
}

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Server TLS configuration with a self-signed certificate for `mx.test`.
pub fn tls_server_config() -> Arc<rustls::ServerConfig> {
    load_server_config(&fixture("mx.test.crt"), &fixture("mx.test.key")).unwrap()
}

/// Client TLS configuration trusting only the `mx.test` certificate.
pub fn tls_client_config() -> Arc<rustls::ClientConfig> {
    let pem = std::fs::read(fixture("mx.test.crt")).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
