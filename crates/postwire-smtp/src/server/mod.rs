//! SMTP server.
//!
//! A [`Server`] accepts connections and drives one [`Session`] per
//! connection, created by a [`Backend`]. The connection loop owns the
//! protocol: greeting, capability negotiation, STARTTLS, AUTH and the body
//! transfer; the session only sees validated commands.
//!
//! # Example
//!
//! ```ignore
//! use postwire_smtp::server::{Backend, Body, ConnInfo, Server, ServerConfig, Session};
//! use postwire_smtp::types::{MailOptions, RcptOptions};
//! use postwire_smtp::Result;
//!
//! struct Sink;
//! struct SinkSession;
//!
//! impl Backend for Sink {
//!     type Session = SinkSession;
//!     async fn new_session(&self, _conn: &ConnInfo) -> Result<SinkSession> {
//!         Ok(SinkSession)
//!     }
//! }
//!
//! impl Session for SinkSession {
//!     async fn mail(&mut self, _from: &str, _opts: &MailOptions) -> Result<()> { Ok(()) }
//!     async fn rcpt(&mut self, _to: &str, _opts: &RcptOptions) -> Result<()> { Ok(()) }
//!     async fn data(&mut self, body: &mut Body<'_>) -> Result<String> {
//!         let mut message = Vec::new();
//!         body.read_to_end(&mut message).await?;
//!         Ok(String::new())
//!     }
//! }
//!
//! let config = ServerConfig::builder().addr("127.0.0.1:2525").build();
//! Server::new(config, Sink).listen_and_serve().await?;
//! ```

mod body;
mod config;
mod conn;
mod params;
mod session;
pub mod state;
pub mod tls;

pub use body::Body;
pub use config::{ServerConfig, ServerConfigBuilder};
pub use session::{Backend, ConnInfo, Session};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{Instrument, error, field, info, info_span};

use crate::connection::{SmtpStream, with_deadline};
use crate::{Error, Result};

/// First delay after a transient accept failure.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Longest delay between accept retries.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

const fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => MIN_ACCEPT_BACKOFF,
        Some(delay) => {
            let doubled = delay.saturating_mul(2);
            if doubled.as_nanos() > MAX_ACCEPT_BACKOFF.as_nanos() {
                MAX_ACCEPT_BACKOFF
            } else {
                doubled
            }
        }
    }
}

/// Accept errors that do not affect the listener itself.
fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    // ENFILE and EMFILE: out of descriptors, retry once some are released.
    #[cfg(unix)]
    if matches!(err.raw_os_error(), Some(23 | 24)) {
        return true;
    }
    false
}

/// State shared between the server handle and its connection tasks.
#[derive(Debug)]
struct Shared {
    closed: watch::Sender<bool>,
    active: watch::Sender<usize>,
    conns: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl Shared {
    fn conns(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the server closed. Fails if it already was.
    fn mark_closed(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Err(Error::ServerClosed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Keeps the connection registry accurate even when a task is aborted.
struct Tracked {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.shared.conns().remove(&self.id);
        self.shared.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// SMTP server.
///
/// Cloning is cheap; clones share the listener state, so any clone can
/// shut the server down.
pub struct Server<B> {
    config: Arc<ServerConfig>,
    backend: Arc<B>,
    shared: Arc<Shared>,
}

impl<B> Clone for Server<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            backend: Arc::clone(&self.backend),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B> std::fmt::Debug for Server<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("active", &*self.shared.active.borrow())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Server<B> {
    /// Creates a server.
    pub fn new(config: ServerConfig, backend: B) -> Self {
        Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
            shared: Arc::new(Shared {
                closed: watch::channel(false).0,
                active: watch::channel(0).0,
                conns: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the number of connections being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        *self.shared.active.borrow()
    }

    /// Binds [`ServerConfig::addr`] and serves it.
    ///
    /// # Errors
    ///
    /// Returns the bind error, or see [`serve`](Self::serve).
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("listening on {}", self.config.addr);
        self.serve(listener).await
    }

    /// Accepts connections until the server is closed.
    ///
    /// Transient accept failures are retried with a backoff from 5 ms up to
    /// 1 s.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosed`] once [`shutdown`](Self::shutdown) or
    /// [`close`](Self::close) is called, or the first fatal accept error.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::ServerClosed);
        }
        let mut closed = self.shared.closed.subscribe();
        let mut backoff = None;

        loop {
            let accepted = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = None;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {peer}: {e}");
                    }
                    drop(self.spawn(stream, Some(peer)));
                }
                Err(e) if is_transient(&e) => {
                    let delay = next_backoff(backoff);
                    backoff = Some(delay);
                    error!("accept error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Serves one already-connected stream and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosed`] if the server is closed.
    pub async fn serve_stream<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shared.is_closed() {
            return Err(Error::ServerClosed);
        }
        let handle = self.spawn(stream, peer);
        // An aborted connection is a normal outcome of `close`.
        let _ = handle.await;
        Ok(())
    }

    fn spawn<S>(&self, stream: S, peer: Option<SocketAddr>) -> tokio::task::JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnInfo {
            id,
            peer,
            tls: self.config.implicit_tls,
        };
        let span = info_span!("smtp_conn", id, peer = ?peer, helo = field::Empty);

        self.shared.active.send_modify(|n| *n += 1);
        let tracked = Tracked {
            shared: Arc::clone(&self.shared),
            id,
        };
        let backend = Arc::clone(&self.backend);
        let config = Arc::clone(&self.config);
        let stream = SmtpStream::plain(stream);

        // Hold the registry lock until the handle is stored, so the task
        // cannot remove its entry before it exists.
        let mut conns = self.shared.conns();
        let handle = tokio::spawn(
            async move {
                let _tracked = tracked;
                conn::serve_conn(backend, config, stream, info).await;
            }
            .instrument(span),
        );
        conns.insert(id, handle.abort_handle());
        drop(conns);
        handle
    }

    /// Stops accepting connections and waits for the active ones to end.
    ///
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosed`] if the server was already closed, and
    /// [`Error::Timeout`] if connections remain when the deadline passes.
    pub async fn shutdown(&self, deadline: Option<Duration>) -> Result<()> {
        self.shared.mark_closed()?;
        let mut active = self.shared.active.subscribe();
        with_deadline(deadline, async {
            active
                .wait_for(|n| *n == 0)
                .await
                .map(|_| ())
                .map_err(|_| Error::ServerClosed)
        })
        .await
    }

    /// Stops accepting connections and aborts the active ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosed`] if the server was already closed.
    pub fn close(&self) -> Result<()> {
        self.shared.mark_closed()?;
        let handles: Vec<AbortHandle> = self.shared.conns().values().cloned().collect();
        for handle in handles {
            handle.abort();
        }
        Ok(())
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
    fn test_backoff_doubles_and_caps() {
        let mut delay = next_backoff(None);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_backoff(Some(delay));
        assert_eq!(delay, Duration::from_millis(10));

        for _ in 0..20 {
            delay = next_backoff(Some(delay));
        }
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
