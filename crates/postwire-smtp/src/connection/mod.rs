//! Connection plumbing shared by the client and the server.

mod framed;
mod stream;

pub use framed::{RequestId, TextConn};
pub use stream::{
    AsyncStream, SmtpStream, connect_plain, connect_tls, create_tls_connector, server_name,
};

use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

/// Runs `fut` under an optional deadline.
///
/// `None` or a zero duration means no deadline. Expiry yields
/// [`Error::Timeout`].
///
/// # Errors
///
/// Returns the future's own error, or a timeout.
pub async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        _ => fut.await,
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

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let err = with_deadline(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline() {
        let value = with_deadline(Some(Duration::ZERO), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(with_deadline(None, async { Ok(1) }).await.unwrap(), 1);
    }
}
