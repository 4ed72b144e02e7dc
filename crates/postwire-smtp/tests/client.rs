//! Integration tests for the SMTP client.
//!
//! These tests use a mock stream that replays scripted server replies and
//! captures everything the client writes.

#![allow(clippy::unwrap_used, clippy::cast_possible_truncation)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use postwire_sasl::{Login, Plain};
use postwire_smtp::client::{Client, ClientConfig};
use postwire_smtp::types::{DsnNotify, DsnReturn, RcptOptions, SendOptions};

/// Mock stream that returns predefined replies.
struct MockStream {
    /// Replies to return, in order.
    replies: Cursor<Vec<u8>>,
    /// Commands sent by the client, shared with the test.
    sent: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(replies: &str) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            replies: Cursor::new(replies.as_bytes().to_vec()),
            sent: Arc::clone(&sent),
        };
        (stream, sent)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let data = self.replies.get_ref();
        let pos = self.replies.position() as usize;

        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let remaining = &data[pos..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.replies.set_position((pos + to_read) as u64);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

const GREETING: &str = "220 mx.example.com ESMTP ready\r\n";

fn client(replies: &str) -> (Client, Arc<Mutex<Vec<u8>>>) {
    let (stream, sent) = MockStream::new(replies);
    let config = ClientConfig::builder()
        .local_name("client.example.com")
        .build();
    (Client::from_stream(stream, config), sent)
}

fn sent(sent: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(sent.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn test_send_with_data() {
    let replies = format!(
        "{GREETING}\
         250-mx.example.com\r\n250 PIPELINING\r\n\
         250 2.1.0 OK\r\n\
         250 2.1.5 OK\r\n\
         354 Go ahead\r\n\
         250 2.0.0 OK: queued as ABC\r\n\
         221 2.0.0 Bye\r\n"
    );
    let (mut client, log) = client(&replies);

    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    client
        .rcpt("bob@example.com", &RcptOptions::default())
        .await
        .unwrap();
    assert_eq!(client.recipients(), ["bob@example.com".to_string()]);

    let mut body = client.content(0).await.unwrap();
    assert!(!body.is_chunked());
    body.write(b"Subject: hi\r\n\r\n.dot\r\n").await.unwrap();
    let reply = body.close().await.unwrap();
    assert_eq!(reply.code.as_u16(), 250);
    assert!(reply.text().ends_with("queued as ABC"));

    client.quit().await.unwrap();
    assert_eq!(
        sent(&log),
        "EHLO client.example.com\r\n\
         MAIL FROM:<alice@example.com>\r\n\
         RCPT TO:<bob@example.com>\r\n\
         DATA\r\n\
         Subject: hi\r\n\r\n..dot\r\n.\r\n\
         QUIT\r\n"
    );
}

#[tokio::test]
async fn test_send_with_bdat() {
    let replies = format!(
        "{GREETING}\
         250-mx.example.com\r\n250-8BITMIME\r\n250 CHUNKING\r\n\
         250 OK\r\n\
         250 OK\r\n\
         250 2.0.0 OK: queued\r\n"
    );
    let (mut client, log) = client(&replies);

    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    client
        .rcpt("bob@example.com", &RcptOptions::default())
        .await
        .unwrap();
    let mut body = client.content(11).await.unwrap();
    assert!(body.is_chunked());
    body.write(b"hello world").await.unwrap();
    body.close().await.unwrap();

    assert_eq!(
        sent(&log),
        "EHLO client.example.com\r\n\
         MAIL FROM:<alice@example.com> BODY=8BITMIME\r\n\
         RCPT TO:<bob@example.com>\r\n\
         BDAT 11 LAST\r\nhello world"
    );
}

#[tokio::test]
async fn test_dsn_envelope() {
    let replies = format!(
        "{GREETING}\
         250-mx.example.com\r\n250-DSN\r\n250 SIZE 10000\r\n\
         250 OK\r\n\
         250 OK\r\n"
    );
    let (mut client, log) = client(&replies);
    assert_eq!(client.max_message_size(), None);

    let opts = SendOptions {
        size: 512,
        ret: Some(DsnReturn::Full),
        envelope_id: Some("msg=1".to_string()),
        ..SendOptions::default()
    };
    client.mail("alice@example.com", &opts).await.unwrap();
    assert_eq!(client.max_message_size(), Some(10000));

    let rcpt = RcptOptions {
        notify: vec![DsnNotify::Failure, DsnNotify::Delay],
        ..RcptOptions::default()
    };
    client.rcpt("bob@example.com", &rcpt).await.unwrap();

    assert_eq!(
        sent(&log),
        "EHLO client.example.com\r\n\
         MAIL FROM:<alice@example.com> SIZE=512 RET=FULL ENVID=msg+3D1\r\n\
         RCPT TO:<bob@example.com> NOTIFY=FAILURE,DELAY\r\n"
    );
}

#[tokio::test]
async fn test_auth_login() {
    let replies = format!(
        "{GREETING}\
         250-mx.example.com\r\n250 AUTH LOGIN PLAIN\r\n\
         334 UGFzc3dvcmQ6\r\n\
         235 2.7.0 Authentication successful\r\n"
    );
    let (mut client, log) = client(&replies);

    client.hello().await.unwrap();
    assert!(client.supports_auth("LOGIN"));
    client.auth(&mut Login::new("user", "pass")).await.unwrap();

    assert_eq!(
        sent(&log),
        "EHLO client.example.com\r\nAUTH LOGIN dXNlcg==\r\ncGFzcw==\r\n"
    );
}

#[tokio::test]
async fn test_auth_rejected() {
    let replies = format!(
        "{GREETING}\
         250-mx.example.com\r\n250 AUTH PLAIN\r\n\
         535 5.7.8 Authentication credentials invalid\r\n"
    );
    let (mut client, _log) = client(&replies);

    let err = client
        .auth(&mut Plain::new("", "user", "wrong"))
        .await
        .unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(err.status().unwrap().code.as_u16(), 535);
}

#[tokio::test]
async fn test_refused_recipient_keeps_connection() {
    let replies = format!(
        "{GREETING}\
         250 mx.example.com\r\n\
         250 OK\r\n\
         550 5.1.1 No such user\r\n\
         250 OK\r\n\
         250 2.0.0 Reset\r\n"
    );
    let (mut client, _log) = client(&replies);

    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    let err = client
        .rcpt("nobody@example.com", &RcptOptions::default())
        .await
        .unwrap_err();
    assert!(!err.is_connection_fatal());
    assert!(client.recipients().is_empty());

    client
        .rcpt("bob@example.com", &RcptOptions::default())
        .await
        .unwrap();
    client.reset().await.unwrap();
    assert!(client.recipients().is_empty());
}

#[tokio::test]
async fn test_unexpected_close() {
    let (mut client, _log) = client(GREETING);

    let err = client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_connection_fatal());

    // The failure sticks.
    assert!(client.noop().await.is_err());
}

#[tokio::test]
async fn test_temporary_greeting_failure() {
    let (mut client, _log) = client("421 4.3.2 Too busy\r\n");

    let err = client.hello().await.unwrap_err();
    assert!(err.is_temporary());
    assert_eq!(err.status().unwrap().code.as_u16(), 421);
}
