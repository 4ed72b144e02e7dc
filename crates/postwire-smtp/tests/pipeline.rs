//! End-to-end tests: the client talking to the server in the same process.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use tokio::io::duplex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use common::{Sink, config, init_tracing, tls_client_config, tls_server_config};
use postwire_sasl::{Login, Plain};
use postwire_smtp::client::{Client, ClientConfig, Security};
use postwire_smtp::server::{Server, ServerConfig};
use postwire_smtp::types::{DsnNotify, RcptOptions, SendOptions};
use postwire_smtp::{Error, Result};

fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .local_name("client.test")
        .security(Security::Plain)
        .command_timeout(Duration::from_secs(5))
        .build()
}

/// Connects a client to a server over an in-memory stream.
fn pair(config: ServerConfig, sink: Sink, client: ClientConfig) -> (Client, JoinHandle<Result<()>>) {
    init_tracing();
    let server = Server::new(config, sink);
    let (local, remote) = duplex(64 * 1024);
    let handle = tokio::spawn(async move { server.serve_stream(remote, None).await });
    (Client::from_stream(local, client), handle)
}

async fn envelope(client: &mut Client) {
    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    client
        .rcpt("bob@example.com", &RcptOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_data_round_trip() {
    let sink = Sink::new();
    let client_config = ClientConfig {
        chunking_max_size: -1,
        ..client_config()
    };
    let (mut client, handle) = pair(config().build(), sink.clone(), client_config);

    envelope(&mut client).await;
    let mut body = client.content(0).await.unwrap();
    assert!(!body.is_chunked());
    body.write(b"Subject: test\n\n.hidden\nbye\n").await.unwrap();
    let reply = body.close().await.unwrap();
    assert!(reply.text().ends_with("queued as Q1"));

    client.quit().await.unwrap();
    handle.await.unwrap().unwrap();

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].from, "alice@example.com");
    assert_eq!(
        delivered[0].body,
        b"Subject: test\r\n\r\n.hidden\r\nbye\r\n"
    );
}

#[tokio::test]
async fn test_bdat_round_trip() {
    let sink = Sink::new();
    let client_config = ClientConfig {
        chunking_max_size: 4,
        ..client_config()
    };
    let (mut client, handle) = pair(config().build(), sink.clone(), client_config);

    envelope(&mut client).await;
    let message = b"0123456789\r\n";
    let mut body = client.content(message.len() as u64).await.unwrap();
    assert!(body.is_chunked());
    body.write(message).await.unwrap();
    body.close().await.unwrap();

    client.quit().await.unwrap();
    handle.await.unwrap().unwrap();

    let delivered = sink.delivered();
    assert_eq!(delivered[0].body, message);
    assert!(delivered[0].chunked);
}

#[tokio::test]
async fn test_buffered_bdat_round_trip() {
    let sink = Sink::new();
    let (mut client, _handle) = pair(config().build(), sink.clone(), client_config());

    envelope(&mut client).await;
    let mut body = client.content(0).await.unwrap();
    body.write(b"Subject: a\r\n").await.unwrap();
    body.write(b"\r\nbody\r\n").await.unwrap();
    body.close().await.unwrap();

    assert_eq!(sink.delivered()[0].body, b"Subject: a\r\n\r\nbody\r\n");
}

#[tokio::test]
async fn test_second_transaction_on_same_connection() {
    let sink = Sink::new();
    let (mut client, _handle) = pair(config().build(), sink.clone(), client_config());

    for i in 0..2 {
        envelope(&mut client).await;
        let mut body = client.content(0).await.unwrap();
        body.write(format!("message {i}\r\n").as_bytes())
            .await
            .unwrap();
        let reply = body.close().await.unwrap();
        assert!(reply.text().ends_with(&format!("Q{}", i + 1)));
    }
    assert_eq!(sink.delivered().len(), 2);
}

#[tokio::test]
async fn test_dsn_reaches_server() {
    let sink = Sink::new();
    let config = config().enable_dsn(true).build();
    let (mut client, _handle) = pair(config, sink.clone(), client_config());

    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    let rcpt = RcptOptions {
        notify: vec![DsnNotify::Never],
        ..RcptOptions::default()
    };
    client.rcpt("bob@example.com", &rcpt).await.unwrap();
    let mut body = client.content(0).await.unwrap();
    body.write(b"x\r\n").await.unwrap();
    body.close().await.unwrap();

    assert_eq!(sink.delivered()[0].notify, vec![DsnNotify::Never]);
}

#[tokio::test]
async fn test_refused_recipient() {
    let (mut client, _handle) = pair(config().build(), Sink::new(), client_config());

    client
        .mail("alice@example.com", &SendOptions::default())
        .await
        .unwrap();
    let err = client
        .rcpt("nobody@example.com", &RcptOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(err.status().unwrap().message, "No such user");

    client.noop().await.unwrap();
    client.reset().await.unwrap();
}

#[tokio::test]
async fn test_oversized_message() {
    let sink = Sink::new();
    let config = config().max_message_bytes(16).build();
    let client_config = ClientConfig {
        chunking_max_size: -1,
        ..client_config()
    };
    let (mut client, _handle) = pair(config, sink.clone(), client_config);

    envelope(&mut client).await;
    let mut body = client.content(0).await.unwrap();
    body.write(&[b'a'; 64]).await.unwrap();
    let err = body.close().await.unwrap_err();
    assert_eq!(err.status().unwrap().code.as_u16(), 552);

    // Still usable after the refusal.
    client.noop().await.unwrap();
    assert!(sink.delivered().is_empty());
}

mod auth {
    use super::*;

    #[tokio::test]
    async fn test_plain() {
        let (mut client, _handle) = pair(config().build(), Sink::with_auth(), client_config());
        client.hello().await.unwrap();
        assert!(client.supports_auth("PLAIN"));
        client.auth(&mut Plain::new("", "user", "pass")).await.unwrap();
        envelope(&mut client).await;
    }

    #[tokio::test]
    async fn test_login() {
        let (mut client, _handle) = pair(config().build(), Sink::with_auth(), client_config());
        client.auth(&mut Login::new("user", "pass")).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let (mut client, _handle) = pair(config().build(), Sink::with_auth(), client_config());
        let err = client
            .auth(&mut Plain::new("", "user", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.status().unwrap().code.as_u16(), 535);

        // A failed attempt leaves the session unauthenticated but usable.
        client.auth(&mut Plain::new("", "user", "pass")).await.unwrap();
    }

    #[tokio::test]
    async fn test_enforced() {
        let config = config().enforce_authentication(true).build();
        let (mut client, _handle) = pair(config, Sink::with_auth(), client_config());

        let err = client
            .mail("alice@example.com", &SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status().unwrap().code.as_u16(), 530);

        client.auth(&mut Plain::new("", "user", "pass")).await.unwrap();
        envelope(&mut client).await;
    }
}

#[tokio::test]
async fn test_starttls_unavailable() {
    let (mut client, handle) = pair(config().build(), Sink::new(), client_config());
    client.hello().await.unwrap();
    assert!(client.extension("STARTTLS").is_none());

    let err = client.starttls("mx.test").await.unwrap_err();
    assert_eq!(err.status().unwrap().code.as_u16(), 502);
    // A refused STARTTLS ends the session.
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_starttls_round_trip() {
    let sink = Sink::with_auth();
    let config = config().tls(tls_server_config()).build();
    let client_config = ClientConfig {
        tls: Some(tls_client_config()),
        ..client_config()
    };
    let (mut client, handle) = pair(config, sink.clone(), client_config);

    client.hello().await.unwrap();
    assert!(client.extension("STARTTLS").is_some());
    client.starttls("mx.test").await.unwrap();
    assert!(client.is_tls());
    // Capabilities were read again over TLS.
    assert!(client.extension("STARTTLS").is_none());
    assert!(client.supports_auth("PLAIN"));

    client.auth(&mut Plain::new("", "user", "pass")).await.unwrap();
    envelope(&mut client).await;
    let mut body = client.content(0).await.unwrap();
    body.write(b"encrypted\r\n").await.unwrap();
    body.close().await.unwrap();
    client.quit().await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.delivered()[0].body, b"encrypted\r\n");
}

#[tokio::test]
async fn test_starttls_rejects_untrusted_certificate() {
    let config = config().tls(tls_server_config()).build();
    let (mut client, handle) = pair(config, Sink::new(), client_config());

    // The default trust store does not know the self-signed certificate.
    let err = client.starttls("mx.test").await.unwrap_err();
    assert!(err.is_connection_fatal());
    assert!(client.noop().await.is_err());
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_serve_and_shutdown() {
    init_tracing();
    let sink = Sink::new();
    let server = Server::new(config().build(), sink.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut client = Client::connect(&addr, client_config()).await.unwrap();
    assert!(!client.is_tls());
    assert_eq!(client.server_name(), "mx.test");
    envelope(&mut client).await;
    let mut body = client.content(0).await.unwrap();
    body.write(b"over tcp\r\n").await.unwrap();
    body.close().await.unwrap();
    client.quit().await.unwrap();

    server.shutdown(Some(Duration::from_secs(5))).await.unwrap();
    assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
    assert_eq!(server.active_connections(), 0);
    assert!(matches!(
        server.shutdown(None).await,
        Err(Error::ServerClosed)
    ));
    assert_eq!(sink.delivered()[0].body, b"over tcp\r\n");
}

#[tokio::test]
async fn test_required_starttls_not_offered() {
    init_tracing();
    let server = Server::new(config().build(), Sink::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client_config = ClientConfig {
        security: Security::StartTls,
        ..client_config()
    };
    let err = Client::connect(&addr, client_config).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));

    server.close().unwrap();
    assert!(serving.await.unwrap().is_err());
}
