//! Protocol-level tests for the server, driven line by line over an
//! in-memory connection.

#![allow(clippy::unwrap_used, clippy::similar_names)]

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use common::{
    CRASHING_USER, Sink, attach, config, connect, init_tracing, tls_client_config,
    tls_server_config,
};
use postwire_smtp::server::Server;
use postwire_smtp::types::DsnNotify;

#[tokio::test]
async fn test_ehlo_advertises_configured_extensions() {
    let config = config()
        .enable_dsn(true)
        .max_message_bytes(1024)
        .max_recipients(2)
        .build();
    let (mut peer, _server, _handle) = connect(config, Sink::new()).await;

    let lines = peer.cmd_lines("EHLO client.test").await;
    assert_eq!(lines[0], "250-Hello client.test");
    assert!(lines.contains(&"250-PIPELINING".to_string()));
    assert!(lines.contains(&"250-CHUNKING".to_string()));
    assert!(lines.contains(&"250-DSN".to_string()));
    assert!(lines.contains(&"250-SIZE 1024".to_string()));
    assert_eq!(lines.last().unwrap(), "250 LIMITS RCPTMAX=2");
    assert!(!lines.iter().any(|l| l.contains("STARTTLS")));
    assert!(!lines.iter().any(|l| l.contains("AUTH")));
}

#[tokio::test]
async fn test_helo_replies_with_single_line() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    let lines = peer.cmd_lines("HELO client.test").await;
    assert_eq!(lines, vec!["250 2.0.0 Hello client.test".to_string()]);
}

#[tokio::test]
async fn test_data_transaction() {
    let sink = Sink::new();
    let (mut peer, _server, handle) = connect(config().build(), sink.clone()).await;

    peer.cmd("EHLO client.test").await;
    assert_eq!(
        peer.cmd("MAIL FROM:<alice@example.com>").await,
        "250 2.0.0 Roger, accepting mail from <alice@example.com>"
    );
    assert_eq!(
        peer.cmd("RCPT TO:<bob@example.com>").await,
        "250 2.0.0 I'll make sure <bob@example.com> gets this"
    );
    assert_eq!(
        peer.cmd("DATA").await,
        "354 Go ahead. End your data with <CR><LF>.<CR><LF>"
    );
    peer.send("Subject: hi\r\n\r\n..leading dot\r\n.\r\n").await;
    assert_eq!(peer.reply().await, vec!["250 2.0.0 OK: queued as Q1"]);
    assert_eq!(peer.cmd("QUIT").await, "221 2.0.0 Bye");
    assert!(peer.closed().await);
    handle.await.unwrap().unwrap();

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].from, "alice@example.com");
    assert_eq!(delivered[0].to, vec!["bob@example.com".to_string()]);
    assert_eq!(delivered[0].body, b"Subject: hi\r\n\r\n.leading dot\r\n");
    assert!(!delivered[0].chunked);
}

#[tokio::test]
async fn test_rcpt_before_mail_is_refused() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    assert_eq!(
        peer.cmd("RCPT TO:<bob@example.com>").await,
        "502 5.5.1 RCPT command unknown, state greeted"
    );
}

#[tokio::test]
async fn test_commands_before_hello_are_refused() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    assert_eq!(
        peer.cmd("MAIL FROM:<alice@example.com>").await,
        "502 5.5.1 MAIL command unknown, state init"
    );
}

#[tokio::test]
async fn test_ehlo_mid_transaction_resets() {
    let sink = Sink::new();
    let (mut peer, _server, _handle) = connect(config().build(), sink.clone()).await;

    peer.cmd("EHLO client.test").await;
    peer.cmd("MAIL FROM:<alice@example.com>").await;
    peer.cmd("RCPT TO:<bob@example.com>").await;
    peer.cmd("EHLO client.test").await;

    assert_eq!(
        peer.cmd("DATA").await,
        "502 5.5.1 DATA command unknown, state greeted"
    );
    assert!(sink.delivered().is_empty());
}

#[tokio::test]
async fn test_rset_ends_transaction() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    peer.cmd("MAIL FROM:<alice@example.com>").await;
    assert_eq!(peer.cmd("RSET").await, "250 2.0.0 Session reset");
    assert_eq!(
        peer.cmd("RCPT TO:<bob@example.com>").await,
        "502 5.5.1 RCPT command unknown, state greeted"
    );
}

#[tokio::test]
async fn test_session_refusal_is_relayed() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    peer.cmd("MAIL FROM:<alice@example.com>").await;
    assert_eq!(
        peer.cmd("RCPT TO:<nobody@example.com>").await,
        "550 5.1.1 No such user"
    );
    assert!(
        peer.cmd("RCPT TO:<bob@example.com>")
            .await
            .starts_with("250 ")
    );
}

mod dsn {
    use super::*;

    #[tokio::test]
    async fn test_notify_needs_dsn() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        assert_eq!(
            peer.cmd("RCPT TO:<bob@example.com> NOTIFY=NEVER").await,
            "504 5.5.4 NOTIFY is not implemented"
        );
    }

    #[tokio::test]
    async fn test_notify_reaches_session() {
        let sink = Sink::new();
        let config = config().enable_dsn(true).build();
        let (mut peer, _server, _handle) = connect(config, sink.clone()).await;

        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com> RET=HDRS ENVID=abc").await;
        assert!(
            peer.cmd("RCPT TO:<bob@example.com> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;bob@example.com")
                .await
                .starts_with("250 ")
        );
        peer.cmd("DATA").await;
        peer.send("x\r\n.\r\n").await;
        peer.reply().await;

        let delivered = sink.delivered();
        assert_eq!(
            delivered[0].notify,
            vec![DsnNotify::Success, DsnNotify::Failure]
        );
    }

    #[tokio::test]
    async fn test_never_excludes_other_notify_values() {
        let config = config().enable_dsn(true).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        assert_eq!(
            peer.cmd("RCPT TO:<bob@example.com> NOTIFY=NEVER,DELAY").await,
            "501 5.5.4 Malformed NOTIFY parameter value"
        );
    }
}

mod limits {
    use super::*;

    #[tokio::test]
    async fn test_recipient_limit() {
        let config = config().max_recipients(1).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        assert!(
            peer.cmd("RCPT TO:<bob@example.com>")
                .await
                .starts_with("250 ")
        );
        assert_eq!(
            peer.cmd("RCPT TO:<carol@example.com>").await,
            "452 4.5.3 Maximum limit of 1 recipients reached"
        );
    }

    #[tokio::test]
    async fn test_declared_size_over_limit() {
        let config = config().max_message_bytes(100).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd("MAIL FROM:<alice@example.com> SIZE=101").await,
            "552 5.3.4 Max message size exceeded"
        );
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let sink = Sink::new();
        let config = config().max_message_bytes(8).build();
        let (mut peer, _server, _handle) = connect(config, sink.clone()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        peer.cmd("RCPT TO:<bob@example.com>").await;
        peer.cmd("DATA").await;
        peer.send("0123456789abcdef\r\n.\r\n").await;
        assert_eq!(
            peer.reply().await,
            vec!["552 5.3.4 Maximum message size exceeded"]
        );
        // The connection survives and the transaction is gone.
        assert_eq!(
            peer.cmd("NOOP").await,
            "250 2.0.0 I have successfully done nothing"
        );
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_long_line_closes_connection() {
        let config = config().max_line_length(64).build();
        let (mut peer, _server, handle) = connect(config, Sink::new()).await;
        let line = format!("EHLO {}", "a".repeat(100));
        assert_eq!(peer.cmd(&line).await, "500 5.4.0 Too long line");
        assert!(peer.closed().await);
        handle.await.unwrap().unwrap();
    }
}

mod chunking {
    use super::*;

    #[tokio::test]
    async fn test_bdat_chunks() {
        let sink = Sink::new();
        let (mut peer, _server, _handle) = connect(config().build(), sink.clone()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        peer.cmd("RCPT TO:<bob@example.com>").await;

        peer.send("BDAT 6\r\nhello ").await;
        assert_eq!(peer.reply().await, vec!["250 2.0.0 Continue"]);
        peer.send("BDAT 7 LAST\r\nworld\r\n").await;
        assert_eq!(peer.reply().await, vec!["250 2.0.0 OK: queued as Q1"]);

        let delivered = sink.delivered();
        assert_eq!(delivered[0].body, b"hello world\r\n");
        assert!(delivered[0].chunked);
    }

    #[tokio::test]
    async fn test_bdat_bytes_are_not_unstuffed() {
        let sink = Sink::new();
        let (mut peer, _server, _handle) = connect(config().build(), sink.clone()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        peer.cmd("RCPT TO:<bob@example.com>").await;

        peer.send("BDAT 7 LAST\r\n..\r\n.\r\n").await;
        assert_eq!(peer.reply().await, vec!["250 2.0.0 OK: queued as Q1"]);
        assert_eq!(sink.delivered()[0].body, b"..\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_bdat_disabled() {
        let config = config().enable_chunking(false).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        let lines = peer.cmd_lines("EHLO client.test").await;
        assert!(!lines.iter().any(|l| l.contains("CHUNKING")));
        peer.cmd("MAIL FROM:<alice@example.com>").await;
        assert_eq!(
            peer.cmd("BDAT 3 LAST").await,
            "504 5.5.4 CHUNKING is not implemented"
        );
    }

    #[tokio::test]
    async fn test_data_refused_for_binarymime() {
        let config = config().enable_binarymime(true).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        peer.cmd("MAIL FROM:<alice@example.com> BODY=BINARYMIME").await;
        peer.cmd("RCPT TO:<bob@example.com>").await;
        assert_eq!(
            peer.cmd("DATA").await,
            "502 5.5.1 DATA not allowed for BINARYMIME messages"
        );
    }
}

mod auth {
    use super::*;

    fn plain(user: &str, pass: &str) -> String {
        BASE64.encode(format!("\0{user}\0{pass}"))
    }

    #[tokio::test]
    async fn test_ehlo_lists_mechanisms() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        let lines = peer.cmd_lines("EHLO client.test").await;
        assert!(lines.contains(&"250-AUTH PLAIN LOGIN".to_string()));
    }

    #[tokio::test]
    async fn test_plain_with_initial_response() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd(&format!("AUTH PLAIN {}", plain("user", "pass"))).await,
            "235 2.0.0 Authentication succeeded"
        );
        assert_eq!(
            peer.cmd(&format!("AUTH PLAIN {}", plain("user", "pass"))).await,
            "503 5.5.1 Already authenticated"
        );
    }

    #[tokio::test]
    async fn test_plain_wrong_password() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd(&format!("AUTH PLAIN {}", plain("user", "nope"))).await,
            "535 5.7.8 Authentication failed"
        );
    }

    #[tokio::test]
    async fn test_login_challenges() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd("AUTH LOGIN").await,
            format!("334 {}", BASE64.encode("Username:"))
        );
        assert_eq!(
            peer.cmd(&BASE64.encode("user")).await,
            format!("334 {}", BASE64.encode("Password:"))
        );
        assert_eq!(
            peer.cmd(&BASE64.encode("pass")).await,
            "235 2.0.0 Authentication succeeded"
        );
    }

    #[tokio::test]
    async fn test_client_cancels() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert!(peer.cmd("AUTH LOGIN").await.starts_with("334 "));
        assert_eq!(peer.cmd("*").await, "501 5.0.0 Negotiation cancelled");
    }

    #[tokio::test]
    async fn test_unknown_mechanism() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd("AUTH CRAM-MD5").await,
            "504 5.7.4 Unsupported authentication mechanism"
        );
    }

    #[tokio::test]
    async fn test_not_offered() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd(&format!("AUTH PLAIN {}", plain("user", "pass"))).await,
            "502 5.7.0 Authentication not supported"
        );
    }

    #[tokio::test]
    async fn test_enforced_authentication() {
        let config = config().enforce_authentication(true).build();
        let (mut peer, _server, _handle) = connect(config, Sink::with_auth()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd("MAIL FROM:<alice@example.com>").await,
            "530 5.7.0 Authentication required"
        );
        peer.cmd(&format!("AUTH PLAIN {}", plain("user", "pass"))).await;
        assert!(
            peer.cmd("MAIL FROM:<alice@example.com>")
                .await
                .starts_with("250 ")
        );
    }
}

mod tls {
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, duplex};
    use tokio_rustls::TlsConnector;

    #[tokio::test]
    async fn test_starttls_without_config() {
        let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(peer.cmd("STARTTLS").await, "502 5.5.1 TLS not supported");
    }

    #[tokio::test]
    async fn test_starttls_refuses_pipelined_commands() {
        let config = config().tls(tls_server_config()).build();
        let (mut peer, _server, handle) = connect(config, Sink::new()).await;
        let ehlo = peer.cmd_lines("EHLO client.test").await;
        assert!(ehlo.iter().any(|line| line.ends_with("STARTTLS")));

        // Plaintext sent in the same packet as STARTTLS.
        peer.send("STARTTLS\r\nNOOP\r\n").await;
        assert_eq!(peer.reply().await, ["421 4.4.0 Connection error, sorry"]);
        assert!(peer.closed().await);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_without_reply() {
        let config = config().tls(tls_server_config()).build();
        let (mut peer, _server, handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(peer.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");

        peer.send("this is not a TLS record\r\n").await;
        // At most a TLS alert comes back, never an SMTP reply.
        let rest = peer.drain().await;
        assert!(!String::from_utf8_lossy(&rest).contains("Handshake"));
        assert!(!rest.starts_with(b"5"));
        handle.await.unwrap().unwrap();
    }

    async fn last_line<S: AsyncBufRead + Unpin>(stream: &mut S) -> String {
        loop {
            let mut line = String::new();
            assert_ne!(stream.read_line(&mut line).await.unwrap(), 0, "connection closed");
            let line = line.trim_end().to_string();
            if line.as_bytes().get(3) != Some(&b'-') {
                return line;
            }
        }
    }

    async fn send<S: AsyncBufRead + AsyncWrite + Unpin>(stream: &mut S, line: &str) -> String {
        stream.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        last_line(stream).await
    }

    #[tokio::test]
    async fn test_upgrade_forgets_hello() {
        init_tracing();
        let sink = Sink::new();
        let server = Server::new(config().tls(tls_server_config()).build(), sink.clone());
        let (local, remote) = duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.serve_stream(remote, None).await });

        let mut plain = BufReader::new(local);
        assert!(last_line(&mut plain).await.starts_with("220 "));
        send(&mut plain, "EHLO client.test").await;
        send(&mut plain, "MAIL FROM:<alice@example.com>").await;
        assert_eq!(
            send(&mut plain, "STARTTLS").await,
            "220 2.0.0 Ready to start TLS"
        );

        let connector = TlsConnector::from(tls_client_config());
        let name = ServerName::try_from("mx.test").unwrap();
        let tls = connector.connect(name, plain.into_inner()).await.unwrap();
        let mut tls = BufReader::new(tls);

        // The plaintext greeting and transaction do not carry over.
        assert_eq!(
            send(&mut tls, "MAIL FROM:<alice@example.com>").await,
            "502 5.5.1 MAIL command unknown, state upgrade"
        );
        tls.write_all(b"EHLO client.test\r\n").await.unwrap();
        let mut caps = Vec::new();
        loop {
            let mut line = String::new();
            tls.read_line(&mut line).await.unwrap();
            let last = line.as_bytes().get(3) != Some(&b'-');
            caps.push(line.trim_end().to_string());
            if last {
                break;
            }
        }
        assert!(!caps.iter().any(|line| line.ends_with("STARTTLS")));

        assert!(send(&mut tls, "MAIL FROM:<alice@example.com>").await.starts_with("250 "));
        assert!(send(&mut tls, "RCPT TO:<bob@example.com>").await.starts_with("250 "));
        assert_eq!(send(&mut tls, "DATA").await.get(..3), Some("354"));
        assert!(send(&mut tls, "secret\r\n.").await.starts_with("250 "));
        send(&mut tls, "QUIT").await;
        handle.await.unwrap().unwrap();

        let delivered = sink.delivered();
        assert_eq!(delivered[0].from, "alice@example.com");
        assert_eq!(delivered[0].body, b"secret\r\n");
    }

    #[tokio::test]
    async fn test_enforced_tls_refuses_mail() {
        let config = config().enforce_secure_connection(true).build();
        let (mut peer, _server, _handle) = connect(config, Sink::new()).await;
        peer.cmd("EHLO client.test").await;
        assert_eq!(
            peer.cmd("MAIL FROM:<alice@example.com>").await,
            "530 5.7.0 Must issue a STARTTLS command first"
        );
    }
}

#[tokio::test]
async fn test_panicking_session_is_contained() {
    let (mut peer, server, handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    peer.cmd("MAIL FROM:<alice@example.com>").await;
    assert_eq!(
        peer.cmd(&format!("RCPT TO:<{CRASHING_USER}@example.com>"))
            .await,
        "421 4.0.0 Internal server error"
    );
    assert!(peer.closed().await);
    handle.await.unwrap().unwrap();
    assert_eq!(server.active_connections(), 0);

    // The server keeps accepting connections.
    let (mut peer, _handle) = attach(&server).await;
    peer.cmd("EHLO client.test").await;
    assert!(
        peer.cmd("MAIL FROM:<alice@example.com>")
            .await
            .starts_with("250 ")
    );
}

#[tokio::test]
async fn test_vrfy_default_reply() {
    let (mut peer, _server, _handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    assert_eq!(
        peer.cmd("VRFY bob@example.com").await,
        "252 2.5.0 Cannot VRFY user, but will accept message"
    );
}

#[tokio::test]
async fn test_close_aborts_connections() {
    let (mut peer, server, handle) = connect(config().build(), Sink::new()).await;
    peer.cmd("EHLO client.test").await;
    assert_eq!(server.active_connections(), 1);

    server.close().unwrap();
    handle.await.unwrap().unwrap();
    assert!(peer.closed().await);
    assert_eq!(server.active_connections(), 0);
    assert!(server.close().is_err());
}
