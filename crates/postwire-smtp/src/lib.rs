//! # postwire-smtp
//!
//! SMTP protocol engine with both a client and a server, implementing
//! RFC 5321.
//!
//! ## Features
//!
//! - **Server**: per-connection state machine driving a pluggable
//!   [`server::Backend`], with STARTTLS, implicit TLS, AUTH and graceful
//!   shutdown
//! - **Client**: greeting and EHLO handshake, STARTTLS, SASL AUTH, MAIL/RCPT
//!   with ESMTP parameters and DATA or BDAT body transfer
//! - **Body codecs**: dot-stuffed `DATA` and chunked `BDAT` (RFC 3030), both
//!   strict about line endings
//! - **Extensions**: SIZE, PIPELINING, 8BITMIME, CHUNKING, BINARYMIME, DSN,
//!   SMTPUTF8, REQUIRETLS, ENHANCEDSTATUSCODES, LIMITS, XOORG
//!
//! ## Quick Start
//!
//! ```ignore
//! use postwire_smtp::client::{Client, ClientConfig};
//! use postwire_smtp::types::SendOptions;
//!
//! #[tokio::main]
//! async fn main() -> postwire_smtp::Result<()> {
//!     let config = ClientConfig::builder().local_name("client.example.com").build();
//!     let mut client = Client::connect("mx.example.com:25", config).await?;
//!
//!     client.mail("sender@example.com", &SendOptions::default()).await?;
//!     client.rcpt("rcpt@example.com", &Default::default()).await?;
//!
//!     let mut body = client.content(0).await?;
//!     body.write(b"Subject: Test\r\n\r\nHello, World!\r\n").await?;
//!     let reply = body.close().await?;
//!     println!("accepted: {}", reply.text());
//!
//!     client.quit().await
//! }
//! ```
//!
//! ## Errors
//!
//! Every failure is an [`Error`]. Protocol replies travel as
//! [`Error::Status`]; use [`Error::is_temporary`] and
//! [`Error::is_permanent`] to decide on retries and
//! [`Error::is_connection_fatal`] to decide whether the connection can be
//! reused.
//!
//! ## Modules
//!
//! - [`client`]: SMTP client
//! - [`server`]: SMTP server and backend traits
//! - [`codec`]: `DATA`/`BDAT` body codecs and xtext encodings
//! - [`connection`]: line framing, TLS streams and deadlines
//! - [`parser`]: command, reply and path parsers
//! - [`types`]: status, reply, extension and option types

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod client;
pub mod codec;
pub mod connection;
mod error;
pub mod parser;
pub mod server;
pub mod types;

pub use error::{Error, Result};
pub use types::{EnhancedCode, Extensions, Reply, ReplyCode, Status};
