//! # postwire-sasl
//!
//! SASL mechanisms for mail protocols, in both roles.
//!
//! ## Features
//!
//! - **Client mechanisms**: PLAIN (RFC 4616), LOGIN, XOAUTH2 and
//!   OAUTHBEARER (RFC 7628)
//! - **Server mechanisms**: PLAIN and LOGIN with a credential callback
//!
//! Mechanisms work on raw bytes. Base64 transport encoding belongs to the
//! protocol that carries the exchange (SMTP `AUTH`, IMAP `AUTHENTICATE`).
//!
//! ## Quick Start
//!
//! ```
//! use postwire_sasl::{Mechanism, Plain};
//!
//! let mut plain = Plain::new("", "user@example.com", "secret");
//! let (name, initial) = plain.start().unwrap();
//! assert_eq!(name, "PLAIN");
//! assert_eq!(initial.unwrap(), b"\0user@example.com\0secret");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod server;

pub use client::{Login, Mechanism, OAuthBearer, Plain, XOAuth2};
pub use error::{Error, Result};
pub use server::{LoginServer, PlainServer, ServerMechanism, Step};

/// Name of the PLAIN mechanism.
pub const PLAIN: &str = "PLAIN";
/// Name of the LOGIN mechanism.
pub const LOGIN: &str = "LOGIN";
/// Name of the XOAUTH2 mechanism.
pub const XOAUTH2: &str = "XOAUTH2";
/// Name of the OAUTHBEARER mechanism.
pub const OAUTHBEARER: &str = "OAUTHBEARER";
