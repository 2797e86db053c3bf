//! Per-connection HTTP transport core: HTTP/1.1 and HTTP/2 connection state
//! machines, TLS configuration, and auth mutators.
//!
//! ## What lives here
//!
//! - [`h1::Http1Connection`] / [`h2::Http2Connection`]: the two
//!   protocol-specific connection objects, unified behind [`Connection`].
//! - [`tls::TlsConfig`]: a validated, memoised TLS client configuration.
//! - [`auth`]: stateless `Authorization`-header mutators (`Basic`, `Bearer`).
//! - [`body`]: the lazy, pull-based byte-chunk streams used for both
//!   outgoing request bodies and incoming response bodies.
//! - [`timeouts::Timeouts`] / [`pool::PoolLimits`]: the small value types a
//!   connection pool built on top of this crate shares with it.
//!
//! ## What does NOT live here
//!
//! The connection pool, URL parsing, header containers beyond what the
//! [`http`] crate already provides, redirect following, cookie jars, and the
//! TCP/TLS socket implementation itself are all out of scope — this crate
//! only consumes `AsyncRead + AsyncWrite` transports and hands back
//! `http::Request`/`http::Response` values.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]
#![allow(unreachable_pub)]

pub mod auth;
pub mod body;
mod connection;
mod error;
pub mod h1;
pub mod h2;
pub mod pool;
pub mod timeouts;
pub mod tls;

pub use connection::{Connection, Protocol};
pub use error::{Error, Result};
