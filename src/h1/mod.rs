//! HTTP/1.1 connection state machine: single in-flight exchange, framed
//! directly over `AsyncRead + AsyncWrite`.

mod codec;
mod conn;

pub use conn::{Http1Connection, OnRelease};
