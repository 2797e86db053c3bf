//! HTTP/2 connection state machine: frame/HPACK mechanics delegated to the
//! `h2` crate, with a thin per-stream bookkeeping layer on top.

mod conn;

pub use conn::{Http2Connection, OnRelease};
