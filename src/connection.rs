//! The protocol-polymorphic handle the pool actually holds: an `Http1`/`Http2`
//! sum type over the two connection state machines. An enum keeps this a
//! closed, exhaustively-matchable set rather than many small trait objects,
//! the same choice `rama-http-core` makes between its own `proto::h1`/
//! `proto::h2` connection types at the `client` module boundary.

use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::{ClientBody, IncomingBody};
use crate::error::Result;
use crate::h1::{self, Http1Connection};
use crate::h2::{self, Http2Connection};
use crate::timeouts::Timeouts;

/// The negotiated protocol, exposed on every [`Response`] via `version()`
/// and usable as a standalone "protocol tag" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// The protocol tag as it appears in an HTTP status line: `"HTTP/1.1"`
    /// or `"HTTP/2"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
        }
    }

    /// Which variant to instantiate, given the protocol ALPN negotiated
    /// during the TLS handshake. Returns `None` for an unrecognised or
    /// absent ALPN value, in which case the caller should fall back to H1.
    #[must_use]
    pub fn from_alpn(negotiated: &[u8]) -> Option<Self> {
        match negotiated {
            b"h2" => Some(Self::Http2),
            b"http/1.1" => Some(Self::Http1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single connection to an origin, in either protocol.
///
/// The pool constructs one of these after a socket (and, for TLS, ALPN
/// negotiation) is established, and drives every request for that origin
/// through `send` until `is_closed()` reports `true`.
pub enum Connection<S> {
    Http1(Http1Connection<S>),
    Http2(Http2Connection),
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http1(c) => f.debug_tuple("Connection::Http1").field(c).finish(),
            Self::Http2(c) => f.debug_tuple("Connection::Http2").field(c).finish(),
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap `io` as an HTTP/1.1 connection. Never suspends: the H1 state
    /// machine only touches the wire on the first `send`.
    pub fn http1(io: S, timeouts: Timeouts, on_release: Option<h1::OnRelease>) -> Self {
        Self::Http1(Http1Connection::new(io, timeouts, on_release))
    }

    /// Wrap `io` as an HTTP/2 connection, driving the connection preface and
    /// initial SETTINGS before returning.
    pub async fn http2(io: S, timeouts: Timeouts, on_release: Option<h2::OnRelease>) -> Result<Self> {
        Ok(Self::Http2(Http2Connection::handshake(io, timeouts, on_release).await?))
    }

    /// Which protocol this connection speaks.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Http1(_) => Protocol::Http1,
            Self::Http2(_) => Protocol::Http2,
        }
    }

    /// Send one request. For H1 this requires the previous exchange on this
    /// connection to already be finished; for H2 it may be called
    /// concurrently from many callers.
    pub async fn send(&mut self, req: Request<ClientBody>) -> Result<Response<IncomingBody>> {
        match self {
            Self::Http1(c) => c.send(req).await,
            Self::Http2(c) => c.send(req).await,
        }
    }

    /// True once this connection can no longer serve new requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Http1(c) => c.is_closed(),
            Self::Http2(c) => c.is_closed(),
        }
    }

    /// Explicitly close the connection, independent of any in-flight `send`.
    pub fn close(&self) {
        match self {
            Self::Http1(c) => c.close(),
            Self::Http2(c) => c.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tag_matches_the_spec_literal_strings() {
        assert_eq!(Protocol::Http1.as_str(), "HTTP/1.1");
        assert_eq!(Protocol::Http2.as_str(), "HTTP/2");
    }

    #[test]
    fn protocol_from_alpn_recognises_both_values_and_rejects_others() {
        assert_eq!(Protocol::from_alpn(b"h2"), Some(Protocol::Http2));
        assert_eq!(Protocol::from_alpn(b"http/1.1"), Some(Protocol::Http1));
        assert_eq!(Protocol::from_alpn(b"spdy/3.1"), None);
    }
}
