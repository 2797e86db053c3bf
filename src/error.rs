//! Error and Result types shared by every module in this crate.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Boxed, type-erased cause. Mirrors `rama_core::error::BoxError`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type returned from methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while driving an HTTP/1.1 or HTTP/2 connection, or while
/// building a [`crate::tls::TlsConfig`] context.
///
/// The `Display` impl only prints this level of the error; use
/// `std::error::Error::source` (or `Error::cause`) to walk the full chain.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    ConnectTimeout,
    ReadTimeout,
    WriteTimeout,
    Protocol,
    RemoteProtocol,
    StreamReset,
    Io,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn connect_timeout() -> Self {
        Self::new(Kind::ConnectTimeout)
    }

    pub(crate) fn read_timeout() -> Self {
        Self::new(Kind::ReadTimeout)
    }

    pub(crate) fn write_timeout() -> Self {
        Self::new(Kind::WriteTimeout)
    }

    pub(crate) fn protocol<C: Into<BoxError>>(cause: C) -> Self {
        Self::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn remote_protocol<C: Into<BoxError>>(cause: C) -> Self {
        Self::new(Kind::RemoteProtocol).with(cause)
    }

    pub(crate) fn stream_reset(reason: h2::Reason) -> Self {
        Self::new(Kind::StreamReset).with(reason)
    }

    pub(crate) fn io(cause: io::Error) -> Self {
        Self::new(Kind::Io).with(cause)
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// True if the peer or the codec violated the wire format; the connection
    /// that produced this error must be treated as fatally broken.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol | Kind::RemoteProtocol)
    }

    /// True if this was a per-I/O-operation read or write deadline, or a
    /// connect-timeout passed through from the transport layer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::ConnectTimeout | Kind::ReadTimeout | Kind::WriteTimeout
        )
    }

    /// True if this was an HTTP/2 `StreamReset`, which is fatal for the
    /// stream but not for the connection.
    #[must_use]
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::ConnectTimeout => f.write_str("connect timed out"),
            Kind::ReadTimeout => f.write_str("read timed out"),
            Kind::WriteTimeout => f.write_str("write timed out"),
            Kind::Protocol => f.write_str("protocol error"),
            Kind::RemoteProtocol => f.write_str("peer closed the connection mid-message"),
            Kind::StreamReset => f.write_str("stream reset"),
            Kind::Io => f.write_str("I/O error"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            Self::read_timeout().with(e)
        } else {
            Self::io(e)
        }
    }
}

impl From<h2::Error> for Error {
    fn from(e: h2::Error) -> Self {
        if e.is_reset() {
            Self::new(Kind::StreamReset).with(e)
        } else if e.is_remote() {
            Self::remote_protocol(e)
        } else {
            Self::protocol(e)
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::protocol(e)
    }
}
