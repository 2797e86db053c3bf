//! Request and response bodies: lazy, pull-based byte streams.
//!
//! Both directions are built around the same idea as `rama-http-core`'s own
//! `StreamingBody`/`Incoming` split (`rama-http-core/src/body/`): a body is
//! nothing more than a `Stream` of `Bytes` chunks, polled on demand by
//! whichever connection is driving it. We trade that design's channel-backed
//! `Sender`/`Incoming` pair (needed there because a body can be handed to a
//! different task than the one producing it) for a plain boxed stream, since
//! this layer only ever drives a body from the task that owns the connection.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;

use crate::error::Result;

type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An outgoing request body.
///
/// Construct one from a single in-memory buffer, or from an arbitrary
/// `Stream` when the caller wants to produce chunks lazily (e.g. reading a
/// file or forwarding another response). `len()` reports a known
/// content-length when one is available; `None` means the body must be sent
/// chunked.
#[must_use = "bodies do nothing unless polled by a connection"]
pub struct ClientBody {
    len: Option<u64>,
    inner: Inner,
}

enum Inner {
    Empty,
    Full(Bytes),
    Stream(BoxStream),
}

impl ClientBody {
    /// An empty body, for requests like `GET` that carry no payload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            len: Some(0),
            inner: Inner::Empty,
        }
    }

    /// A single, already-in-memory chunk with a known length.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            len: Some(bytes.len() as u64),
            inner: Inner::Full(bytes),
        }
    }

    /// A lazily produced body with a known total length, sent with a
    /// `Content-Length` header instead of chunked framing.
    pub fn from_stream_with_length(
        len: u64,
        stream: impl Stream<Item = Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            len: Some(len),
            inner: Inner::Stream(Box::pin(stream)),
        }
    }

    /// A lazily produced body whose length isn't known up front; sent with
    /// `Transfer-Encoding: chunked` over HTTP/1.1, or as a sequence of DATA
    /// frames over HTTP/2.
    pub fn from_stream(stream: impl Stream<Item = Result<Bytes>> + Send + 'static) -> Self {
        Self {
            len: None,
            inner: Inner::Stream(Box::pin(stream)),
        }
    }

    /// The body's length in bytes, if known ahead of the first poll.
    #[must_use]
    pub const fn len(&self) -> Option<u64> {
        self.len
    }

    /// True for a body known to carry zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }
}

impl fmt::Debug for ClientBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBody").field("len", &self.len).finish()
    }
}

impl Stream for ClientBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Empty => Poll::Ready(None),
            Inner::Full(bytes) => {
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(std::mem::take(bytes))))
                }
            }
            Inner::Stream(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl From<Bytes> for ClientBody {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for ClientBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&'static str> for ClientBody {
    fn from(s: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// A callback fired exactly once when an [`IncomingBody`] finishes or is
/// dropped, whichever comes first: the signal a connection pool or keep-alive
/// manager needs to know a connection is free for reuse (or must be closed,
/// if the body was dropped before being fully read).
type ReleaseHook = Box<dyn FnOnce(ReleaseReason) + Send>;

/// Why an [`IncomingBody`]'s release hook fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The stream was read to completion (`poll_next` returned `None`).
    Exhausted,
    /// The body was dropped before it was fully read; the connection that
    /// produced it cannot be safely reused and should be closed.
    Dropped,
}

/// A response body.
///
/// Wraps a chunk stream together with a release hook that fires exactly once
/// — on natural exhaustion or on drop, whichever happens first — so whatever
/// owns the underlying connection learns when it's safe to reuse it.
#[must_use = "streams do nothing unless polled"]
pub struct IncomingBody {
    inner: BoxStream,
    release: Option<ReleaseHook>,
    exhausted: bool,
}

impl IncomingBody {
    pub fn new(
        stream: impl Stream<Item = Result<Bytes>> + Send + 'static,
        release: impl FnOnce(ReleaseReason) + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(stream),
            release: Some(Box::new(release)),
            exhausted: false,
        }
    }

    /// A body with no release hook, for responses that own no pooled
    /// resource (e.g. already fully buffered in memory).
    pub fn without_release(stream: impl Stream<Item = Result<Bytes>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            release: None,
            exhausted: false,
        }
    }

    fn fire_release(&mut self, reason: ReleaseReason) {
        if let Some(hook) = self.release.take() {
            hook(reason);
        }
    }
}

impl Stream for IncomingBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.exhausted {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.exhausted = true;
                this.fire_release(ReleaseReason::Exhausted);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for IncomingBody {
    fn drop(&mut self) {
        if !self.exhausted {
            self.fire_release(ReleaseReason::Dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn client_body_from_bytes_yields_exactly_one_chunk() {
        let mut body = ClientBody::from_bytes(Bytes::from_static(b"hello"));
        assert_eq!(body.len(), Some(5));
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_client_body_yields_nothing() {
        let mut body = ClientBody::empty();
        assert!(body.is_empty());
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn release_hook_fires_once_on_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls2 = Arc::clone(&calls);
        let reasons2 = Arc::clone(&reasons);

        let inner = stream::iter(vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))]);
        let mut body = IncomingBody::new(inner, move |reason| {
            calls2.fetch_add(1, Ordering::SeqCst);
            reasons2.lock().unwrap().push(reason);
        });

        while body.next().await.is_some() {}
        // polling again after exhaustion must not re-fire the hook
        assert!(body.next().await.is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reasons.lock().unwrap().as_slice(), [ReleaseReason::Exhausted]);
    }

    #[tokio::test]
    async fn release_hook_fires_on_drop_when_not_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls2 = Arc::clone(&calls);
        let reasons2 = Arc::clone(&reasons);

        let inner = stream::iter(vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))]);
        let body = IncomingBody::new(inner, move |reason| {
            calls2.fetch_add(1, Ordering::SeqCst);
            reasons2.lock().unwrap().push(reason);
        });

        drop(body); // never polled at all

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reasons.lock().unwrap().as_slice(), [ReleaseReason::Dropped]);
    }

    #[tokio::test]
    async fn without_release_never_invokes_a_hook() {
        let inner = stream::iter(vec![Ok(Bytes::from_static(b"a"))]);
        let mut body = IncomingBody::without_release(inner);
        assert!(body.next().await.is_some());
        assert!(body.next().await.is_none());
        drop(body);
    }
}
