//! The HTTP/2 per-connection state machine.
//!
//! Framing and HPACK are delegated to the `h2` crate's `h2::client`
//! machinery; this module's job is the thin bookkeeping layer on top: one
//! entry per open stream, removed when its response body closes, plus a
//! GOAWAY-aware `is_closed` flag. The window/frame-size defaults below match
//! `rama-http-core`'s own H2 client config (`client/conn/http2.rs`).

use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use h2::{Reason, RecvStream, SendStream, StreamId};
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::{ClientBody, IncomingBody};
use crate::error::{Error, Result};
use crate::timeouts::Timeouts;

/// Callback the owning pool supplies at construction time; invoked with
/// `true` whenever the open-stream bookkeeping map becomes empty (i.e. the
/// connection currently has no in-flight exchange).
pub type OnRelease = Arc<dyn Fn(bool) + Send + Sync>;

const DEFAULT_CONN_WINDOW: u32 = 5 * 1024 * 1024;
const DEFAULT_STREAM_WINDOW: u32 = 2 * 1024 * 1024;
const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024;
const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 16 * 1024;

/// A single HTTP/2 connection, cheaply `Clone`-able (it's an `Arc`-backed
/// handle around `h2::client::SendRequest`, which is itself designed to be
/// cloned and driven concurrently from many callers).
pub struct Http2Connection {
    send_request: h2::client::SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    open_streams: Arc<StdMutex<HashSet<StreamId>>>,
    on_release: Option<OnRelease>,
    timeouts: Timeouts,
}

impl Clone for Http2Connection {
    fn clone(&self) -> Self {
        Self {
            send_request: self.send_request.clone(),
            closed: Arc::clone(&self.closed),
            open_streams: Arc::clone(&self.open_streams),
            on_release: self.on_release.clone(),
            timeouts: self.timeouts,
        }
    }
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("is_closed", &self.is_closed())
            .field("open_stream_count", &self.open_stream_count())
            .finish()
    }
}

impl Http2Connection {
    /// Drives the connection preface and initial SETTINGS, and spawns the
    /// background task that pumps `h2::client::Connection` for the lifetime
    /// of the connection.
    ///
    /// The `h2` crate performs the preface as part of establishing the
    /// connection object rather than deferring it to the first request, so
    /// this runs once, right after ALPN negotiates `h2`.
    pub async fn handshake<S>(io: S, timeouts: Timeouts, on_release: Option<OnRelease>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_request, connection) = h2::client::Builder::new()
            .initial_window_size(DEFAULT_STREAM_WINDOW)
            .initial_connection_window_size(DEFAULT_CONN_WINDOW)
            .max_frame_size(DEFAULT_MAX_FRAME_SIZE)
            .max_header_list_size(DEFAULT_MAX_HEADER_LIST_SIZE)
            .handshake::<S, Bytes>(io)
            .await?;

        let closed = Arc::new(AtomicBool::new(false));
        let closed_task = Arc::clone(&closed);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "http/2 connection driver task exited with an error");
            }
            closed_task.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            send_request,
            closed,
            open_streams: Arc::new(StdMutex::new(HashSet::new())),
            on_release,
            timeouts,
        })
    }

    /// True once the peer has sent GOAWAY or the connection driver task has
    /// exited, whichever happens first.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of streams currently registered in the bookkeeping map —
    /// equal, at steady state, to the number of responses not yet fully
    /// read or dropped.
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.lock().unwrap().len()
    }

    /// Mark the connection closed. Idempotent; does not forcibly tear down
    /// streams already in flight, but `is_closed` reports `true` from this
    /// point on so the pool stops handing out new `send` calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn send(&self, req: Request<ClientBody>) -> Result<Response<IncomingBody>> {
        if self.is_closed() {
            tracing::debug!("send called on a closed http/2 connection");
            return Err(Error::remote_protocol("http/2 connection is closed"));
        }
        ensure_absolute_uri(&req)?;

        let mut send_request = self.send_request.clone();
        send_request.ready().await?;

        let (parts, mut body) = req.into_parts();
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let head_req = Request::from_parts(parts, ());
        let end_of_stream = body.is_empty();

        let (response_fut, mut send_stream) = send_request.send_request(head_req, end_of_stream)?;
        let stream_id = send_stream.stream_id();
        tracing::trace!(?stream_id, %method, %uri, "http/2 request headers sent");

        // Registered for the lifetime of this send; dropped (cancellation,
        // any early return) unregisters the stream unless `disarm`ed, so a
        // cancelled send can never leak an entry out of `open_streams`.
        let guard = StreamGuard::new(self, stream_id);

        if !end_of_stream {
            stream_body(&mut send_stream, &mut body).await.inspect_err(|e| {
                tracing::debug!(?stream_id, error = %e, "aborting http/2 request body after a send error");
                let _ = send_stream.send_reset(Reason::INTERNAL_ERROR);
            })?;
        }

        let response = self.await_response(response_fut).await?;

        let (parts, recv_stream) = response.into_parts();
        tracing::trace!(?stream_id, status = %parts.status, "http/2 response headers received");
        let body = self.wrap_incoming(stream_id, recv_stream);
        guard.disarm();
        Ok(Response::from_parts(parts, body))
    }

    async fn await_response(&self, fut: h2::client::ResponseFuture) -> Result<Response<RecvStream>> {
        let outcome = match self.timeouts.read() {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::read_timeout())?,
            None => fut.await,
        };
        outcome.map_err(|e| {
            if e.is_reset() {
                tracing::debug!(error = %e, "stream reset before http/2 response headers arrived");
                Error::protocol(e)
            } else {
                tracing::warn!(error = %e, "http/2 response future failed");
                Error::from(e)
            }
        })
    }

    fn wrap_incoming(&self, stream_id: StreamId, recv_stream: RecvStream) -> IncomingBody {
        let open_streams = Arc::clone(&self.open_streams);
        let on_release = self.on_release.clone();
        IncomingBody::new(RecvStreamAdapter { inner: recv_stream }, move |_reason| {
            let became_empty = {
                let mut set = open_streams.lock().unwrap();
                set.remove(&stream_id);
                set.is_empty()
            };
            if became_empty {
                if let Some(cb) = &on_release {
                    cb(true);
                }
            }
        })
    }

    fn register_stream(&self, id: StreamId) {
        self.open_streams.lock().unwrap().insert(id);
    }

    fn unregister_stream(&self, id: StreamId) {
        let became_empty = {
            let mut set = self.open_streams.lock().unwrap();
            set.remove(&id);
            set.is_empty()
        };
        tracing::trace!(stream_id = ?id, became_empty, "http/2 stream unregistered");
        if became_empty {
            if let Some(cb) = &self.on_release {
                cb(true);
            }
        }
    }
}

/// Keeps `open_streams` in sync with a `send` call's lifetime: registers on
/// construction, unregisters on drop unless `disarm`ed. A `send` future
/// dropped mid-flight (the caller's own timeout, an abandoned request) still
/// runs the `Drop` impl, so a stream id can never outlive the call that
/// opened it.
struct StreamGuard<'a> {
    conn: &'a Http2Connection,
    id: StreamId,
    disarmed: bool,
}

impl<'a> StreamGuard<'a> {
    fn new(conn: &'a Http2Connection, id: StreamId) -> Self {
        conn.register_stream(id);
        Self { conn, id, disarmed: false }
    }

    fn disarm(mut self) {
        self.disarmed = true;
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            tracing::debug!(stream_id = ?self.id, "http/2 send cancelled or failed; unregistering stream");
            self.conn.unregister_stream(self.id);
        }
    }
}

fn ensure_absolute_uri<B>(req: &Request<B>) -> Result<()> {
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return Err(Error::protocol(format!(
            "http/2 requires an absolute request URI with scheme and authority, got {}",
            req.uri()
        )));
    }
    Ok(())
}

/// Streams an outgoing body as DATA frames, chunked to the peer's current
/// flow-control window via `h2`'s own `reserve_capacity`/`poll_capacity`:
/// each write is capped at `min(remaining, window)` and pauses entirely
/// once the window hits zero, with `h2` tracking the window for us instead
/// of us re-deriving it from WINDOW_UPDATE frames by hand.
async fn stream_body(send_stream: &mut SendStream<Bytes>, body: &mut ClientBody) -> Result<()> {
    use futures_util::StreamExt;

    loop {
        let Some(chunk) = body.next().await.transpose()? else {
            send_stream.send_data(Bytes::new(), true)?;
            return Ok(());
        };
        let mut chunk = chunk;
        while !chunk.is_empty() {
            send_stream.reserve_capacity(chunk.len());
            let capacity = futures_util::future::poll_fn(|cx| send_stream.poll_capacity(cx)).await;
            let available = match capacity {
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "http/2 flow-control wait failed while sending request body");
                    return Err(e.into());
                }
                None => {
                    tracing::debug!("peer reset the stream before the request body finished sending");
                    return Err(Error::remote_protocol(
                        "peer reset the stream before the request body finished sending",
                    ));
                }
            };
            if available == 0 {
                continue;
            }
            let send_len = available.min(chunk.len());
            let to_send = chunk.split_to(send_len);
            send_stream.send_data(to_send, false)?;
        }
    }
}

/// Adapts `h2::RecvStream` to this crate's `Stream<Item = Result<Bytes>>`
/// body contract, releasing flow-control capacity for each chunk handed to
/// the caller (window size == bytes released, per the data model).
struct RecvStreamAdapter {
    inner: RecvStream,
}

impl Stream for RecvStreamAdapter {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let _ = self.inner.flow_control().release_capacity(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) if e.is_reset() => {
                tracing::debug!(error = %e, "stream reset after response headers; ending body cleanly");
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "http/2 response body stream failed");
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_absolute_uri_rejects_origin_form() {
        let req = Request::builder().uri("/a").body(()).unwrap();
        assert!(ensure_absolute_uri(&req).is_err());
    }

    #[test]
    fn ensure_absolute_uri_accepts_scheme_and_authority() {
        let req = Request::builder().uri("https://example.com/a").body(()).unwrap();
        assert!(ensure_absolute_uri(&req).is_ok());
    }
}
