//! The HTTP/1.1 per-connection state machine: one request in flight at a
//! time, framed over anything that looks like a socket.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use http::{Method, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use super::codec::{self, BodyMode, ResponseBodyMode};
use crate::body::{ClientBody, IncomingBody, ReleaseReason};
use crate::error::{Error, Result};
use crate::timeouts::Timeouts;

/// Callback the owning pool supplies at construction time; invoked exactly
/// once per exchange with `true` if the connection is still reusable.
pub type OnRelease = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SendBody,
    ReceiveHeaders,
    ReceiveBody,
    Done,
    Closed,
    Error,
}

struct StateInner {
    our: Phase,
    their: Phase,
}

/// Drives the connection to `Error` on both sides unless `disarm`ed first.
///
/// `send` arms one of these before touching the wire; if the `send` future
/// is dropped at any suspension point (the caller's own timeout races it,
/// the body stream is cancelled, ...) this still runs and leaves `is_closed`
/// reporting `true`, instead of stranding the state machine in `SendBody`/
/// `ReceiveHeaders` forever.
struct ExchangeGuard {
    state: Arc<StdMutex<StateInner>>,
    disarmed: bool,
}

impl ExchangeGuard {
    fn new(state: Arc<StdMutex<StateInner>>) -> Self {
        Self { state, disarmed: false }
    }

    fn disarm(mut self) {
        self.disarmed = true;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            let mut st = self.state.lock().unwrap();
            st.our = Phase::Error;
            st.their = Phase::Error;
            tracing::debug!("http/1 send cancelled before completion; connection marked closed");
        }
    }
}

/// A single HTTP/1.1 connection over a byte stream `S`.
///
/// `send` takes `&mut self`, so the borrow checker — not a runtime flag —
/// is what prevents two concurrent exchanges on one connection; the pool is
/// expected to serialise callers itself.
pub struct Http1Connection<S> {
    io: Arc<Mutex<S>>,
    state: Arc<StdMutex<StateInner>>,
    timeouts: Timeouts,
    on_release: Option<OnRelease>,
}

impl<S> fmt::Debug for Http1Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Connection")
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl<S> Http1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S, timeouts: Timeouts, on_release: Option<OnRelease>) -> Self {
        Self {
            io: Arc::new(Mutex::new(io)),
            state: Arc::new(StdMutex::new(StateInner {
                our: Phase::Idle,
                their: Phase::Idle,
            })),
            timeouts,
            on_release,
        }
    }

    /// True iff our side of the codec has reached CLOSED or ERROR.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let st = self.state.lock().unwrap();
        matches!(st.our, Phase::Closed | Phase::Error)
    }

    /// Explicitly close the connection. Idempotent; a pending `send` already
    /// in flight is unaffected (its own I/O errors will drive the state to
    /// `Error` on their own).
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.our = Phase::Closed;
        st.their = Phase::Closed;
    }

    /// Send one request and return its response. The previous response (if
    /// any) must already have been consumed or dropped — see the module docs
    /// on connection reuse.
    pub async fn send(&mut self, req: Request<ClientBody>) -> Result<Response<IncomingBody>> {
        {
            let mut st = self.state.lock().unwrap();
            if st.our != Phase::Idle || st.their != Phase::Idle {
                return Err(Error::protocol(
                    "previous exchange on this HTTP/1.1 connection has not finished",
                ));
            }
            st.our = Phase::SendBody;
            st.their = Phase::ReceiveHeaders;
        }
        let guard = ExchangeGuard::new(Arc::clone(&self.state));

        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::trace!(%method, %uri, "sending http/1 request");
        let (parts, mut body) = req.into_parts();
        let head_req = Request::from_parts(parts, ());
        let mode = codec::plan_request_body(&body);
        let head_bytes = codec::encode_head(&head_req, mode).map_err(|e| {
            tracing::warn!(error = %e, "failed to encode http/1 request head");
            e
        })?;

        self.write_request(head_bytes, &mut body, mode).await.map_err(|e| {
            tracing::debug!(error = %e, "http/1 request write failed");
            e
        })?;
        self.set_our(Phase::Done);

        let resp = self.read_response(&method).await.map_err(|e| {
            tracing::debug!(error = %e, "http/1 response read failed");
            e
        })?;

        tracing::trace!(status = %resp.status(), "http/1 response headers received");
        guard.disarm();
        Ok(resp)
    }

    async fn write_request(&self, head: Vec<u8>, body: &mut ClientBody, mode: BodyMode) -> Result<()> {
        self.write_all(&head).await?;
        if mode == BodyMode::None {
            return Ok(());
        }
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            match mode {
                BodyMode::Chunked => self.write_all(&codec::encode_chunk(&chunk)).await?,
                _ => self.write_all(&chunk).await?,
            }
        }
        if mode == BodyMode::Chunked {
            self.write_all(codec::CHUNKED_TERMINATOR).await?;
        }
        Ok(())
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut io = self.io.lock().await;
        let fut = io.write_all(bytes);
        match self.timeouts.write() {
            Some(d) => {
                tokio::time::timeout(d, fut)
                    .await
                    .map_err(|_| {
                        tracing::debug!("http/1 write timed out");
                        Error::write_timeout()
                    })??
            }
            None => fut.await?,
        }
        Ok(())
    }

    async fn read_response(&self, method: &Method) -> Result<Response<IncomingBody>> {
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        // Loop over any number of leading 1xx responses (e.g. chained Early
        // Hints) rather than assuming at most one before the final response.
        let (head, leftover) = loop {
            let (head, consumed) = self.read_head_once(&mut buf).await?;
            if codec::is_informational(head.status) {
                tracing::trace!(status = %head.status, "skipping informational http/1 response");
                buf.drain(..consumed);
                continue;
            }
            let leftover = buf.split_off(consumed);
            break (head, leftover);
        };

        let body_mode = codec::plan_response_body(method, head.status, &head.headers);
        let close_after =
            codec::wants_close(head.version, &head.headers) || body_mode == ResponseBodyMode::UntilClose;

        let body = self.start_body(leftover, body_mode, close_after);

        let mut builder = Response::builder().status(head.status).version(head.version);
        *builder.headers_mut().expect("builder has no error yet") = head.headers;
        Ok(builder
            .body(body)
            .expect("status, version and headers were already validated while parsing"))
    }

    async fn read_head_once(&self, buf: &mut Vec<u8>) -> Result<(codec::ParsedHead, usize)> {
        loop {
            if let Some(result) = codec::parse_head(buf)? {
                return Ok(result);
            }
            let n = self.read_more_into(buf).await?;
            if n == 0 {
                tracing::warn!("peer closed the connection before sending response headers");
                return Err(Error::remote_protocol(
                    "peer closed the connection before sending response headers",
                ));
            }
        }
    }

    async fn read_more_into(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut scratch = [0_u8; 4096];
        let mut io = self.io.lock().await;
        let fut = io.read(&mut scratch);
        let n = match self.timeouts.read() {
            Some(d) => {
                tokio::time::timeout(d, fut)
                    .await
                    .map_err(|_| {
                        tracing::debug!("http/1 read timed out while waiting for response headers");
                        Error::read_timeout()
                    })??
            }
            None => fut.await?,
        };
        buf.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    fn start_body(&self, leftover: Vec<u8>, mode: ResponseBodyMode, close_after: bool) -> IncomingBody {
        let state = Arc::clone(&self.state);
        let on_release = self.on_release.clone();

        if mode == ResponseBodyMode::None {
            return IncomingBody::new(stream::empty::<Result<Bytes>>(), move |reason| {
                release(&state, &on_release, reason, close_after);
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let saw_error = Arc::new(AtomicBool::new(false));
        let io = Arc::clone(&self.io);
        let read_timeout = self.timeouts.read();
        let saw_error_task = Arc::clone(&saw_error);

        tokio::spawn(run_body_reader(io, leftover, mode, read_timeout, tx, saw_error_task));

        IncomingBody::new(ChannelStream(rx), move |reason| {
            let errored = saw_error.load(Ordering::SeqCst);
            release(&state, &on_release, reason, close_after || errored);
        })
    }

    fn set_our(&self, phase: Phase) {
        self.state.lock().unwrap().our = phase;
    }
}

/// Applies the keep-alive decision once a response body's release hook
/// fires, and forwards the outcome to the pool-supplied callback.
fn release(state: &Arc<StdMutex<StateInner>>, on_release: &Option<OnRelease>, reason: ReleaseReason, force_close: bool) {
    let reusable = {
        let mut st = state.lock().unwrap();
        st.their = match reason {
            ReleaseReason::Exhausted => Phase::Done,
            ReleaseReason::Dropped => Phase::Error,
        };
        let reusable = !force_close && st.our == Phase::Done && st.their == Phase::Done;
        if reusable {
            st.our = Phase::Idle;
            st.their = Phase::Idle;
        } else {
            st.our = Phase::Closed;
            st.their = Phase::Closed;
        }
        reusable
    };
    tracing::trace!(reusable, "http/1 connection released after exchange");
    if let Some(cb) = on_release {
        cb(reusable);
    }
}

type Chunk = Result<Bytes>;

struct ChannelStream(mpsc::UnboundedReceiver<Chunk>);

impl Stream for ChannelStream {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.poll_recv(cx)
    }
}

async fn run_body_reader<S>(
    io: Arc<Mutex<S>>,
    mut buf: Vec<u8>,
    mode: ResponseBodyMode,
    read_timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<Chunk>,
    saw_error: Arc<AtomicBool>,
) where
    S: AsyncRead + Unpin + Send + 'static,
{
    let result = match mode {
        ResponseBodyMode::None => Ok(()),
        ResponseBodyMode::ContentLength(len) => run_content_length(&io, &mut buf, len, read_timeout, &tx).await,
        ResponseBodyMode::Chunked => run_chunked(&io, &mut buf, read_timeout, &tx).await,
        ResponseBodyMode::UntilClose => run_until_close(&io, &mut buf, read_timeout, &tx).await,
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "http/1 response body read failed");
        saw_error.store(true, Ordering::SeqCst);
        let _ = tx.send(Err(e));
    }
}

async fn read_more<S: AsyncRead + Unpin>(
    io: &Mutex<S>,
    buf: &mut Vec<u8>,
    timeout: Option<Duration>,
) -> Result<usize> {
    let mut scratch = [0_u8; 4096];
    let mut guard = io.lock().await;
    let fut = guard.read(&mut scratch);
    let n = match timeout {
        Some(d) => {
            tokio::time::timeout(d, fut)
                .await
                .map_err(|_| {
                    tracing::debug!("http/1 read timed out while waiting for response body bytes");
                    Error::read_timeout()
                })??
        }
        None => fut.await?,
    };
    drop(guard);
    buf.extend_from_slice(&scratch[..n]);
    Ok(n)
}

async fn run_content_length<S: AsyncRead + Unpin>(
    io: &Mutex<S>,
    buf: &mut Vec<u8>,
    len: u64,
    timeout: Option<Duration>,
    tx: &mpsc::UnboundedSender<Chunk>,
) -> Result<()> {
    let mut remaining = len;
    loop {
        if !buf.is_empty() {
            let take = (buf.len() as u64).min(remaining) as usize;
            if take > 0 {
                let chunk = Bytes::copy_from_slice(&buf[..take]);
                buf.drain(..take);
                remaining -= take as u64;
                if tx.send(Ok(chunk)).is_err() {
                    return Ok(());
                }
            } else {
                buf.clear();
            }
        }
        if remaining == 0 {
            return Ok(());
        }
        let n = read_more(io, buf, timeout).await?;
        if n == 0 {
            tracing::warn!("peer closed the connection before Content-Length bytes were all received");
            return Err(Error::remote_protocol(
                "peer closed the connection before Content-Length bytes were all received",
            ));
        }
    }
}

async fn run_until_close<S: AsyncRead + Unpin>(
    io: &Mutex<S>,
    buf: &mut Vec<u8>,
    timeout: Option<Duration>,
    tx: &mpsc::UnboundedSender<Chunk>,
) -> Result<()> {
    loop {
        if !buf.is_empty() {
            let chunk = Bytes::copy_from_slice(buf);
            buf.clear();
            if tx.send(Ok(chunk)).is_err() {
                return Ok(());
            }
        }
        let n = read_more(io, buf, timeout).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn run_chunked<S: AsyncRead + Unpin>(
    io: &Mutex<S>,
    buf: &mut Vec<u8>,
    timeout: Option<Duration>,
    tx: &mpsc::UnboundedSender<Chunk>,
) -> Result<()> {
    loop {
        let size_line_end = loop {
            if let Some(pos) = find_crlf(buf) {
                break pos;
            }
            let n = read_more(io, buf, timeout).await?;
            if n == 0 {
                tracing::warn!("peer closed the connection mid chunk-size line");
                return Err(Error::remote_protocol("peer closed the connection mid chunk-size line"));
            }
        };
        let size_line = std::str::from_utf8(&buf[..size_line_end]).map_err(Error::protocol)?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(Error::protocol)?;
        buf.drain(..size_line_end + 2);

        if size == 0 {
            loop {
                if let Some(pos) = find_crlf(buf) {
                    if pos == 0 {
                        buf.drain(..2);
                        return Ok(());
                    }
                    buf.drain(..pos + 2);
                } else {
                    let n = read_more(io, buf, timeout).await?;
                    if n == 0 {
                        tracing::warn!("peer closed the connection mid chunked trailer");
                        return Err(Error::remote_protocol("peer closed the connection mid chunked trailer"));
                    }
                }
            }
        }

        while buf.len() < size + 2 {
            let n = read_more(io, buf, timeout).await?;
            if n == 0 {
                tracing::warn!("peer closed the connection mid chunk body");
                return Err(Error::remote_protocol("peer closed the connection mid chunk body"));
            }
        }
        let chunk = Bytes::copy_from_slice(&buf[..size]);
        buf.drain(..size + 2);
        if tx.send(Ok(chunk)).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn connect_pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        duplex(64 * 1024)
    }

    #[tokio::test]
    async fn get_with_content_length_round_trips_and_reuses_the_connection() {
        let (client_io, mut server_io) = connect_pair();
        let mut conn = Http1Connection::new(client_io, Timeouts::five_seconds(), None);

        let server = tokio::spawn(async move {
            let mut buf = [0_u8; 4096];
            let n = server_io.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
            server_io
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            server_io
        });

        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/a?b=1")
            .body(ClientBody::empty())
            .unwrap();
        let resp = conn.send(req).await.unwrap();
        assert_eq!(resp.status(), 200);

        let mut body = resp.into_body();
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");
        drop(body);

        // give the release hook's state transition a chance to land
        tokio::task::yield_now().await;
        assert!(!conn.is_closed());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn informational_responses_are_skipped_before_the_final_response() {
        let (client_io, mut server_io) = connect_pair();
        let mut conn = Http1Connection::new(client_io, Timeouts::five_seconds(), None);

        let server = tokio::spawn(async move {
            let mut buf = [0_u8; 4096];
            let _ = server_io.read(&mut buf).await.unwrap();
            server_io
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/")
            .body(ClientBody::empty())
            .unwrap();
        let resp = conn.send(req).await.unwrap();
        assert_eq!(resp.status(), 204);
        let mut body = resp.into_body();
        assert!(body.next().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_timeout_surfaces_and_closes_the_connection() {
        let (client_io, _server_io) = connect_pair();
        let mut conn = Http1Connection::new(client_io, Timeouts::all(Duration::from_millis(20)), None);

        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/")
            .body(ClientBody::empty())
            .unwrap();
        let err = conn.send(req).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn cancelling_send_mid_flight_marks_the_connection_closed() {
        let (client_io, mut server_io) = connect_pair();
        let mut conn = Http1Connection::new(client_io, Timeouts::five_seconds(), None);

        let server = tokio::spawn(async move {
            let mut buf = [0_u8; 4096];
            let _ = server_io.read(&mut buf).await.unwrap();
            // Never responds, so the client's `send` stays pending until cancelled.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/")
            .body(ClientBody::empty())
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(20), conn.send(req)).await;
        assert!(outcome.is_err(), "send should still be pending when the caller gives up");
        assert!(conn.is_closed());

        server.abort();
    }
}
