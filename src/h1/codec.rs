//! Wire-level framing helpers for HTTP/1.1: request-head encoding, response-head
//! parsing, and the keep-alive / body-presence rules a codec needs to get right.
//!
//! Host-insertion and absolute/origin-form handling mirror `patron::client`
//! (`get_non_default_port`, `is_schema_secure`); chunked framing and the
//! HEAD/204/304/1xx no-body rule mirror `riphttplib::h1::protocol`
//! (`build_chunked_body`, `read_chunked_body`, `response_has_body`) and
//! `rama-http-core`'s `proto::h1::role` (`can_have_body`,
//! keep-alive-by-`Connection`-header).

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::body::ClientBody;
use crate::error::{Error, Result};

/// How an outgoing request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
}

/// Decide the wire framing for an outgoing body purely from whether its
/// length is known up front — the same rule the h11-equivalent codec in
/// `original_source/http3/dispatch/http11.py` applies before emitting a
/// `Request` event.
pub(super) fn plan_request_body(body: &ClientBody) -> BodyMode {
    match body.len() {
        Some(0) => BodyMode::None,
        Some(n) => BodyMode::ContentLength(n),
        None => BodyMode::Chunked,
    }
}

/// Render the request line and headers (not including the blank line that
/// separates head from body — callers append that once body framing is
/// decided).
pub(super) fn encode_head<B>(req: &http::Request<B>, mode: BodyMode) -> Result<Vec<u8>> {
    let target = req
        .uri()
        .path_and_query()
        .map(http::uri::PathAndQuery::as_str)
        .unwrap_or("/");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains_key(http::header::HOST) {
        let authority = req.uri().authority().ok_or_else(|| {
            Error::protocol(format!("request URI {} has no authority to derive Host from", req.uri()))
        })?;
        head.extend_from_slice(b"host: ");
        head.extend_from_slice(authority.as_str().as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    // `http::HeaderName` always normalises to lowercase, so "preserve caller
    // casing" (per the data model) holds only for header *values*; this is a
    // deliberate consequence of reusing `http`'s types rather than a
    // hand-rolled case-preserving map.
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    match mode {
        BodyMode::None => {}
        BodyMode::ContentLength(n) => {
            head.extend_from_slice(format!("content-length: {n}\r\n").as_bytes());
        }
        BodyMode::Chunked => {
            head.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    }
    head.extend_from_slice(b"\r\n");
    Ok(head)
}

/// Frame a single outgoing body chunk as one chunked-encoding segment.
pub(super) fn encode_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
    out.extend_from_slice(chunk);
    out.extend_from_slice(b"\r\n");
    out
}

/// The terminating zero-length chunk plus the (trailer-less) final CRLF.
pub(super) const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// An owned, parsed response head.
#[derive(Debug)]
pub(super) struct ParsedHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Attempts to parse a complete status line + header block from `buf`.
///
/// Returns `Ok(None)` on a partial parse (caller should read more and retry),
/// `Ok(Some((head, consumed)))` on success, where `consumed` is the number of
/// leading bytes of `buf` the head occupied (any remainder is body data that
/// arrived in the same read).
pub(super) fn parse_head(buf: &[u8]) -> Result<Option<(ParsedHead, usize)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(consumed)) => {
            let status = StatusCode::from_u16(parsed.code.unwrap_or(0)).map_err(Error::protocol)?;
            let version = match parsed.version {
                Some(1) => Version::HTTP_11,
                Some(0) => Version::HTTP_10,
                _ => return Err(Error::protocol("unsupported HTTP/1.x minor version")),
            };
            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for raw in parsed.headers.iter() {
                let name = HeaderName::from_bytes(raw.name.as_bytes()).map_err(Error::protocol)?;
                let value = HeaderValue::from_bytes(raw.value).map_err(Error::protocol)?;
                headers.append(name, value);
            }
            Ok(Some((ParsedHead { status, version, headers }, consumed)))
        }
        Err(e) => Err(Error::protocol(e)),
    }
}

/// Whether a response to `method` with `status` can carry a body at all,
/// independent of any `Content-Length`/`Transfer-Encoding` present.
pub(super) fn response_has_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational())
}

/// How the response body (once known to exist at all) is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ResponseBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

pub(super) fn plan_response_body(method: &Method, status: StatusCode, headers: &HeaderMap) -> ResponseBodyMode {
    if !response_has_body(method, status) {
        return ResponseBodyMode::None;
    }
    let chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "chunked"));
    if chunked {
        return ResponseBodyMode::Chunked;
    }
    if let Some(len) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return ResponseBodyMode::ContentLength(len);
    }
    ResponseBodyMode::UntilClose
}

/// True if the connection must close after this exchange, per the
/// `Connection` header and the HTTP-version default (1.1 defaults to
/// keep-alive, 1.0 defaults to close).
pub(super) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut has_close = false;
    let mut has_keep_alive = false;
    for value in headers.get_all(http::header::CONNECTION).iter().filter_map(|v| v.to_str().ok()) {
        for token in value.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "close" => has_close = true,
                "keep-alive" => has_keep_alive = true,
                _ => {}
            }
        }
    }
    if has_close {
        return true;
    }
    version == Version::HTTP_10 && !has_keep_alive
}

/// Whether `status` is a `1xx` informational response that must be followed
/// by a real final response before the exchange is complete.
pub(super) fn is_informational(status: StatusCode) -> bool {
    status.is_informational()
}

pub(super) type Chunk = std::result::Result<Bytes, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as B;

    #[test]
    fn plan_request_body_matches_known_vs_unknown_length() {
        assert_eq!(plan_request_body(&ClientBody::empty()), BodyMode::None);
        assert_eq!(
            plan_request_body(&ClientBody::from_bytes(B::from_static(b"hi"))),
            BodyMode::ContentLength(2)
        );
    }

    #[test]
    fn encode_head_inserts_host_when_absent() {
        let req = http::Request::builder()
            .method("GET")
            .uri("http://example.com/a?b=1")
            .body(())
            .unwrap();
        let head = encode_head(&req, BodyMode::None).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_head_preserves_caller_supplied_host() {
        let req = http::Request::builder()
            .method("GET")
            .uri("http://example.com/")
            .header("host", "other.example")
            .body(())
            .unwrap();
        let head = encode_head(&req, BodyMode::None).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert_eq!(text.matches("host:").count(), 1);
        assert!(text.contains("host: other.example\r\n"));
    }

    #[test]
    fn parse_head_reads_status_line_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (head, consumed) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("content-length").unwrap(), "5");
        assert_eq!(&raw[consumed..], b"hello");
    }

    #[test]
    fn parse_head_reports_partial_on_incomplete_input() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(parse_head(raw).unwrap().is_none());
    }

    #[test]
    fn head_and_no_content_and_not_modified_never_have_a_body() {
        assert!(!response_has_body(&Method::HEAD, StatusCode::OK));
        assert!(!response_has_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!response_has_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!response_has_body(&Method::GET, StatusCode::CONTINUE));
        assert!(response_has_body(&Method::GET, StatusCode::OK));
    }

    #[test]
    fn wants_close_honors_connection_header_over_version_default() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        assert!(wants_close(Version::HTTP_11, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!wants_close(Version::HTTP_10, &headers));

        assert!(!wants_close(Version::HTTP_11, &HeaderMap::new()));
        assert!(wants_close(Version::HTTP_10, &HeaderMap::new()));
    }

    #[test]
    fn plan_response_body_prefers_chunked_over_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert_eq!(
            plan_response_body(&Method::GET, StatusCode::OK, &headers),
            ResponseBodyMode::Chunked
        );
    }

    #[test]
    fn plan_response_body_falls_back_to_until_close() {
        assert_eq!(
            plan_response_body(&Method::GET, StatusCode::OK, &HeaderMap::new()),
            ResponseBodyMode::UntilClose
        );
    }
}
