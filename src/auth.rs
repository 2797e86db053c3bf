//! Stateless request mutators that stamp credentials onto an outgoing request.

use base64::Engine as _;
use http::{HeaderValue, Request};

/// A pure function from request to request that rewrites headers.
///
/// Implementations must be idempotent: applying the same mutator twice to the
/// same request produces the same `Authorization` header both times.
pub trait AuthMutator {
    /// Rewrite `req`'s headers in place, typically setting `Authorization`.
    fn apply<B>(&self, req: &mut Request<B>);
}

/// Either a UTF-8 string or raw bytes, used for Basic-auth credentials.
///
/// Text is encoded to Latin-1 before it is joined and Base64-encoded; bytes
/// are used verbatim. Latin-1 encoding of a `&str` is total only when every
/// `char` is in the `0..=0xFF` range (i.e. the first 256 Unicode scalars);
/// [`Credential::from`] panics otherwise, matching the "ASCII token" framing
/// the wider spec assumes for header material.
#[derive(Debug, Clone)]
pub enum Credential {
    Text(String),
    Bytes(Vec<u8>),
}

impl Credential {
    fn into_latin1_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s
                .chars()
                .map(|c| {
                    u8::try_from(c as u32)
                        .unwrap_or_else(|_| panic!("{c:?} is not representable in Latin-1"))
                })
                .collect(),
        }
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Credential {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Credential {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Credential {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

/// HTTP Basic authentication (RFC 7617): `Authorization: Basic <base64(user:pass)>`.
#[derive(Debug, Clone)]
pub struct Basic {
    token: String,
}

impl Basic {
    #[must_use]
    pub fn new(username: impl Into<Credential>, password: impl Into<Credential>) -> Self {
        let mut userpass = username.into().into_latin1_bytes();
        userpass.push(b':');
        userpass.extend(password.into().into_latin1_bytes());
        let token = base64::engine::general_purpose::STANDARD.encode(userpass);
        Self { token }
    }

    /// The `Authorization` header value this mutator sets, e.g.
    /// `"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="`.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("Basic {}", self.token)
    }
}

impl AuthMutator for Basic {
    fn apply<B>(&self, req: &mut Request<B>) {
        let value = HeaderValue::from_str(&self.header_value())
            .expect("base64 + ascii prefix is always a valid header value");
        req.headers_mut().insert(http::header::AUTHORIZATION, value);
    }
}

/// Bearer token authentication (RFC 6750): `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct Bearer {
    token: String,
}

impl Bearer {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    #[must_use]
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl AuthMutator for Bearer {
    fn apply<B>(&self, req: &mut Request<B>) {
        let value = HeaderValue::from_str(&self.header_value())
            .expect("caller-supplied bearer token must be a valid header value");
        req.headers_mut().insert(http::header::AUTHORIZATION, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn basic_auth_matches_rfc_7617_example() {
        let basic = Basic::new("Aladdin", "open sesame");
        assert_eq!(basic.header_value(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn basic_auth_is_idempotent() {
        let basic = Basic::new("Aladdin", "open sesame");
        let mut req = Request::builder().uri("/").body(()).unwrap();
        basic.apply(&mut req);
        let first = req.headers().get(http::header::AUTHORIZATION).cloned();
        basic.apply(&mut req);
        let second = req.headers().get(http::header::AUTHORIZATION).cloned();
        assert_eq!(first, second);
        assert_eq!(first.unwrap(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn basic_auth_accepts_raw_bytes_without_reencoding() {
        let basic = Basic::new(b"user".as_slice(), b"pass".as_slice());
        assert_eq!(basic.header_value(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn bearer_sets_verbatim_token() {
        let bearer = Bearer::new("abc123");
        let mut req = Request::builder().uri("/").body(()).unwrap();
        bearer.apply(&mut req);
        assert_eq!(
            req.headers().get(http::header::AUTHORIZATION).unwrap(),
            "Bearer abc123"
        );
    }

    #[test]
    fn bearer_is_idempotent() {
        let bearer = Bearer::new("abc123");
        let mut req = Request::builder().uri("/").body(()).unwrap();
        bearer.apply(&mut req);
        bearer.apply(&mut req);
        assert_eq!(
            req.headers()
                .get_all(http::header::AUTHORIZATION)
                .iter()
                .count(),
            1
        );
    }
}
