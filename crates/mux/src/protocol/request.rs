//! HTTP request header handling implementation.
//!
//! This module wraps the standard `http::Request` type with the header inspection
//! the connection roles need: virtual host selection, keep-alive and upgrade detection.

use http::header::{CONNECTION, HOST, UPGRADE};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Body attachment capabilities
/// - Connection management inspection (keep-alive, upgrade)
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Determines if this request requires a body based on its HTTP method.
    ///
    /// Returns false for methods that typically don't have bodies:
    /// GET, HEAD, DELETE, OPTIONS and CONNECT.
    pub fn need_body(&self) -> bool {
        !matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT)
    }

    /// The host the client addressed, taken from the `Host` header or an absolute-form URI.
    pub fn host(&self) -> Option<&str> {
        self.headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri().authority().map(http::uri::Authority::as_str))
    }

    /// Returns true if the `Connection` header lists `token` (case-insensitive).
    pub fn connection_has(&self, token: &str) -> bool {
        has_token(self.headers(), &CONNECTION, token)
    }

    /// Whether the connection may carry another request after this one.
    ///
    /// HTTP/1.1 is persistent unless `Connection: close`; HTTP/1.0 only with `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version() {
            Version::HTTP_10 => self.connection_has("keep-alive"),
            _ => !self.connection_has("close"),
        }
    }

    /// The protocol requested through `Connection: upgrade` + `Upgrade: <protocol>`, lowercased.
    pub fn upgrade(&self) -> Option<String> {
        if !self.connection_has("upgrade") {
            return None;
        }

        self.headers()
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
    }
}

/// Returns true if a comma separated header lists `token`, ignoring case.
pub(crate) fn has_token(headers: &HeaderMap, name: &http::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: Version, headers: &[(&str, &str)]) -> RequestHeader {
        let mut builder = Request::builder().method(Method::GET).uri("/chat").version(version);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        RequestHeader::from(builder.body(()).unwrap())
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        assert!(header(Version::HTTP_11, &[]).is_keep_alive());
        assert!(!header(Version::HTTP_11, &[("Connection", "close")]).is_keep_alive());
        assert!(!header(Version::HTTP_10, &[]).is_keep_alive());
        assert!(header(Version::HTTP_10, &[("Connection", "Keep-Alive")]).is_keep_alive());
    }

    #[test]
    fn upgrade_needs_connection_token() {
        let plain = header(Version::HTTP_11, &[("Upgrade", "websocket")]);
        assert_eq!(plain.upgrade(), None);

        let upgrade = header(Version::HTTP_11, &[("Connection", "keep-alive, Upgrade"), ("Upgrade", "WebSocket")]);
        assert_eq!(upgrade.upgrade().as_deref(), Some("websocket"));
    }

    #[test]
    fn host_prefers_header() {
        let with_host = header(Version::HTTP_11, &[("Host", "example.com:8080")]);
        assert_eq!(with_host.host(), Some("example.com:8080"));

        let absolute =
            RequestHeader::from(Request::builder().uri("http://admin.local/x").body(()).unwrap());
        assert_eq!(absolute.host(), Some("admin.local"));
    }
}
