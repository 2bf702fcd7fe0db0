//! HTTP response header handling implementation.
//!
//! The header portion of a response is the standard `http::Response` with an empty
//! body placeholder; bodies travel separately as `Bytes`.

use bytes::Bytes;
use http::{Response, StatusCode};

/// Type alias for HTTP response headers.
pub type ResponseHead = Response<()>;

/// Builds a bodyless response carrying only `status`.
pub fn status_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}
