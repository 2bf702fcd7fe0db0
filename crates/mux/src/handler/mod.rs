//! Application callbacks.
//!
//! A [`ProtocolHandler`] is registered on a virtual host under a name. HTTP requests reach it
//! through `callback://name` mounts, WebSocket connections through the subprotocol they
//! negotiate, and raw connections through the virtual host's raw protocol. Every callback gets
//! a [`ConnInfo`] describing the connection it runs for.

use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};

use crate::connection::ConnId;
use crate::protocol::{RequestHeader, WsMessage, status_response};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Identity of the connection a callback runs for.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: ConnId,
    /// Index of the owning service thread.
    pub thread: usize,
    pub peer: SocketAddr,
    /// Name of the bound virtual host.
    pub vhost: Arc<str>,
    /// Listening port the connection arrived on.
    pub port: u16,
}

#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Registration name, matched against WebSocket subprotocols and `callback://` mounts.
    fn name(&self) -> &str;

    async fn on_http(&self, _conn: &ConnInfo, _request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        Ok(status_response(StatusCode::NOT_FOUND))
    }

    /// Veto point for a WebSocket upgrade; returning false answers `403`.
    fn accept_upgrade(&self, _conn: &ConnInfo, _request: &RequestHeader) -> bool {
        true
    }

    /// One complete data message; returned messages are sent back in order.
    async fn on_ws_message(&self, _conn: &ConnInfo, _message: WsMessage) -> Result<Vec<WsMessage>, BoxError> {
        Ok(Vec::new())
    }

    /// Bytes read on a raw connection; returned bytes are written back.
    async fn on_raw(&self, _conn: &ConnInfo, _data: Bytes) -> Result<Option<Bytes>, BoxError> {
        Ok(None)
    }

    /// Called once when a connection this handler served closes.
    fn on_close(&self, _conn: &ConnInfo) {}
}

/// Plain HTTP handler built from an async closure, see [`http_handler`].
pub struct HandlerFn<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, Err> ProtocolHandler for HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, Err>> + Send,
    Err: Into<BoxError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_http(&self, _conn: &ConnInfo, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        (self.f)(request).await.map_err(Into::into)
    }
}

/// Wraps an async function as a [`ProtocolHandler`] that only serves HTTP requests.
///
/// ```
/// use bytes::Bytes;
/// use http::{Request, Response};
/// use micro_mux::handler::{http_handler, BoxError};
///
/// let handler = http_handler("hello", |_request: Request<Bytes>| async {
///     Ok::<_, BoxError>(Response::new(Bytes::from_static(b"hello")))
/// });
/// ```
pub fn http_handler<F, Fut, Err>(name: &str, f: F) -> Arc<HandlerFn<F>>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, Err>> + Send,
    Err: Into<BoxError>,
{
    Arc::new(HandlerFn { name: name.to_string(), f })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnInfo {
        ConnInfo { id: ConnId::new(7), thread: 0, peer: "127.0.0.1:5000".parse().unwrap(), vhost: Arc::from("example"), port: 8080 }
    }

    #[tokio::test]
    async fn closure_handler_serves_http() {
        let handler = http_handler("echo", |request: Request<Bytes>| async move {
            Ok::<_, BoxError>(Response::new(request.into_body()))
        });

        let response = handler.on_http(&info(), Request::new(Bytes::from_static(b"ping"))).await.unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"ping"));
        assert_eq!(handler.name(), "echo");
    }

    #[tokio::test]
    async fn defaults_answer_not_found_and_ignore_messages() {
        struct Quiet;
        #[async_trait]
        impl ProtocolHandler for Quiet {
            fn name(&self) -> &str {
                "quiet"
            }
        }

        let response = Quiet.on_http(&info(), Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(Quiet.on_ws_message(&info(), WsMessage::text("hi")).await.unwrap().is_empty());
        assert_eq!(Quiet.on_raw(&info(), Bytes::from_static(b"x")).await.unwrap(), None);
    }
}
