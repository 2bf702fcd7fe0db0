//! A protocol handler serving the status document.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use micro_mux::handler::BoxError;
use micro_mux::protocol::{WsMessage, status_response};
use micro_mux::{ConnInfo, ContextHandle, ProtocolHandler};
use tracing::debug;

use crate::render::{RenderOptions, render_string};

/// Answers HTTP `GET`s and every WebSocket message with the current status report.
#[derive(Debug)]
pub struct StatusProtocol {
    handle: ContextHandle,
    options: RenderOptions,
}

impl StatusProtocol {
    pub const NAME: &'static str = "lws-server-status";

    /// `handle` usually comes from [`ContextBuilder::handle`](micro_mux::ContextBuilder::handle).
    pub fn new(handle: ContextHandle, options: RenderOptions) -> Arc<Self> {
        Arc::new(Self { handle, options })
    }

    fn report(&self) -> Option<String> {
        self.handle.snapshot().map(|snapshot| render_string(&snapshot, self.options))
    }
}

#[async_trait]
impl ProtocolHandler for StatusProtocol {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn on_http(&self, conn: &ConnInfo, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
        }
        let Some(report) = self.report() else {
            debug!(conn = %conn.id, "status requested without a running context");
            return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
        };
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
            .header(header::CACHE_CONTROL, "no-store")
            .body(Bytes::from(report))?;
        Ok(response)
    }

    async fn on_ws_message(&self, _conn: &ConnInfo, _message: WsMessage) -> Result<Vec<WsMessage>, BoxError> {
        let report = self.report().ok_or("context is gone")?;
        Ok(vec![WsMessage::Text(report)])
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use micro_mux::connection::ConnId;
    use micro_mux::{Context, ContextConfig, Mount, VhostBuilder};
    use serde_json::Value;

    use super::*;

    fn info() -> ConnInfo {
        ConnInfo { id: ConnId::new(1), thread: 0, peer: "127.0.0.1:5000".parse().unwrap(), vhost: Arc::from("localhost"), port: 0 }
    }

    fn get() -> Request<Bytes> {
        Request::builder().uri("/status").body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn answers_unavailable_before_build() {
        let protocol = StatusProtocol::new(ContextHandle::default(), RenderOptions::default());
        let response = protocol.on_http(&info(), get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(protocol.on_ws_message(&info(), WsMessage::Text("refresh".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn reports_the_running_context() {
        let config = ContextConfig { bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST), ..ContextConfig::default() };
        let builder = Context::builder(config);
        let protocol = StatusProtocol::new(builder.handle(), RenderOptions::default());
        let context = builder
            .vhost(
                VhostBuilder::new("localhost", 0)
                    .protocol(protocol.clone())
                    .mount(Mount::parse("/status", "callback://lws-server-status").unwrap()),
            )
            .build()
            .unwrap();

        let response = protocol.on_http(&info(), get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let report: Value = serde_json::from_slice(response.body()).unwrap();
        let vhost = &report["contexts"][0]["vhosts"][0];
        assert_eq!(vhost["name"], "localhost");
        assert_eq!(vhost["mounts"][0]["origin"], "callback://lws-server-status");
        assert_eq!(vhost["ws-protocols"][0]["lws-server-status"]["status"], "ok");

        let replies = protocol.on_ws_message(&info(), WsMessage::Text("refresh".to_string())).await.unwrap();
        assert!(matches!(&replies[..], [WsMessage::Text(text)] if text.contains("\"listen_wsi\":\"1\"")));

        context.destroy().unwrap();
    }
}
