//! HTTP/1.x request handling.
//!
//! A request moves through three phases:
//! - `Header`: bytes are copied into a header pool slot and parsed there; the slot goes back to
//!   the pool as soon as the header is complete
//! - `Body`: the body is buffered up to `max_body_bytes`
//! - `Responding`: the request was dispatched and the connection waits for its response
//!
//! Upgrade requests leave this role: `websocket` for the WebSocket role, `h2c` for HTTP/2 with
//! the upgrade request as stream 1.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, UPGRADE};
use http::{HeaderValue, Method, Response, StatusCode, Version};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::codec::websocket::accept_key;
use crate::codec::{BodyDecoder, HeaderDecoder};
use crate::connection::{Completion, Core, Dispatch, RoleKind};
use crate::error::ConnError;
use crate::protocol::{ParseError, PayloadItem, PayloadSize, RequestHeader, status_response};
use crate::stats::Counter;

use super::{Http2, Role, RoleStep, WebSocket, unexpected};

const STS_VALUE: &str = "max-age=15768000 ; includeSubDomains";

pub(crate) struct Http1 {
    phase: Phase,
    counted: bool,
}

enum Phase {
    Header,
    Body { header: RequestHeader, decoder: BodyDecoder, body: BytesMut },
    Responding { keep_alive: bool, head: bool, version: Version },
}

impl Http1 {
    pub(crate) fn new() -> Self {
        Self { phase: Phase::Header, counted: false }
    }

    /// True while a request header is partially received.
    pub(crate) fn parsing_header(&self, core: &Core) -> bool {
        matches!(self.phase, Phase::Header) && (core.lease.is_some() || !core.read_buf.is_empty())
    }

    pub(crate) fn step(&mut self, core: &mut Core) -> Result<RoleStep, ConnError> {
        loop {
            let next = match self.phase {
                Phase::Header => self.receive_header(core)?,
                Phase::Body { .. } => self.receive_body(core)?,
                Phase::Responding { .. } => Some(RoleStep::Wait),
            };
            if let Some(step) = next {
                return Ok(step);
            }
        }
    }

    fn receive_header(&mut self, core: &mut Core) -> Result<Option<RoleStep>, ConnError> {
        if core.lease.is_none() {
            if core.read_buf.is_empty() {
                return Ok(Some(if core.eof { RoleStep::Close } else { RoleStep::Read }));
            }
            return Ok(Some(RoleStep::Lease));
        }

        let decoded = {
            let Some(lease) = core.lease.as_mut() else {
                return Ok(Some(RoleStep::Lease));
            };
            let room = lease.capacity().saturating_sub(lease.buf().len());
            let n = room.min(core.read_buf.len());
            lease.buf_mut().extend_from_slice(&core.read_buf.split_to(n));

            let decoded = HeaderDecoder::new(lease.capacity()).decode(lease.buf_mut());
            if let Ok(Some(_)) = decoded {
                // bytes behind the header go back in front of what is still unread
                let mut rest = lease.buf_mut().split();
                rest.unsplit(std::mem::take(&mut core.read_buf));
                core.read_buf = rest;
            }
            decoded
        };

        match decoded {
            Ok(Some((header, payload_size))) => {
                core.lease = None;
                self.on_header(core, header, payload_size)
            }
            Ok(None) if core.eof => {
                core.lease = None;
                Ok(Some(RoleStep::Close))
            }
            Ok(None) => Ok(Some(RoleStep::Read)),
            Err(e) => {
                core.lease = None;
                core.write_status(StatusCode::BAD_REQUEST);
                Err(e.into())
            }
        }
    }

    fn on_header(&mut self, core: &mut Core, header: RequestHeader, payload_size: PayloadSize) -> Result<Option<RoleStep>, ConnError> {
        trace!(conn = %core.id, method = %header.method(), uri = %header.uri(), "request header");

        if let Err(e) = core.bind_host(header.host()) {
            core.write_status(StatusCode::BAD_REQUEST);
            return Err(e);
        }
        if !self.counted {
            self.counted = true;
            core.count(Counter::H1Conn);
        }

        match header.upgrade().as_deref() {
            Some("websocket") => return self.upgrade_websocket(core, header),
            Some("h2c") => {
                if let Some(settings) = h2c_settings(&header, payload_size) {
                    return self.upgrade_h2c(core, header, &settings).map(Some);
                }
            }
            _ => {}
        }

        let max_body = core.limits.max_body_bytes;
        if let PayloadSize::Length(length) = payload_size {
            if length > max_body as u64 {
                core.write_status(StatusCode::PAYLOAD_TOO_LARGE);
                return Err(ParseError::too_large_body(usize::try_from(length).unwrap_or(usize::MAX), max_body).into());
            }
        }
        let expects_continue = header
            .headers()
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        if expects_continue && header.version() == Version::HTTP_11 && !payload_size.is_empty() {
            core.write_buf.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
        }

        self.phase = Phase::Body { header, decoder: BodyDecoder::new(payload_size, max_body), body: BytesMut::new() };
        Ok(None)
    }

    fn receive_body(&mut self, core: &mut Core) -> Result<Option<RoleStep>, ConnError> {
        let Phase::Body { decoder, body, .. } = &mut self.phase else {
            return Ok(None);
        };

        loop {
            match decoder.decode(&mut core.read_buf) {
                Ok(Some(PayloadItem::Chunk(bytes))) => body.extend_from_slice(&bytes),
                Ok(Some(PayloadItem::Eof)) => break,
                Ok(None) if core.eof => return Err(ConnError::PeerClosed),
                Ok(None) => return Ok(Some(RoleStep::Read)),
                Err(e) => {
                    let status = match e {
                        ParseError::TooLargeBody { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    core.write_status(status);
                    return Err(e.into());
                }
            }
        }

        let Phase::Body { header, body, .. } = std::mem::replace(&mut self.phase, Phase::Header) else {
            return Ok(None);
        };
        self.dispatch(core, header, body.freeze()).map(Some)
    }

    fn dispatch(&mut self, core: &mut Core, header: RequestHeader, body: Bytes) -> Result<RoleStep, ConnError> {
        let Some(info) = core.info().cloned() else {
            return Err(ConnError::protocol_violation("request without vhost"));
        };
        let route = core.route(header.uri().path(), header.uri().query());
        debug!(conn = %core.id, method = %header.method(), uri = %header.uri(), ?route, "dispatching request");

        self.phase = Phase::Responding {
            keep_alive: header.is_keep_alive(),
            head: header.method() == Method::HEAD,
            version: header.version(),
        };
        Ok(RoleStep::Dispatch(Dispatch::Http { stream: 0, request: header.body(body), route, info }))
    }

    fn upgrade_websocket(&mut self, core: &mut Core, header: RequestHeader) -> Result<Option<RoleStep>, ConnError> {
        let key = header.headers().get("sec-websocket-key").and_then(|value| value.to_str().ok()).map(str::to_string);
        let version_ok = header.headers().get("sec-websocket-version").is_some_and(|value| value.as_bytes() == b"13");
        let Some(key) = key.filter(|_| version_ok && header.method() == Method::GET) else {
            core.write_status(StatusCode::BAD_REQUEST);
            return Err(ConnError::protocol_violation("malformed websocket handshake"));
        };

        let requested: Vec<String> = header
            .headers()
            .get_all("sec-websocket-protocol")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        let (handler, info) = {
            let Some(vhost) = core.vhost() else {
                return Err(ConnError::protocol_violation("upgrade without vhost"));
            };
            let handler = if requested.is_empty() {
                vhost.protocols().first().cloned()
            } else {
                requested.iter().find_map(|name| vhost.protocol(name).cloned())
            };
            let Some(handler) = handler else {
                core.write_status(StatusCode::BAD_REQUEST);
                return Err(ConnError::upgrade_rejected("websocket"));
            };
            let Some(info) = core.info().cloned() else {
                return Err(ConnError::protocol_violation("upgrade without vhost"));
            };
            (handler, info)
        };

        if !handler.accept_upgrade(&info, &header) {
            debug!(conn = %core.id, protocol = handler.name(), cause = %ConnError::upgrade_rejected("websocket"), "upgrade vetoed");
            let mut response = status_response(StatusCode::FORBIDDEN);
            if !header.is_keep_alive() {
                response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
                core.shutdown();
            }
            core.write_response(response)?;
            core.count(Counter::H1Trans);
            self.phase = Phase::Header;
            return Ok(None);
        }

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header("sec-websocket-accept", accept_key(&key));
        if !requested.is_empty() {
            builder = builder.header("sec-websocket-protocol", handler.name());
        }
        let response = builder.body(Bytes::new()).map_err(|e| ConnError::protocol_violation(e.to_string()))?;
        core.write_response(response)?;
        core.count(Counter::WsUpg);

        debug!(conn = %core.id, protocol = handler.name(), "upgraded to websocket");
        let max_message = core.limits.max_ws_message_bytes;
        Ok(Some(RoleStep::Switch(Role::WebSocket(WebSocket::new(handler, max_message)))))
    }

    fn upgrade_h2c(&mut self, core: &mut Core, header: RequestHeader, settings: &[u8]) -> Result<RoleStep, ConnError> {
        let Some(info) = core.info().cloned() else {
            return Err(ConnError::protocol_violation("upgrade without vhost"));
        };
        let route = core.route(header.uri().path(), header.uri().query());

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "h2c")
            .header(CONNECTION, "Upgrade")
            .body(Bytes::new())
            .map_err(|e| ConnError::protocol_violation(e.to_string()))?;
        core.write_response(response)?;
        core.count(Counter::H2Upg);

        let mut request = header.body(Bytes::new());
        *request.version_mut() = Version::HTTP_2;
        let http2 = Http2::upgraded(core, settings, Dispatch::Http { stream: 1, request, route, info })?;
        debug!(conn = %core.id, "upgraded to h2c");
        Ok(RoleStep::Switch(Role::Http2(Box::new(http2))))
    }

    pub(crate) fn complete(&mut self, core: &mut Core, completion: Completion) -> Result<(), ConnError> {
        let Completion::Http { mut response, .. } = completion else {
            return Err(unexpected(&completion, RoleKind::Http1));
        };
        let Phase::Responding { keep_alive, head, version } = self.phase else {
            return Err(ConnError::protocol_violation("response without a pending request"));
        };

        *response.version_mut() = version;
        let keep_alive = keep_alive && !crate::protocol::has_token(response.headers(), &CONNECTION, "close");
        if !keep_alive {
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        if core.vhost().is_some_and(|vhost| vhost.sts()) {
            response.headers_mut().insert("strict-transport-security", HeaderValue::from_static(STS_VALUE));
        }
        if head {
            let length = response.body().len();
            response.headers_mut().entry(CONTENT_LENGTH).or_insert_with(|| HeaderValue::from(length));
            *response.body_mut() = Bytes::new();
        }

        core.write_response(response)?;
        core.count(Counter::H1Trans);

        if keep_alive {
            self.phase = Phase::Header;
        } else {
            core.shutdown();
        }
        Ok(())
    }
}

/// Decoded `HTTP2-Settings` of an `h2c` upgrade; only bodyless requests are upgraded.
fn h2c_settings(header: &RequestHeader, payload_size: PayloadSize) -> Option<Vec<u8>> {
    if !payload_size.is_empty() || !header.connection_has("http2-settings") {
        return None;
    }
    let value = header.headers().get("http2-settings")?.to_str().ok()?;
    URL_SAFE_NO_PAD.decode(value.trim().trim_end_matches('=')).ok()
}
