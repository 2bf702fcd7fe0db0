//! HTTP/2 over a single connection.
//!
//! Streams are received in full (header block plus DATA up to `max_body_bytes`) before they are
//! dispatched; several streams may be dispatched at once. Responses are sent as HEADERS followed
//! by DATA limited by the peer's connection and stream windows. Receive windows are replenished
//! as soon as DATA is consumed.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::codec::http2::{
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW, Frame, FrameDecoder, FrameEncoder, FrameKind, HeaderList, HpackDecoder,
    HpackEncoder, MAX_WINDOW, PREFACE, error_code, flags, header_frames, setting,
};
use crate::connection::{Completion, Core, Dispatch, Limits, RoleKind};
use crate::error::ConnError;
use crate::protocol::ParseError;
use crate::stats::Counter;

use super::{RoleStep, unexpected};

const STS_VALUE: &str = "max-age=15768000 ; includeSubDomains";

pub(crate) struct Http2 {
    decoder: FrameDecoder,
    hpack_in: HpackDecoder,
    hpack_out: HpackEncoder,
    preface_done: bool,
    settings_sent: bool,
    peer_max_frame: usize,
    peer_initial_window: i64,
    send_window: i64,
    streams: BTreeMap<u32, Stream>,
    last_stream: u32,
    /// Header block spread over HEADERS + CONTINUATION: stream, fragments, END_STREAM.
    continuation: Option<(u32, BytesMut, bool)>,
    ready: VecDeque<Dispatch>,
    going_away: bool,
}

struct Stream {
    request: Option<Request<()>>,
    body: BytesMut,
    send_window: i64,
    dispatched: bool,
    /// Answer with headers only.
    head: bool,
    outgoing: Option<Bytes>,
}

impl Stream {
    fn new(send_window: i64) -> Self {
        Self { request: None, body: BytesMut::new(), send_window, dispatched: false, head: false, outgoing: None }
    }
}

impl Http2 {
    pub(crate) fn new(limits: Limits) -> Self {
        Self {
            decoder: FrameDecoder::new(limits.h2.max_frame_size as usize),
            hpack_in: HpackDecoder::new(),
            hpack_out: HpackEncoder::new(),
            preface_done: false,
            settings_sent: false,
            peer_max_frame: DEFAULT_MAX_FRAME_SIZE,
            peer_initial_window: i64::from(DEFAULT_WINDOW),
            send_window: i64::from(DEFAULT_WINDOW),
            streams: BTreeMap::new(),
            last_stream: 0,
            continuation: None,
            ready: VecDeque::new(),
            going_away: false,
        }
    }

    /// HTTP/2 entered through an `h2c` upgrade: `settings` is the decoded `HTTP2-Settings`
    /// payload and `dispatch` the upgrade request, now stream 1.
    pub(crate) fn upgraded(core: &mut Core, settings: &[u8], dispatch: Dispatch) -> Result<Self, ConnError> {
        let mut http2 = Self::new(core.limits);
        let values = Frame::new(FrameKind::Settings, 0, 0, Bytes::copy_from_slice(settings)).setting_values()?;
        http2.apply_settings(&values)?;

        let mut stream = Stream::new(http2.peer_initial_window);
        stream.dispatched = true;
        http2.streams.insert(1, stream);
        http2.last_stream = 1;
        http2.ready.push_back(dispatch);
        core.count(Counter::H2Subs);
        Ok(http2)
    }

    pub(crate) fn step(&mut self, core: &mut Core) -> Result<RoleStep, ConnError> {
        if !self.settings_sent {
            self.settings_sent = true;
            let h2 = core.limits.h2;
            send(
                core,
                Frame::settings(&[
                    (setting::MAX_CONCURRENT_STREAMS, h2.max_concurrent_streams),
                    (setting::INITIAL_WINDOW_SIZE, h2.initial_window_size),
                    (setting::MAX_FRAME_SIZE, h2.max_frame_size),
                ]),
            )?;
        }

        if let Some(dispatch) = self.ready.pop_front() {
            return Ok(RoleStep::Dispatch(dispatch));
        }
        if !self.preface_done {
            let n = core.read_buf.len().min(PREFACE.len());
            if core.read_buf[..n] != PREFACE[..n] {
                return Err(ConnError::protocol_violation("bad http/2 connection preface"));
            }
            if n < PREFACE.len() {
                return Ok(if core.eof { RoleStep::Close } else { RoleStep::Read });
            }
            core.read_buf.advance(PREFACE.len());
            self.preface_done = true;
        }

        loop {
            if let Some(dispatch) = self.ready.pop_front() {
                return Ok(RoleStep::Dispatch(dispatch));
            }

            let frame = match self.decoder.decode(&mut core.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(self.idle_step(core)),
                Err(e) => {
                    let code = match e {
                        ParseError::TooLargeFrame { .. } => error_code::FRAME_SIZE_ERROR,
                        _ => error_code::PROTOCOL_ERROR,
                    };
                    return Err(self.go_away(core, code, e.into()));
                }
            };

            trace!(conn = %core.id, kind = ?frame.kind, stream = frame.stream, flags = frame.flags, len = frame.payload.len(), "http/2 frame");
            if let Err((code, e)) = self.on_frame(core, frame) {
                return Err(self.go_away(core, code, e));
            }
        }
    }

    /// What to do once the read buffer holds no complete frame.
    fn idle_step(&self, core: &Core) -> RoleStep {
        let awaiting = self.streams.values().any(|stream| stream.dispatched && stream.outgoing.is_none());
        if (self.going_away || core.eof) && !awaiting {
            return RoleStep::Close;
        }
        if core.eof { RoleStep::Wait } else { RoleStep::Read }
    }

    fn go_away(&mut self, core: &mut Core, code: u32, e: ConnError) -> ConnError {
        self.going_away = true;
        if let Err(send_error) = send(core, Frame::goaway(self.last_stream, code)) {
            return send_error;
        }
        e
    }

    fn on_frame(&mut self, core: &mut Core, frame: Frame) -> Result<(), (u32, ConnError)> {
        if let Some((stream, ..)) = &self.continuation {
            if frame.kind != FrameKind::Continuation || frame.stream != *stream {
                return Err(protocol_error("header block interrupted"));
            }
        }

        match frame.kind {
            FrameKind::Data => self.on_data(core, frame),
            FrameKind::Headers => self.on_headers(core, frame),
            FrameKind::Continuation => self.on_continuation(core, frame),
            FrameKind::RstStream => {
                if frame.stream == 0 {
                    return Err(protocol_error("RST_STREAM on stream 0"));
                }
                if self.streams.remove(&frame.stream).is_some() {
                    debug!(conn = %core.id, stream = frame.stream, code = ?frame.u31_at(0).ok(), "stream reset by peer");
                }
                Ok(())
            }
            FrameKind::Settings => {
                if frame.stream != 0 {
                    return Err(protocol_error("SETTINGS on a stream"));
                }
                if frame.has(flags::ACK) {
                    return Ok(());
                }
                let values = frame.setting_values().map_err(|e| (error_code::FRAME_SIZE_ERROR, e.into()))?;
                self.apply_settings(&values).map_err(|e| (error_code::PROTOCOL_ERROR, e))?;
                send(core, Frame::settings_ack()).map_err(internal)?;
                self.flush_pending(core).map_err(internal)
            }
            FrameKind::Ping => {
                if frame.payload.len() != 8 {
                    return Err((error_code::FRAME_SIZE_ERROR, ConnError::protocol_violation("PING payload is not 8 bytes")));
                }
                if !frame.has(flags::ACK) {
                    send(core, Frame::ping_ack(frame.payload)).map_err(internal)?;
                }
                Ok(())
            }
            FrameKind::GoAway => {
                debug!(conn = %core.id, last_stream = ?frame.u31_at(0).ok(), "peer is going away");
                self.going_away = true;
                Ok(())
            }
            FrameKind::WindowUpdate => self.on_window_update(core, frame),
            FrameKind::PushPromise => Err(protocol_error("PUSH_PROMISE from a client")),
            FrameKind::Priority | FrameKind::Unknown(_) => Ok(()),
        }
    }

    fn apply_settings(&mut self, values: &[(u16, u32)]) -> Result<(), ConnError> {
        for &(id, value) in values {
            match id {
                setting::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW {
                        return Err(ConnError::protocol_violation(format!("initial window size {value}")));
                    }
                    let delta = i64::from(value) - self.peer_initial_window;
                    self.peer_initial_window = i64::from(value);
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                setting::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE as u32..=(1 << 24) - 1).contains(&value) {
                        return Err(ConnError::protocol_violation(format!("max frame size {value}")));
                    }
                    self.peer_max_frame = value as usize;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_data(&mut self, core: &mut Core, frame: Frame) -> Result<(), (u32, ConnError)> {
        if frame.stream == 0 {
            return Err(protocol_error("DATA on stream 0"));
        }
        let content = frame.content().map_err(|e| (error_code::PROTOCOL_ERROR, e.into()))?;
        let consumed = frame.payload.len() as u32;
        let end_stream = frame.has(flags::END_STREAM);
        if consumed > 0 {
            send(core, Frame::window_update(0, consumed)).map_err(internal)?;
        }

        let max_body = core.limits.max_body_bytes;
        let Some(stream) = self.streams.get_mut(&frame.stream).filter(|stream| !stream.dispatched) else {
            return send(core, Frame::rst_stream(frame.stream, error_code::STREAM_CLOSED)).map_err(internal);
        };
        if stream.body.len() + content.len() > max_body {
            self.streams.remove(&frame.stream);
            self.send_status(core, frame.stream, StatusCode::PAYLOAD_TOO_LARGE).map_err(internal)?;
            return send(core, Frame::rst_stream(frame.stream, error_code::NO_ERROR)).map_err(internal);
        }
        stream.body.extend_from_slice(&content);

        if end_stream {
            self.finish_stream(core, frame.stream)
        } else {
            if consumed > 0 {
                send(core, Frame::window_update(frame.stream, consumed)).map_err(internal)?;
            }
            Ok(())
        }
    }

    fn on_headers(&mut self, core: &mut Core, frame: Frame) -> Result<(), (u32, ConnError)> {
        if frame.stream == 0 || frame.stream % 2 == 0 {
            return Err(protocol_error(format!("HEADERS on stream {}", frame.stream)));
        }
        if !self.streams.contains_key(&frame.stream) && frame.stream <= self.last_stream {
            return Err((error_code::STREAM_CLOSED, ConnError::protocol_violation(format!("stream {} already closed", frame.stream))));
        }

        let block = frame.content().map_err(|e| (error_code::PROTOCOL_ERROR, e.into()))?;
        let end_stream = frame.has(flags::END_STREAM);
        if frame.has(flags::END_HEADERS) {
            self.on_header_block(core, frame.stream, &block, end_stream)
        } else {
            self.continuation = Some((frame.stream, BytesMut::from(&block[..]), end_stream));
            Ok(())
        }
    }

    fn on_continuation(&mut self, core: &mut Core, frame: Frame) -> Result<(), (u32, ConnError)> {
        let Some((stream, mut block, end_stream)) = self.continuation.take() else {
            return Err(protocol_error("CONTINUATION without HEADERS"));
        };
        block.extend_from_slice(&frame.payload);
        if block.len() > core.limits.max_body_bytes.max(64 * 1024) {
            return Err(protocol_error("header block too large"));
        }
        if frame.has(flags::END_HEADERS) {
            self.on_header_block(core, stream, &block, end_stream)
        } else {
            self.continuation = Some((stream, block, end_stream));
            Ok(())
        }
    }

    fn on_header_block(&mut self, core: &mut Core, id: u32, block: &[u8], end_stream: bool) -> Result<(), (u32, ConnError)> {
        let headers = self.hpack_in.decode(block).map_err(|e| (error_code::COMPRESSION_ERROR, e.into()))?;

        if let Some(stream) = self.streams.get(&id) {
            // trailers, their fields are dropped
            if stream.dispatched || !end_stream {
                return Err(protocol_error(format!("unexpected header block on stream {id}")));
            }
            return self.finish_stream(core, id);
        }

        self.last_stream = id;
        if self.going_away || self.streams.len() >= core.limits.h2.max_concurrent_streams as usize {
            debug!(conn = %core.id, stream = id, "stream refused");
            return send(core, Frame::rst_stream(id, error_code::REFUSED_STREAM)).map_err(internal);
        }
        core.count(Counter::H2Subs);

        let request = match build_request(headers) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn = %core.id, stream = id, cause = %e, "malformed request header block");
                return send(core, Frame::rst_stream(id, error_code::PROTOCOL_ERROR)).map_err(internal);
            }
        };

        let host = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_string())
            .or_else(|| request.headers().get(http::header::HOST).and_then(|value| value.to_str().ok()).map(str::to_string));
        core.bind_host(host.as_deref()).map_err(|e| (error_code::REFUSED_STREAM, e))?;

        let mut stream = Stream::new(self.peer_initial_window);
        stream.request = Some(request);
        self.streams.insert(id, stream);

        if end_stream { self.finish_stream(core, id) } else { Ok(()) }
    }

    fn on_window_update(&mut self, core: &mut Core, frame: Frame) -> Result<(), (u32, ConnError)> {
        let increment = frame.u31_at(0).map_err(|e| (error_code::FRAME_SIZE_ERROR, e.into()))?;
        if frame.stream == 0 {
            if increment == 0 {
                return Err(protocol_error("zero window increment"));
            }
            self.send_window += i64::from(increment);
            if self.send_window > i64::from(MAX_WINDOW) {
                return Err((error_code::FLOW_CONTROL_ERROR, ConnError::protocol_violation("connection window overflow")));
            }
        } else if let Some(stream) = self.streams.get_mut(&frame.stream) {
            stream.send_window += i64::from(increment);
            if increment == 0 || stream.send_window > i64::from(MAX_WINDOW) {
                self.streams.remove(&frame.stream);
                return send(core, Frame::rst_stream(frame.stream, error_code::FLOW_CONTROL_ERROR)).map_err(internal);
            }
        }
        self.flush_pending(core).map_err(internal)
    }

    /// The stream's request is complete: queue it for dispatch.
    fn finish_stream(&mut self, core: &mut Core, id: u32) -> Result<(), (u32, ConnError)> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        let Some(request) = stream.request.take() else {
            return Err(protocol_error(format!("stream {id} finished twice")));
        };
        stream.dispatched = true;
        stream.head = request.method() == Method::HEAD;
        let body = std::mem::take(&mut stream.body).freeze();

        let Some(info) = core.info().cloned() else {
            return Err(protocol_error("stream without vhost"));
        };
        let route = core.route(request.uri().path(), request.uri().query());
        debug!(conn = %core.id, stream = id, method = %request.method(), uri = %request.uri(), ?route, "dispatching stream");
        self.ready.push_back(Dispatch::Http { stream: id, request: request.map(|()| body), route, info });
        Ok(())
    }

    fn send_status(&mut self, core: &mut Core, id: u32, status: StatusCode) -> Result<(), ConnError> {
        let block = self.hpack_out.encode([(&b":status"[..], status.as_str().as_bytes())]);
        for frame in header_frames(id, block, true, self.peer_max_frame) {
            send(core, frame)?;
        }
        Ok(())
    }

    pub(crate) fn complete(&mut self, core: &mut Core, completion: Completion) -> Result<(), ConnError> {
        let Completion::Http { stream: id, response } = completion else {
            return Err(unexpected(&completion, RoleKind::Http2));
        };
        let Some(head) = self.streams.get(&id).map(|stream| stream.head) else {
            trace!(conn = %core.id, stream = id, "response for reset stream dropped");
            return Ok(());
        };

        let sts = core.vhost().is_some_and(|vhost| vhost.sts());
        let (block, mut body) = self.encode_head(response, sts);
        if head {
            body.clear();
        }
        let end_stream = body.is_empty();
        for frame in header_frames(id, block, end_stream, self.peer_max_frame) {
            send(core, frame)?;
        }
        core.count(Counter::H2Trans);

        if end_stream {
            self.streams.remove(&id);
        } else if let Some(stream) = self.streams.get_mut(&id) {
            stream.outgoing = Some(body);
        }
        self.flush_pending(core)
    }

    fn encode_head(&mut self, response: Response<Bytes>, sts: bool) -> (Bytes, Bytes) {
        let (mut parts, body) = response.into_parts();
        for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE, HeaderName::from_static("keep-alive"), HeaderName::from_static("proxy-connection")] {
            parts.headers.remove(name);
        }
        if !parts.headers.contains_key(CONTENT_LENGTH) && !body.is_empty() {
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        if sts {
            parts.headers.insert("strict-transport-security", HeaderValue::from_static(STS_VALUE));
        }

        let status = parts.status.as_str().to_string();
        let fields = std::iter::once((&b":status"[..], status.as_bytes()))
            .chain(parts.headers.iter().map(|(name, value)| (name.as_str().as_bytes(), value.as_bytes())));
        (self.hpack_out.encode(fields), body)
    }

    /// Sends queued response bodies as far as the flow control windows allow.
    fn flush_pending(&mut self, core: &mut Core) -> Result<(), ConnError> {
        let mut finished = Vec::new();
        for (&id, stream) in self.streams.iter_mut() {
            let Some(data) = stream.outgoing.as_mut() else {
                continue;
            };
            while !data.is_empty() && self.send_window > 0 && stream.send_window > 0 {
                let allowed = self.send_window.min(stream.send_window) as usize;
                let chunk = data.split_to(data.len().min(self.peer_max_frame).min(allowed));
                self.send_window -= chunk.len() as i64;
                stream.send_window -= chunk.len() as i64;
                let end_stream = data.is_empty();
                send(core, Frame::data(id, chunk, end_stream))?;
            }
            if data.is_empty() {
                finished.push(id);
            }
        }
        for id in finished {
            self.streams.remove(&id);
        }
        Ok(())
    }
}

fn send(core: &mut Core, frame: Frame) -> Result<(), ConnError> {
    FrameEncoder.encode(frame, &mut core.write_buf)?;
    Ok(())
}

fn protocol_error<S: ToString>(reason: S) -> (u32, ConnError) {
    (error_code::PROTOCOL_ERROR, ConnError::protocol_violation(reason))
}

fn internal(e: ConnError) -> (u32, ConnError) {
    (error_code::INTERNAL_ERROR, e)
}

/// Turns a decoded header list into a request; pseudo headers must precede regular ones.
fn build_request(headers: HeaderList) -> Result<Request<()>, ConnError> {
    let (mut method, mut scheme, mut authority, mut path) = (None, None, None, None);
    let mut builder = Request::builder().version(Version::HTTP_2);
    let mut regular = false;

    for (name, value) in headers {
        if let Some(pseudo) = name.strip_prefix(b":") {
            if regular {
                return Err(ConnError::protocol_violation("pseudo header after regular header"));
            }
            let value = String::from_utf8(value).map_err(ConnError::protocol_violation)?;
            let slot = match pseudo {
                b"method" => &mut method,
                b"scheme" => &mut scheme,
                b"authority" => &mut authority,
                b"path" => &mut path,
                _ => return Err(ConnError::protocol_violation(format!("unknown pseudo header {}", String::from_utf8_lossy(&name)))),
            };
            if slot.replace(value).is_some() {
                return Err(ConnError::protocol_violation("duplicate pseudo header"));
            }
            continue;
        }

        regular = true;
        let name = HeaderName::from_bytes(&name).map_err(ConnError::protocol_violation)?;
        let value = HeaderValue::from_bytes(&value).map_err(ConnError::protocol_violation)?;
        builder = builder.header(name, value);
    }

    let (Some(method), Some(path)) = (method, path) else {
        return Err(ConnError::protocol_violation("missing :method or :path"));
    };
    let uri = match (scheme, authority) {
        (Some(scheme), Some(authority)) => format!("{scheme}://{authority}{path}"),
        _ => path,
    };
    let uri = Uri::try_from(uri).map_err(ConnError::protocol_violation)?;
    builder.method(method.as_str()).uri(uri).body(()).map_err(ConnError::protocol_violation)
}
