use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use indoc::indoc;
use tokio_util::codec::Decoder;

use super::*;
use crate::codec::http2::{self, FrameKind, HpackDecoder, HpackEncoder};
use crate::codec::websocket::OpCode;
use crate::codec::websocket::tests::masked;
use crate::handler::BoxError;
use crate::pool::{Acquire, HeaderPool};
use crate::protocol::RequestHeader;
use crate::stats::ConnStatsSnapshot;
use crate::vhost::{Mount, VhostBuilder};

#[derive(Default)]
struct Echo {
    veto: bool,
    closes: AtomicUsize,
}

#[async_trait]
impl ProtocolHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn accept_upgrade(&self, _conn: &ConnInfo, _request: &RequestHeader) -> bool {
        !self.veto
    }

    async fn on_ws_message(&self, _conn: &ConnInfo, message: WsMessage) -> Result<Vec<WsMessage>, BoxError> {
        Ok(vec![message])
    }

    fn on_close(&self, _conn: &ConnInfo) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn registry(handler: Arc<Echo>) -> Arc<VhostRegistry> {
    Arc::new(
        VhostRegistry::from_builders(vec![
            VhostBuilder::new("example", 8080).mount(Mount::parse("/", "callback://echo").unwrap()).protocol(handler),
        ])
        .unwrap(),
    )
}

fn raw_registry(handler: Arc<Echo>) -> Arc<VhostRegistry> {
    Arc::new(VhostRegistry::from_builders(vec![VhostBuilder::new("relay", 9000).raw(handler)]).unwrap())
}

fn connection(registry: &Arc<VhostRegistry>, port: u16, limits: Limits) -> Connection {
    Connection::new(ConnId::new(1), 0, "127.0.0.1:40000".parse().unwrap(), port, registry.clone(), limits)
}

/// Steps until the connection wants something other than a header pool slot.
fn drive(conn: &mut Connection, pool: &HeaderPool) -> Step {
    loop {
        match conn.step() {
            Step::Lease => match pool.acquire(conn.id()) {
                Acquire::Leased(lease) => conn.grant_lease(lease),
                Acquire::Pending(_) => panic!("header pool exhausted in test"),
            },
            step => return step,
        }
    }
}

fn feed(conn: &mut Connection, bytes: &[u8]) {
    conn.read_buf_mut().extend_from_slice(bytes);
    conn.record_rx(bytes.len());
}

fn output(conn: &mut Connection) -> String {
    String::from_utf8_lossy(&conn.take_output()).to_ascii_lowercase()
}

fn stats(registry: &VhostRegistry) -> ConnStatsSnapshot {
    registry.totals()
}

const GET: &str = indoc! {"
    GET / HTTP/1.1\r
    Host: example\r
    \r
"};

#[test]
fn keep_alive_serves_requests_in_turn() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());
    assert_eq!(conn.timeout_kind(), TimeoutKind::Handshake);

    for round in 1..=2u64 {
        feed(&mut conn, &GET.as_bytes()[..10]);
        assert!(matches!(drive(&mut conn, &pool), Step::Read));
        assert_eq!(conn.timeout_kind(), TimeoutKind::Header);
        assert_eq!(pool.in_use(), 1);

        feed(&mut conn, &GET.as_bytes()[10..]);
        let Step::Dispatch(Dispatch::Http { stream, request, route, .. }) = drive(&mut conn, &pool) else {
            panic!("request was not dispatched");
        };
        assert_eq!(stream, 0);
        assert_eq!(request.uri().path(), "/");
        assert!(matches!(route, Route::Callback { .. }));
        assert_eq!(pool.in_use(), 0);

        conn.complete(Completion::Http { stream: 0, response: Response::new(Bytes::from_static(b"hi")) });
        let out = output(&mut conn);
        assert!(out.starts_with("http/1.1 200 ok\r\n"));
        assert!(out.ends_with("\r\n\r\nhi"));

        assert!(matches!(drive(&mut conn, &pool), Step::Read));
        assert_eq!(conn.timeout_kind(), TimeoutKind::Idle);
        assert_eq!(conn.state(), ConnState::Active(RoleKind::Http1));

        let totals = stats(&registry);
        assert_eq!(totals.h1_conn, 1);
        assert_eq!(totals.h1_trans, round);
    }
    assert_eq!(stats(&registry).rx, 2 * GET.len() as u64);
}

#[test]
fn connection_close_ends_after_response() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    feed(&mut conn, b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n");
    assert!(matches!(drive(&mut conn, &pool), Step::Dispatch(_)));
    conn.complete(Completion::Http { stream: 0, response: Response::new(Bytes::new()) });

    assert!(output(&mut conn).contains("connection: close\r\n"));
    assert!(matches!(drive(&mut conn, &pool), Step::Close));
}

#[test]
fn close_runs_once() {
    let handler = Arc::new(Echo::default());
    let registry = raw_registry(handler.clone());
    let mut conn = connection(&registry, 9000, Limits::default());

    conn.negotiated(None, None);
    assert_eq!(conn.state(), ConnState::Active(RoleKind::Raw));
    assert_eq!(registry.live(), 1);

    feed(&mut conn, b"ping");
    let Step::Dispatch(Dispatch::Raw { data, .. }) = conn.step() else {
        panic!("raw bytes were not dispatched");
    };
    assert_eq!(&data[..], b"ping");
    conn.complete(Completion::Raw(Ok(Some(Bytes::from_static(b"pong")))));
    assert_eq!(&conn.take_output()[..], b"pong");

    assert!(conn.close());
    assert!(!conn.close());
    drop(conn);

    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.live(), 0);
    assert_eq!(stats(&registry).rx, 4);
}

#[test]
fn early_close_leaves_nothing_behind() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);

    let mut conn = connection(&registry, 8080, Limits::default());
    assert!(matches!(conn.step(), Step::Read));
    assert_eq!(conn.state(), ConnState::Negotiating);
    assert!(conn.close());
    assert_eq!(conn.state(), ConnState::Closed);

    let mut conn = connection(&registry, 8080, Limits::default());
    feed(&mut conn, b"GET / HT");
    assert!(matches!(drive(&mut conn, &pool), Step::Read));
    assert!(conn.holds_lease());
    assert_eq!(pool.in_use(), 1);
    drop(conn);

    assert_eq!(pool.in_use(), 0);
    assert_eq!(registry.live(), 0);
    assert_eq!(stats(&registry), ConnStatsSnapshot::default());
}

#[test]
fn unknown_host_is_rejected_on_listener() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    feed(&mut conn, b"GET / HTTP/1.1\r\nHost: elsewhere\r\n\r\n");
    assert!(matches!(drive(&mut conn, &pool), Step::Close));
    assert!(output(&mut conn).starts_with("http/1.1 400"));
    assert!(!conn.is_bound());
    assert_eq!(pool.in_use(), 0);

    let listener = registry.listener_for_port(8080).unwrap();
    assert_eq!(registry.get(listener).stats().snapshot().rejected, 1);
    assert_eq!(stats(&registry).rejected, 1);
}

#[test]
fn oversized_body_is_refused() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let limits = Limits { max_body_bytes: 16, ..Limits::default() };
    let mut conn = connection(&registry, 8080, limits);

    feed(&mut conn, b"POST / HTTP/1.1\r\nHost: example\r\nContent-Length: 100\r\n\r\n");
    assert!(matches!(drive(&mut conn, &pool), Step::Close));
    assert!(output(&mut conn).starts_with("http/1.1 413"));
}

#[test]
fn header_larger_than_slot_is_a_bad_request() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 64);
    let mut conn = connection(&registry, 8080, Limits::default());

    feed(&mut conn, format!("GET /{} HTTP/1.1\r\nHost: example\r\n\r\n", "a".repeat(100)).as_bytes());
    assert!(matches!(drive(&mut conn, &pool), Step::Close));
    assert!(output(&mut conn).starts_with("http/1.1 400"));
    assert!(!conn.holds_lease());
    assert_eq!(pool.in_use(), 0);
}

const WS_UPGRADE: &str = indoc! {"
    GET /chat HTTP/1.1\r
    Host: example\r
    Connection: Upgrade\r
    Upgrade: websocket\r
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r
    Sec-WebSocket-Version: 13\r
    \r
"};

#[test]
fn websocket_upgrade_keeps_bytes_behind_request() {
    let handler = Arc::new(Echo::default());
    let registry = registry(handler.clone());
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    let mut bytes = WS_UPGRADE.as_bytes().to_vec();
    bytes.extend_from_slice(&masked(true, OpCode::Text, b"hello"));
    feed(&mut conn, &bytes);

    let Step::Dispatch(Dispatch::WsMessage { message, .. }) = drive(&mut conn, &pool) else {
        panic!("websocket message was not dispatched");
    };
    assert_eq!(message, WsMessage::text("hello"));
    assert_eq!(conn.state(), ConnState::Active(RoleKind::WebSocket));

    let out = output(&mut conn);
    assert!(out.starts_with("http/1.1 101 switching protocols\r\n"));
    assert!(out.contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo=\r\n"));

    conn.complete(Completion::Ws(Ok(vec![WsMessage::text("HELLO")])));
    assert_eq!(&conn.take_output()[..], b"\x81\x05HELLO");

    let totals = stats(&registry);
    assert_eq!(totals.ws_upg, 1);
    assert_eq!(totals.h1_conn, 1);

    feed(&mut conn, &masked(true, OpCode::Close, &[0x03, 0xE8]));
    assert!(matches!(drive(&mut conn, &pool), Step::Close));
    assert_eq!(&conn.take_output()[..], b"\x88\x02\x03\xE8");
    drop(conn);
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn vetoed_upgrade_stays_http1() {
    let registry = registry(Arc::new(Echo { veto: true, ..Echo::default() }));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    feed(&mut conn, WS_UPGRADE.as_bytes());
    assert!(matches!(drive(&mut conn, &pool), Step::Read));
    assert!(output(&mut conn).starts_with("http/1.1 403"));
    assert_eq!(conn.state(), ConnState::Active(RoleKind::Http1));

    let totals = stats(&registry);
    assert_eq!(totals.ws_upg, 0);
    assert_eq!(totals.h1_trans, 1);
}

#[test]
fn oversized_websocket_message_closes_with_1009() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let limits = Limits { max_ws_message_bytes: 8, ..Limits::default() };
    let mut conn = connection(&registry, 8080, limits);

    let mut bytes = WS_UPGRADE.as_bytes().to_vec();
    bytes.extend_from_slice(&masked(true, OpCode::Binary, &[0u8; 32]));
    feed(&mut conn, &bytes);

    assert!(matches!(drive(&mut conn, &pool), Step::Close));
    let out = conn.take_output();
    assert!(out.ends_with(b"\x88\x02\x03\xF1"));
}

fn client_frame(frame: http2::Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    http2::FrameEncoder.encode(frame, &mut buf).unwrap();
    buf
}

fn server_frames(conn: &mut Connection) -> Vec<http2::Frame> {
    let mut out = conn.take_output();
    let mut decoder = http2::FrameDecoder::default();
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode(&mut out).unwrap() {
        frames.push(frame);
    }
    assert!(out.is_empty());
    frames
}

#[test]
fn h2_prior_knowledge_request_roundtrip() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    let block = HpackEncoder::new().encode(vec![
        (&b":method"[..], &b"GET"[..]),
        (&b":scheme"[..], &b"http"[..]),
        (&b":authority"[..], &b"example"[..]),
        (&b":path"[..], &b"/hello?x=1"[..]),
        (&b"user-agent"[..], &b"test"[..]),
    ]);
    let mut bytes = BytesMut::from(http2::PREFACE);
    bytes.extend_from_slice(&client_frame(http2::Frame::settings(&[])));
    for frame in http2::header_frames(1, block, true, http2::DEFAULT_MAX_FRAME_SIZE) {
        bytes.extend_from_slice(&client_frame(frame));
    }
    feed(&mut conn, &bytes);

    let Step::Dispatch(Dispatch::Http { stream, request, .. }) = drive(&mut conn, &pool) else {
        panic!("stream was not dispatched");
    };
    assert_eq!(conn.state(), ConnState::Active(RoleKind::Http2));
    assert_eq!(stream, 1);
    assert_eq!(request.uri().path(), "/hello");
    assert_eq!(request.uri().query(), Some("x=1"));
    assert_eq!(request.headers()["user-agent"], "test");
    assert_eq!(pool.in_use(), 0);

    let frames = server_frames(&mut conn);
    assert_eq!(frames[0].kind, FrameKind::Settings);
    assert!(!frames[0].has(http2::flags::ACK));
    assert_eq!(frames[1].kind, FrameKind::Settings);
    assert!(frames[1].has(http2::flags::ACK));

    let mut response = Response::new(Bytes::from_static(b"hi"));
    *response.status_mut() = StatusCode::CREATED;
    conn.complete(Completion::Http { stream: 1, response });

    let frames = server_frames(&mut conn);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind, FrameKind::Headers);
    assert!(frames[0].has(http2::flags::END_HEADERS));
    let headers = HpackDecoder::new().decode(&frames[0].payload).unwrap();
    assert_eq!(headers[0], (b":status".to_vec(), b"201".to_vec()));
    assert!(headers.contains(&(b"content-length".to_vec(), b"2".to_vec())));
    assert_eq!(frames[1], http2::Frame::data(1, Bytes::from_static(b"hi"), true));

    let totals = stats(&registry);
    assert_eq!(totals.h2_subs, 1);
    assert_eq!(totals.h2_trans, 1);
    assert_eq!(totals.h1_conn, 0);
    assert!(matches!(drive(&mut conn, &pool), Step::Read));
}

#[test]
fn h2_head_response_has_no_data() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    let block = HpackEncoder::new().encode(vec![
        (&b":method"[..], &b"HEAD"[..]),
        (&b":scheme"[..], &b"http"[..]),
        (&b":authority"[..], &b"example"[..]),
        (&b":path"[..], &b"/page"[..]),
    ]);
    let mut bytes = BytesMut::from(http2::PREFACE);
    bytes.extend_from_slice(&client_frame(http2::Frame::settings(&[])));
    for frame in http2::header_frames(1, block, true, http2::DEFAULT_MAX_FRAME_SIZE) {
        bytes.extend_from_slice(&client_frame(frame));
    }
    feed(&mut conn, &bytes);
    assert!(matches!(drive(&mut conn, &pool), Step::Dispatch(Dispatch::Http { stream: 1, .. })));
    server_frames(&mut conn);

    conn.complete(Completion::Http { stream: 1, response: Response::new(Bytes::from_static(b"hello")) });
    let frames = server_frames(&mut conn);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, FrameKind::Headers);
    assert!(frames[0].has(http2::flags::END_STREAM));
    let headers = HpackDecoder::new().decode(&frames[0].payload).unwrap();
    assert!(headers.contains(&(b"content-length".to_vec(), b"5".to_vec())));
    assert!(matches!(drive(&mut conn, &pool), Step::Read));
}

#[test]
fn h2c_upgrade_turns_request_into_stream_one() {
    let registry = registry(Arc::new(Echo::default()));
    let pool = HeaderPool::new(1, 1024);
    let mut conn = connection(&registry, 8080, Limits::default());

    feed(
        &mut conn,
        indoc! {"
            GET /up HTTP/1.1\r
            Host: example\r
            Connection: Upgrade, HTTP2-Settings\r
            Upgrade: h2c\r
            HTTP2-Settings: AAMAAABkAAQAAP__\r
            \r
        "}
        .as_bytes(),
    );

    let Step::Dispatch(Dispatch::Http { stream, request, .. }) = drive(&mut conn, &pool) else {
        panic!("upgrade request was not dispatched");
    };
    assert_eq!(stream, 1);
    assert_eq!(request.uri().path(), "/up");
    assert_eq!(conn.state(), ConnState::Active(RoleKind::Http2));
    assert!(String::from_utf8_lossy(&conn.take_output()).starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

    let totals = stats(&registry);
    assert_eq!(totals.h2_upg, 1);
    assert_eq!(totals.h2_subs, 1);

    feed(&mut conn, http2::PREFACE);
    assert!(matches!(drive(&mut conn, &pool), Step::Read));
}

#[test]
fn alpn_h2_is_counted() {
    let registry = registry(Arc::new(Echo::default()));
    let mut conn = connection(&registry, 8080, Limits::default());

    conn.negotiated(Some("example"), Some(&b"h2"[..]));
    assert!(conn.is_bound());
    assert_eq!(conn.state(), ConnState::Active(RoleKind::Http2));
    assert_eq!(stats(&registry).h2_alpn, 1);
}
