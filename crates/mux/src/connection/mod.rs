//! The per-socket connection state machine.
//!
//! A [`Connection`] never touches a socket. The service thread's driver reads bytes into
//! [`Connection::read_buf_mut`], calls [`Connection::step`] and acts on the returned [`Step`]:
//! read more, lease a header pool slot, run a [`Dispatch`] (application callback, file, CGI),
//! wait for outstanding dispatches, or close. Whatever the connection wants to send piles up in
//! its write buffer and is taken with [`Connection::take_output`].
//!
//! ```text
//! Accepted -> Negotiating -> Active(Http1 | Http2 | WebSocket | Raw) -> Closing -> Closed
//! ```
//!
//! The active protocol is a [`Role`]. Switching roles (HTTP/1 upgrades, ALPN, prior knowledge)
//! replaces the role but never the buffers, so bytes that arrived behind an upgrade request are
//! parsed by the new role.
//!
//! Cleanup runs exactly once: [`Connection::close`] is idempotent and `Drop` falls back to it.

mod role;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{Request, Response, StatusCode};
use tokio_util::codec::Encoder;
use tracing::{debug, trace, warn};

use crate::codec::ResponseEncoder;
use crate::codec::http2::PREFACE;
use crate::config::{ContextConfig, Http2Config};
use crate::error::ConnError;
use crate::handler::{ConnInfo, ProtocolHandler};
use crate::pool::Lease;
use crate::protocol::{WsMessage, status_response};
use crate::stats::Counter;
use crate::vhost::{CachePolicy, Origin, Vhost, VhostBinding, VhostId, VhostRegistry};

use role::{Http1, Http2, Raw, Role, RoleStep};

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Http1,
    Http2,
    WebSocket,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Negotiating,
    Active(RoleKind),
    Closing,
    Closed,
}

/// Which deadline applies while the connection waits for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Handshake,
    Header,
    Idle,
}

/// What the driver should do next.
#[derive(Debug)]
pub enum Step {
    /// Wait for more bytes from the peer.
    Read,
    /// Wait for a header pool slot, then hand it over with [`Connection::grant_lease`].
    Lease,
    /// Run the work and report back through [`Connection::complete`].
    Dispatch(Dispatch),
    /// Nothing to do until an outstanding dispatch completes.
    Wait,
    /// Flush pending output and close.
    Close,
}

/// Where an HTTP request is served from, resolved against the virtual host's mounts.
#[derive(Clone)]
pub enum Route {
    File { root: PathBuf, relative: String, default_document: Option<String>, cache: CachePolicy },
    Cgi { program: PathBuf, script_name: String, path_info: String },
    Redirect { location: String },
    Callback { handler: Arc<dyn ProtocolHandler> },
    NotFound,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::File { root, relative, .. } => f.debug_struct("File").field("root", root).field("relative", relative).finish(),
            Route::Cgi { program, path_info, .. } => f.debug_struct("Cgi").field("program", program).field("path_info", path_info).finish(),
            Route::Redirect { location } => f.debug_struct("Redirect").field("location", location).finish(),
            Route::Callback { handler } => f.debug_struct("Callback").field("handler", &handler.name()).finish(),
            Route::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Work a connection hands to its driver.
pub enum Dispatch {
    /// A complete request; `stream` is 0 on HTTP/1.
    Http { stream: u32, request: Request<Bytes>, route: Route, info: ConnInfo },
    WsMessage { handler: Arc<dyn ProtocolHandler>, message: WsMessage, info: ConnInfo },
    Raw { handler: Arc<dyn ProtocolHandler>, data: Bytes, info: ConnInfo },
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Http { stream, request, route, .. } => f
                .debug_struct("Http")
                .field("stream", stream)
                .field("method", request.method())
                .field("uri", request.uri())
                .field("route", route)
                .finish(),
            Dispatch::WsMessage { handler, message, .. } => {
                f.debug_struct("WsMessage").field("handler", &handler.name()).field("len", &message.len()).finish()
            }
            Dispatch::Raw { handler, data, .. } => f.debug_struct("Raw").field("handler", &handler.name()).field("len", &data.len()).finish(),
        }
    }
}

/// Result of a [`Dispatch`].
#[derive(Debug)]
pub enum Completion {
    Http { stream: u32, response: Response<Bytes> },
    Ws(Result<Vec<WsMessage>, String>),
    Raw(Result<Option<Bytes>, String>),
}

/// Per connection limits taken from the context configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_body_bytes: usize,
    pub max_ws_message_bytes: usize,
    pub h2: Http2Config,
}

impl From<&ContextConfig> for Limits {
    fn from(config: &ContextConfig) -> Self {
        Self { max_body_bytes: config.max_body_bytes, max_ws_message_bytes: config.max_ws_message_bytes, h2: config.h2 }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

/// Everything of a connection except its role, lent to the role on every step.
pub(crate) struct Core {
    pub(crate) id: ConnId,
    pub(crate) thread: usize,
    pub(crate) peer: SocketAddr,
    pub(crate) port: u16,
    pub(crate) limits: Limits,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) lease: Option<Lease>,
    pub(crate) eof: bool,
    registry: Arc<VhostRegistry>,
    binding: Option<VhostBinding>,
    info: Option<ConnInfo>,
    unbound_rx: u64,
    unbound_tx: u64,
    unbound_counters: Vec<Counter>,
    shutdown: bool,
}

impl Core {
    pub(crate) fn vhost(&self) -> Option<&Vhost> {
        self.binding.as_ref().map(VhostBinding::vhost)
    }

    pub(crate) fn info(&self) -> Option<&ConnInfo> {
        self.info.as_ref()
    }

    /// Attaches the connection to a virtual host and settles what was counted before.
    pub(crate) fn bind(&mut self, id: VhostId) {
        if self.binding.is_some() {
            return;
        }

        let binding = self.registry.bind(id);
        let stats = binding.stats();
        stats.add_rx(std::mem::take(&mut self.unbound_rx));
        stats.add_tx(std::mem::take(&mut self.unbound_tx));
        for counter in self.unbound_counters.drain(..) {
            stats.incr(counter);
        }

        debug!(conn = %self.id, vhost = binding.vhost().name(), "bound to vhost");
        self.info = Some(ConnInfo {
            id: self.id,
            thread: self.thread,
            peer: self.peer,
            vhost: Arc::from(binding.vhost().name()),
            port: self.port,
        });
        self.binding = Some(binding);
    }

    /// Binds by `Host` / `:authority` / SNI name unless already bound.
    ///
    /// No match charges a rejection to the virtual host listening on the port.
    pub(crate) fn bind_host(&mut self, host: Option<&str>) -> Result<(), ConnError> {
        if self.binding.is_some() {
            return Ok(());
        }

        match self.registry.match_host(self.port, host) {
            Some(id) => {
                self.bind(id);
                Ok(())
            }
            None => {
                if let Some(listener) = self.registry.listener_for_port(self.port) {
                    self.registry.get(listener).stats().incr(Counter::Rejected);
                }
                Err(ConnError::no_matching_vhost(host, self.port))
            }
        }
    }

    pub(crate) fn count(&mut self, counter: Counter) {
        match &self.binding {
            Some(binding) => binding.stats().incr(counter),
            None => self.unbound_counters.push(counter),
        }
    }

    fn record_rx(&mut self, bytes: u64) {
        match &self.binding {
            Some(binding) => binding.stats().add_rx(bytes),
            None => self.unbound_rx += bytes,
        }
    }

    fn record_tx(&mut self, bytes: u64) {
        match &self.binding {
            Some(binding) => binding.stats().add_tx(bytes),
            None => self.unbound_tx += bytes,
        }
    }

    /// Ends the connection once pending output is flushed.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown = true;
    }

    pub(crate) fn write_response(&mut self, response: Response<Bytes>) -> Result<(), ConnError> {
        ResponseEncoder::new().encode(response, &mut self.write_buf)?;
        Ok(())
    }

    /// Writes a bodyless error response for a request that won't be dispatched.
    pub(crate) fn write_status(&mut self, status: StatusCode) {
        let mut response = status_response(status);
        response.headers_mut().insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
        if let Err(e) = self.write_response(response) {
            warn!(conn = %self.id, cause = %e, "can't encode error response");
        }
    }

    /// Resolves `path` against the bound virtual host's mounts.
    pub(crate) fn route(&self, path: &str, query: Option<&str>) -> Route {
        let Some(vhost) = self.vhost() else {
            return Route::NotFound;
        };
        let Some((mount, rest)) = vhost.mounts().resolve(path) else {
            return Route::NotFound;
        };

        match mount.origin() {
            Origin::File(root) => Route::File {
                root: root.clone(),
                relative: rest.trim_start_matches('/').to_string(),
                default_document: mount.default_document().map(str::to_string),
                cache: *mount.cache(),
            },
            Origin::Cgi(program) => {
                Route::Cgi { program: program.clone(), script_name: mount.mountpoint().to_string(), path_info: rest.to_string() }
            }
            Origin::Redirect(target) => {
                let mut location = target.trim_end_matches('/').to_string();
                location.push_str(if rest.is_empty() { "/" } else { rest });
                if let Some(query) = query {
                    location.push('?');
                    location.push_str(query);
                }
                Route::Redirect { location }
            }
            Origin::Callback(name) => match vhost.protocol(name) {
                Some(handler) => Route::Callback { handler: Arc::clone(handler) },
                None => Route::NotFound,
            },
        }
    }
}

pub struct Connection {
    core: Core,
    state: ConnState,
    role: Option<Role>,
}

impl Connection {
    pub fn new(id: ConnId, thread: usize, peer: SocketAddr, port: u16, registry: Arc<VhostRegistry>, limits: Limits) -> Self {
        let core = Core {
            id,
            thread,
            peer,
            port,
            limits,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::new(),
            lease: None,
            eof: false,
            registry,
            binding: None,
            info: None,
            unbound_rx: 0,
            unbound_tx: 0,
            unbound_counters: Vec::new(),
            shutdown: false,
        };
        Self { core, state: ConnState::Accepted, role: None }
    }

    pub fn id(&self) -> ConnId {
        self.core.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.core.binding.is_some()
    }

    pub fn vhost_id(&self) -> Option<VhostId> {
        self.core.binding.as_ref().map(VhostBinding::id)
    }

    pub fn holds_lease(&self) -> bool {
        self.core.lease.is_some()
    }

    /// The TLS acceptor of the virtual host listening on this connection's port, if any.
    pub fn listener_tls(&self) -> Option<Arc<dyn crate::tls::TlsAcceptor>> {
        let registry = &self.core.registry;
        registry.listener_for_port(self.core.port).and_then(|id| registry.get(id).tls().cloned())
    }

    /// Ends the negotiating phase with whatever the handshake learned.
    ///
    /// The SNI name binds a virtual host early; ALPN `h2` selects HTTP/2 and a virtual host with
    /// a raw protocol goes straight to the raw role. Otherwise the first bytes decide between
    /// HTTP/1 and prior knowledge HTTP/2.
    pub fn negotiated(&mut self, server_name: Option<&str>, alpn: Option<&[u8]>) {
        if self.state == ConnState::Accepted {
            self.state = ConnState::Negotiating;
        }
        if self.state != ConnState::Negotiating {
            return;
        }

        if let Some(name) = server_name {
            if let Some(id) = self.core.registry.match_host(self.core.port, Some(name)) {
                self.core.bind(id);
            }
        }

        let candidate = self.vhost_id().or_else(|| self.core.registry.listener_for_port(self.core.port));
        if let Some(id) = candidate {
            if let Some(handler) = self.core.registry.get(id).raw_protocol().cloned() {
                self.core.bind(id);
                self.enter(Role::Raw(Raw::new(handler)));
                return;
            }
        }

        if alpn == Some(b"h2".as_slice()) {
            self.core.count(Counter::H2Alpn);
            self.enter(Role::Http2(Box::new(Http2::new(self.core.limits))));
        }
    }

    fn enter(&mut self, role: Role) {
        let kind = role.kind();
        trace!(conn = %self.core.id, role = ?kind, "role entered");
        self.role = Some(role);
        self.state = ConnState::Active(kind);
    }

    /// Picks HTTP/1 or prior knowledge HTTP/2 from the first bytes.
    fn sniff(&self) -> Option<Role> {
        let buf = &self.core.read_buf;
        let n = buf.len().min(PREFACE.len());
        if buf[..n] != PREFACE[..n] {
            return Some(Role::Http1(Http1::new()));
        }
        if n == PREFACE.len() {
            return Some(Role::Http2(Box::new(Http2::new(self.core.limits))));
        }
        if self.core.eof && n > 0 { Some(Role::Http1(Http1::new())) } else { None }
    }

    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.core.read_buf
    }

    /// Accounts `bytes` just appended to the read buffer.
    pub fn record_rx(&mut self, bytes: usize) {
        self.core.record_rx(bytes as u64);
    }

    /// Accounts `bytes` written to the peer.
    pub fn record_tx(&mut self, bytes: usize) {
        self.core.record_tx(bytes as u64);
    }

    /// The peer closed its sending side.
    pub fn set_eof(&mut self) {
        self.core.eof = true;
    }

    pub fn has_output(&self) -> bool {
        !self.core.write_buf.is_empty()
    }

    pub fn take_output(&mut self) -> BytesMut {
        self.core.write_buf.split()
    }

    pub fn grant_lease(&mut self, lease: Lease) {
        debug_assert_eq!(lease.conn(), self.core.id);
        self.core.lease = Some(lease);
    }

    /// Drives the state machine until it needs something from the driver.
    pub fn step(&mut self) -> Step {
        loop {
            match self.state {
                ConnState::Accepted => self.state = ConnState::Negotiating,
                ConnState::Closing | ConnState::Closed => return Step::Close,
                ConnState::Negotiating | ConnState::Active(_) => {}
            }
            if self.core.shutdown {
                return Step::Close;
            }

            let Some(mut role) = self.role.take() else {
                match self.sniff() {
                    Some(role) => {
                        self.enter(role);
                        continue;
                    }
                    None if self.core.eof => return Step::Close,
                    None => return Step::Read,
                }
            };

            let result = role.step(&mut self.core);
            match result {
                Ok(RoleStep::Switch(next)) => {
                    debug!(conn = %self.core.id, from = ?role.kind(), to = ?next.kind(), "switching protocol role");
                    self.enter(next);
                }
                Ok(step) => {
                    self.role = Some(role);
                    return match step {
                        RoleStep::Read => Step::Read,
                        RoleStep::Lease => Step::Lease,
                        RoleStep::Dispatch(dispatch) => Step::Dispatch(dispatch),
                        RoleStep::Wait => Step::Wait,
                        RoleStep::Close | RoleStep::Switch(_) => Step::Close,
                    };
                }
                Err(e) => {
                    self.role = Some(role);
                    self.fail(&e);
                    return Step::Close;
                }
            }
        }
    }

    /// Feeds back the result of a [`Dispatch`].
    pub fn complete(&mut self, completion: Completion) {
        if !matches!(self.state, ConnState::Active(_)) {
            trace!(conn = %self.core.id, "completion for inactive connection dropped");
            return;
        }
        let Some(role) = self.role.as_mut() else {
            return;
        };
        if let Err(e) = role.complete(&mut self.core, completion) {
            self.fail(&e);
        }
    }

    fn fail(&mut self, e: &ConnError) {
        if e.is_socket_error() {
            debug!(conn = %self.core.id, cause = %e, "connection ended");
        } else {
            warn!(conn = %self.core.id, cause = %e, "closing connection");
        }
        self.core.lease = None;
        self.core.shutdown();
    }

    /// The deadline that applies while waiting for the peer.
    pub fn timeout_kind(&self) -> TimeoutKind {
        match (&self.state, &self.role) {
            (ConnState::Accepted | ConnState::Negotiating, _) => TimeoutKind::Handshake,
            (_, Some(role)) if role.parsing_header(&self.core) => TimeoutKind::Header,
            _ => TimeoutKind::Idle,
        }
    }

    /// Runs the close cleanup; returns false if it already ran.
    ///
    /// Releases the header pool lease, tells the role's protocol handler and unbinds from the
    /// virtual host. Output still buffered is left for the driver to flush or drop.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closing;

        self.core.lease = None;
        if let (Some(role), Some(info)) = (self.role.take(), self.core.info.as_ref()) {
            if let Some(handler) = role.handler() {
                handler.on_close(info);
            }
        }
        self.core.binding = None;
        self.state = ConnState::Closed;
        trace!(conn = %self.core.id, "connection closed");
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id)
            .field("state", &self.state)
            .field("peer", &self.core.peer)
            .field("port", &self.core.port)
            .field("vhost", &self.core.vhost().map(Vhost::name))
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests;
