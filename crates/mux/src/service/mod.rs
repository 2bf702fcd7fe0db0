//! Service threads.
//!
//! Each service thread runs a current-thread tokio runtime with a `LocalSet`; every connection
//! it owns is a `spawn_local` task, so a connection never moves between threads. The thread
//! owns a [`HeaderPool`] and a connection table, and a housekeeping task sweeps the table for
//! expired handshake, header and idle deadlines.
//!
//! Sockets arrive from the acceptor thread ([`accept`]) over an unbounded channel.

pub(crate) mod accept;
mod cgi;
mod dispatch;
mod driver;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ContextConfig, Timeouts};
use crate::connection::{ConnId, TimeoutKind};
use crate::error::ConnError;
use crate::pool::HeaderPool;
use crate::stats::{Counter, ThreadGauges};
use crate::vhost::VhostRegistry;

/// How long a stopping thread waits for its connections to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A socket handed from the acceptor to a service thread.
#[derive(Debug)]
pub(crate) struct Incoming {
    pub(crate) stream: std::net::TcpStream,
    pub(crate) peer: SocketAddr,
    /// Configured port of the listener it came from.
    pub(crate) port: u16,
}

/// Everything a service thread shares with the context.
#[derive(Clone)]
pub(crate) struct ThreadEnv {
    pub(crate) index: usize,
    pub(crate) config: Arc<ContextConfig>,
    pub(crate) registry: Arc<VhostRegistry>,
    pub(crate) gauges: Arc<ThreadGauges>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) next_id: Arc<AtomicU64>,
    pub(crate) cgi_spawned: Arc<AtomicU64>,
}

/// Table entry of one live connection: its deadline and the token that aborts it.
#[derive(Debug)]
pub(crate) struct ConnSlot {
    deadline: Cell<Option<(Instant, TimeoutKind)>>,
    expired: Cell<Option<TimeoutKind>>,
    abort: CancellationToken,
}

impl ConnSlot {
    fn new(abort: CancellationToken) -> Self {
        Self { deadline: Cell::new(None), expired: Cell::new(None), abort }
    }

    /// Starts the deadline for `kind` unless that kind is already running.
    pub(crate) fn arm(&self, kind: TimeoutKind, timeouts: &Timeouts) {
        if matches!(self.deadline.get(), Some((_, current)) if current == kind) {
            return;
        }
        let after = match kind {
            TimeoutKind::Handshake => timeouts.handshake,
            TimeoutKind::Header => timeouts.header,
            TimeoutKind::Idle => timeouts.idle,
        };
        self.deadline.set(Some((Instant::now() + after, kind)));
    }

    /// Drops the running deadline; the next `arm` starts a fresh one.
    pub(crate) fn disarm(&self) {
        self.deadline.set(None);
    }

    /// Bytes arrived: an idle deadline starts over, handshake and header deadlines keep running.
    pub(crate) fn traffic(&self) {
        if matches!(self.deadline.get(), Some((_, TimeoutKind::Idle))) {
            self.disarm();
        }
    }

    fn expire_if_due(&self, now: Instant) -> bool {
        match self.deadline.get() {
            Some((at, kind)) if at <= now => {
                self.expired.set(Some(kind));
                self.abort.cancel();
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    /// Why the connection was aborted.
    pub(crate) fn abort_reason(&self) -> ConnError {
        match self.expired.get() {
            Some(TimeoutKind::Handshake) => ConnError::timeout("handshake"),
            Some(TimeoutKind::Header) => ConnError::timeout("header"),
            Some(TimeoutKind::Idle) => ConnError::timeout("idle"),
            None => ConnError::from(io::Error::new(io::ErrorKind::ConnectionAborted, "service thread shutting down")),
        }
    }
}

/// Per thread state shared by the connection tasks.
pub(crate) struct Shared {
    pub(crate) env: ThreadEnv,
    pub(crate) pool: HeaderPool,
    conns: RefCell<HashMap<ConnId, Rc<ConnSlot>>>,
    cgi_alive: Cell<usize>,
}

impl Shared {
    fn new(env: ThreadEnv) -> Self {
        let config = &env.config;
        let pool = HeaderPool::with_gauges(config.header_pool_size, config.header_slot_bytes, Some(Arc::clone(&env.gauges)));
        Self { env, pool, conns: RefCell::new(HashMap::new()), cgi_alive: Cell::new(0) }
    }

    fn register(&self, id: ConnId) -> Rc<ConnSlot> {
        let slot = Rc::new(ConnSlot::new(self.env.shutdown.child_token()));
        let mut conns = self.conns.borrow_mut();
        conns.insert(id, Rc::clone(&slot));
        ThreadGauges::set(&self.env.gauges.fds, conns.len());
        slot
    }

    fn unregister(&self, id: ConnId) {
        let mut conns = self.conns.borrow_mut();
        conns.remove(&id);
        ThreadGauges::set(&self.env.gauges.fds, conns.len());
    }

    fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    /// Aborts every connection whose deadline has passed; returns how many.
    fn sweep(&self, now: Instant) -> usize {
        self.conns.borrow().values().filter(|slot| slot.expire_if_due(now)).count()
    }

    pub(crate) fn cgi_started(&self) {
        self.env.cgi_spawned.fetch_add(1, Ordering::Relaxed);
        self.cgi_alive.set(self.cgi_alive.get() + 1);
        ThreadGauges::set(&self.env.gauges.cgi_alive, self.cgi_alive.get());
    }

    pub(crate) fn cgi_finished(&self) {
        self.cgi_alive.set(self.cgi_alive.get().saturating_sub(1));
        ThreadGauges::set(&self.env.gauges.cgi_alive, self.cgi_alive.get());
    }
}

/// Starts service thread `env.index`, consuming sockets from `incoming`.
pub(crate) fn spawn(env: ThreadEnv, incoming: UnboundedReceiver<Incoming>) -> io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    std::thread::Builder::new().name(thread_name(env.index)).spawn(move || {
        let local = LocalSet::new();
        local.block_on(&runtime, serve(env, incoming));
    })
}

pub(crate) fn thread_name(index: usize) -> String {
    format!("mux-service-{index}")
}

async fn serve(env: ThreadEnv, mut incoming: UnboundedReceiver<Incoming>) {
    let index = env.index;
    let shared = Rc::new(Shared::new(env));
    info!(thread = index, "service thread started");

    let housekeeping = tokio::task::spawn_local(housekeeping(Rc::clone(&shared)));

    loop {
        tokio::select! {
            biased;
            _ = shared.env.shutdown.cancelled() => break,
            next = incoming.recv() => match next {
                Some(socket) => accept(&shared, socket),
                None => break,
            },
        }
    }

    incoming.close();
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while shared.connection_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    housekeeping.abort();

    let left = shared.connection_count();
    if left > 0 {
        warn!(thread = index, left, "service thread stopped with connections alive");
    }
    info!(thread = index, "service thread stopped");
}

fn accept(shared: &Rc<Shared>, socket: Incoming) {
    let env = &shared.env;
    if shared.connection_count() >= env.config.max_connections_per_thread {
        let cause = ConnError::resource_exhausted("connection table");
        warn!(thread = env.index, peer = %socket.peer, port = socket.port, %cause, "rejecting connection");
        if let Some(listener) = env.registry.listener_for_port(socket.port) {
            env.registry.get(listener).stats().incr(Counter::Rejected);
        }
        return;
    }

    let id = ConnId::new(env.next_id.fetch_add(1, Ordering::Relaxed));
    let slot = shared.register(id);
    trace!(thread = env.index, conn = %id, peer = %socket.peer, port = socket.port, "connection accepted");

    let shared = Rc::clone(shared);
    tokio::task::spawn_local(async move {
        driver::run(&shared, id, socket, &slot).await;
        shared.pool.cancel(id);
        shared.unregister(id);
    });
}

async fn housekeeping(shared: Rc<Shared>) {
    let mut interval = tokio::time::interval(shared.env.config.housekeeping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let expired = shared.sweep(Instant::now());
        if expired > 0 {
            debug!(thread = shared.env.index, expired, "closed connections past their deadline");
        }
    }
}
