//! The process-wide server context.
//!
//! A [`Context`] owns the virtual host registry, the listening sockets, one acceptor thread and
//! the fixed set of service threads. It is built explicitly with [`Context::builder`] and torn
//! down explicitly with [`Context::destroy`], which joins every thread and verifies that no
//! connection outlived it.
//!
//! ```no_run
//! use micro_mux::{Context, ContextConfig, Mount, VhostBuilder};
//!
//! let context = Context::builder(ContextConfig::default())
//!     .vhost(VhostBuilder::new("localhost", 7681).default_for_port(true).mount(Mount::parse("/", "file:///srv/www").unwrap()))
//!     .build()
//!     .unwrap();
//! println!("{:?}", context.snapshot().totals);
//! context.destroy().unwrap();
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ContextConfig, VhostConfig};
use crate::error::ContextError;
use crate::service::{self, ThreadEnv, accept};
use crate::snapshot::{self, ContextSnapshot, VhostSnapshot};
use crate::stats::{ConnStatsSnapshot, ThreadGauges};
use crate::vhost::{VhostBuilder, VhostRegistry};

/// State readable from any thread while the context runs.
struct Shared {
    config: Arc<ContextConfig>,
    registry: Arc<VhostRegistry>,
    gauges: Vec<Arc<ThreadGauges>>,
    started: Instant,
    cgi_spawned: Arc<AtomicU64>,
}

impl Shared {
    fn snapshot(&self) -> ContextSnapshot {
        let registry = &self.registry;
        let threads: Vec<_> = self.gauges.iter().map(|gauges| gauges.snapshot()).collect();
        let vhosts: Vec<_> = registry.iter().map(|(id, vhost)| VhostSnapshot::new(registry, id, vhost)).collect();

        ContextSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            max_connections_per_thread: self.config.max_connections_per_thread,
            header_pool_size: self.config.header_pool_size,
            cgi_alive: threads.iter().map(|thread| thread.cgi_alive).sum(),
            cgi_spawned: self.cgi_spawned.load(Ordering::Relaxed),
            totals: vhosts.iter().map(|vhost| vhost.stats).sum(),
            listening_vhosts: vhosts.iter().filter(|vhost| vhost.listening).count(),
            live_connections: registry.live(),
            load_average: snapshot::load_average(),
            threads,
            vhosts,
        }
    }
}

/// Late bound access to a context's snapshot.
///
/// Handlers are registered before the context exists; a handle taken from the
/// [`ContextBuilder`] starts answering once [`ContextBuilder::build`] succeeds and stops again
/// when the context is gone.
#[derive(Clone, Default)]
pub struct ContextHandle(Arc<OnceLock<Weak<Shared>>>);

impl ContextHandle {
    pub fn snapshot(&self) -> Option<ContextSnapshot> {
        self.0.get().and_then(Weak::upgrade).map(|shared| shared.snapshot())
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle").field("attached", &self.0.get().is_some()).finish()
    }
}

#[derive(Debug)]
pub struct ContextBuilder {
    config: ContextConfig,
    vhosts: Vec<VhostBuilder>,
    handle: ContextHandle,
}

impl ContextBuilder {
    pub fn vhost(mut self, vhost: VhostBuilder) -> Self {
        self.vhosts.push(vhost);
        self
    }

    /// Adds a virtual host described by configuration; handlers can't be attached this way.
    pub fn vhost_config(self, config: &VhostConfig) -> Result<Self, ContextError> {
        Ok(self.vhost(VhostBuilder::from_config(config)?))
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Binds every port, then starts the service threads and the acceptor.
    pub fn build(self) -> Result<Context, ContextError> {
        let config = self.config;
        config.validate()?;
        if self.vhosts.is_empty() {
            return Err(ContextError::config("at least one virtual host is required"));
        }
        let registry = Arc::new(VhostRegistry::from_builders(self.vhosts)?);

        let mut listeners = Vec::new();
        let mut bound = Vec::new();
        for port in registry.ports() {
            let listener = TcpListener::bind((config.bind_address, port)).map_err(|e| ContextError::bind(port, e))?;
            let local = listener.local_addr().map_err(|e| ContextError::bind(port, e))?;
            for (_, vhost) in registry.iter().filter(|(_, vhost)| vhost.port() == port) {
                vhost.set_bound_port(local.port());
            }
            info!(port, %local, "listening");
            bound.push((port, local));
            listeners.push((port, listener));
        }

        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let next_id = Arc::new(AtomicU64::new(1));
        let cgi_spawned = Arc::new(AtomicU64::new(0));
        let mut threads = Vec::with_capacity(config.threads);
        let mut routes = Vec::with_capacity(config.threads);
        let mut gauges = Vec::with_capacity(config.threads);

        for index in 0..config.threads {
            let (tx, rx) = unbounded_channel();
            let thread_gauges = Arc::new(ThreadGauges::default());
            let env = ThreadEnv {
                index,
                config: Arc::clone(&config),
                registry: Arc::clone(&registry),
                gauges: Arc::clone(&thread_gauges),
                shutdown: shutdown.clone(),
                next_id: Arc::clone(&next_id),
                cgi_spawned: Arc::clone(&cgi_spawned),
            };
            threads.push(service::spawn(env, rx)?);
            routes.push((tx, Arc::clone(&thread_gauges)));
            gauges.push(thread_gauges);
        }
        let distributor = accept::Distributor::new(config.distribution, routes);
        let acceptor = accept::spawn(listeners, distributor, shutdown.clone())?;

        let shared = Arc::new(Shared { config, registry, gauges, started: Instant::now(), cgi_spawned });
        if self.handle.0.set(Arc::downgrade(&shared)).is_err() {
            warn!("context handle was already attached to another context");
        }
        info!(threads = threads.len(), vhosts = shared.registry.len(), "context started");

        Ok(Context { shared, shutdown, threads, acceptor: Some(acceptor), bound, stopped: false })
    }
}

/// A running server.
pub struct Context {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    threads: Vec<JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
    bound: Vec<(u16, SocketAddr)>,
    stopped: bool,
}

impl Context {
    pub fn builder(config: ContextConfig) -> ContextBuilder {
        ContextBuilder { config, vhosts: Vec::new(), handle: ContextHandle::default() }
    }

    /// Address actually bound for a configured port; resolves ephemeral `0` ports.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.bound.iter().find(|(configured, _)| *configured == port).map(|(_, local)| *local)
    }

    pub fn registry(&self) -> &VhostRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Counters summed over every virtual host.
    pub fn totals(&self) -> ConnStatsSnapshot {
        self.shared.registry.totals()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.shared.snapshot()
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle(Arc::new(OnceLock::from(Arc::downgrade(&self.shared))))
    }

    /// Stops accepting, force-closes every connection and joins all threads.
    ///
    /// Fails when a thread panicked or a connection is still counted live afterwards.
    pub fn destroy(mut self) -> Result<(), ContextError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), ContextError> {
        if std::mem::replace(&mut self.stopped, true) {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut panicked = None;
        for handle in self.acceptor.take().into_iter().chain(self.threads.drain(..)) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "thread panicked");
                panicked.get_or_insert(name);
            }
        }
        if let Some(name) = panicked {
            return Err(ContextError::ThreadPanicked { name });
        }

        let count = self.shared.registry.live();
        if count > 0 {
            return Err(ContextError::LeakedConnections { count });
        }
        info!("context stopped");
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!(cause = %e, "context teardown failed");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("bound", &self.bound).field("threads", &self.threads.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn config() -> ContextConfig {
        ContextConfig { bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST), threads: 2, ..ContextConfig::default() }
    }

    #[test]
    fn build_requires_a_vhost() {
        let e = Context::builder(config()).build().unwrap_err();
        assert!(matches!(e, ContextError::Config { .. }));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ContextConfig { threads: 0, ..config() };
        let e = Context::builder(config).vhost(VhostBuilder::new("example", 0)).build().unwrap_err();
        assert!(matches!(e, ContextError::Config { .. }));
    }

    #[test]
    fn ephemeral_ports_are_resolved() {
        let context = Context::builder(config()).vhost(VhostBuilder::new("example", 0)).vhost(VhostBuilder::new("other", 0)).build().unwrap();
        let local = context.local_addr(0).unwrap();
        assert_ne!(local.port(), 0);

        let snapshot = context.snapshot();
        assert_eq!(snapshot.threads.len(), 2);
        assert_eq!(snapshot.listening_vhosts, 1);
        assert!(snapshot.vhosts.iter().all(|vhost| vhost.bound_port == local.port()));
        context.destroy().unwrap();
    }

    #[test]
    fn handle_follows_context_lifetime() {
        let builder = Context::builder(config()).vhost(VhostBuilder::new("example", 0));
        let handle = builder.handle();
        assert!(handle.snapshot().is_none());

        let context = builder.build().unwrap();
        assert_eq!(handle.snapshot().unwrap().vhosts[0].name, "example");

        context.destroy().unwrap();
        assert!(handle.snapshot().is_none());
    }
}
