//! Point-in-time view of a running context for diagnostics.
//!
//! Everything is copied out of the live atomics while the context keeps serving; the values of
//! different counters are not taken at exactly the same instant.

use serde::Serialize;

use crate::stats::{ConnStatsSnapshot, ThreadSnapshot};
use crate::vhost::{Mount, Vhost, VhostId, VhostRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub version: &'static str,
    /// Seconds since the context was built.
    pub uptime_secs: u64,
    /// Connection table capacity of each service thread.
    pub max_connections_per_thread: usize,
    /// Header pool slots of each service thread.
    pub header_pool_size: usize,
    pub threads: Vec<ThreadSnapshot>,
    pub vhosts: Vec<VhostSnapshot>,
    /// Sum over `vhosts`.
    pub totals: ConnStatsSnapshot,
    /// Virtual hosts owning a listening socket.
    pub listening_vhosts: usize,
    pub live_connections: usize,
    pub cgi_alive: usize,
    pub cgi_spawned: u64,
    /// 1, 5 and 15 minute system load averages, where the platform exposes them.
    pub load_average: Option<[f64; 3]>,
}

pub(crate) fn load_average() -> Option<[f64; 3]> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_load_average(&text)
}

fn parse_load_average(text: &str) -> Option<[f64; 3]> {
    let mut fields = text.split_whitespace().map(str::parse::<f64>);
    Some([fields.next()?.ok()?, fields.next()?.ok()?, fields.next()?.ok()?])
}

#[derive(Debug, Clone, Serialize)]
pub struct VhostSnapshot {
    pub name: String,
    pub port: u16,
    pub bound_port: u16,
    pub tls: bool,
    pub sts: bool,
    pub listening: bool,
    pub live: usize,
    pub stats: ConnStatsSnapshot,
    pub mounts: Vec<MountSnapshot>,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MountSnapshot {
    pub mountpoint: String,
    pub origin: String,
    pub cache_max_age: u32,
    pub cache_reuse: bool,
    pub cache_revalidate: bool,
    pub cache_intermediaries: bool,
    pub default_document: Option<String>,
}

impl From<&Mount> for MountSnapshot {
    fn from(mount: &Mount) -> Self {
        let cache = mount.cache();
        Self {
            mountpoint: mount.mountpoint().to_string(),
            origin: mount.origin().to_string(),
            cache_max_age: cache.max_age,
            cache_reuse: cache.reusable,
            cache_revalidate: cache.revalidate,
            cache_intermediaries: cache.intermediaries,
            default_document: mount.default_document().map(str::to_string),
        }
    }
}

impl VhostSnapshot {
    pub(crate) fn new(registry: &VhostRegistry, id: VhostId, vhost: &Vhost) -> Self {
        Self {
            name: vhost.name().to_string(),
            port: vhost.port(),
            bound_port: vhost.bound_port(),
            tls: vhost.has_tls(),
            sts: vhost.sts(),
            listening: registry.listener_for_port(vhost.port()) == Some(id),
            live: vhost.live(),
            stats: vhost.stats().snapshot(),
            mounts: vhost.mounts().iter().map(MountSnapshot::from).collect(),
            protocols: vhost.protocols().iter().map(|handler| handler.name().to_string()).collect(),
        }
    }
}

impl ContextSnapshot {
    pub fn vhost(&self, name: &str) -> Option<&VhostSnapshot> {
        self.vhosts.iter().find(|vhost| vhost.name == name)
    }
}
