//! Virtual hosts.
//!
//! The [`VhostRegistry`] keeps every virtual host in registration order and is shared
//! read-only by all service threads. Connections refer to their virtual host through a
//! [`VhostBinding`], which also maintains the host's live connection gauge.

mod mount;

pub use mount::{CachePolicy, Mount, MountTable, Origin};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crate::config::VhostConfig;
use crate::error::ContextError;
use crate::handler::ProtocolHandler;
use crate::stats::{ConnStats, ConnStatsSnapshot};
use crate::tls::TlsAcceptor;
use crate::utils::normalize_host;

/// Index of a virtual host in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VhostId(usize);

impl VhostId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub struct Vhost {
    name: String,
    aliases: Vec<String>,
    port: u16,
    bound_port: AtomicU16,
    default_for_port: bool,
    sts: bool,
    tls: Option<Arc<dyn TlsAcceptor>>,
    mounts: MountTable,
    protocols: Vec<Arc<dyn ProtocolHandler>>,
    raw_protocol: Option<Arc<dyn ProtocolHandler>>,
    stats: ConnStats,
    live: AtomicUsize,
}

impl Vhost {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Configured listening port; `0` asks for an ephemeral one.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port actually bound, `0` until the context has bound it.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bound_port(&self, port: u16) {
        self.bound_port.store(port, Ordering::Relaxed);
    }

    pub fn is_default_for_port(&self) -> bool {
        self.default_for_port
    }

    pub fn sts(&self) -> bool {
        self.sts
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsAcceptor>> {
        self.tls.as_ref()
    }

    pub fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn protocols(&self) -> &[Arc<dyn ProtocolHandler>] {
        &self.protocols
    }

    pub fn protocol(&self, name: &str) -> Option<&Arc<dyn ProtocolHandler>> {
        self.protocols.iter().find(|handler| handler.name() == name)
    }

    pub fn raw_protocol(&self) -> Option<&Arc<dyn ProtocolHandler>> {
        self.raw_protocol.as_ref()
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    /// Connections currently bound to this virtual host.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Exact name or alias match, or a `*.suffix` wildcard; case-insensitive, port ignored.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        std::iter::once(&self.name).chain(self.aliases.iter()).any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix('*') {
                Some(suffix) if suffix.starts_with('.') => host.len() > suffix.len() && host.ends_with(suffix),
                _ => pattern == host,
            }
        })
    }
}

impl fmt::Debug for Vhost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vhost")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("aliases", &self.aliases)
            .field("tls", &self.tls.is_some())
            .field("mounts", &self.mounts.len())
            .field("protocols", &self.protocols.iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Collects everything a virtual host needs before it joins the registry.
pub struct VhostBuilder {
    name: String,
    port: u16,
    aliases: Vec<String>,
    default_for_port: bool,
    sts: bool,
    tls: Option<Arc<dyn TlsAcceptor>>,
    mounts: Vec<Mount>,
    protocols: Vec<Arc<dyn ProtocolHandler>>,
    raw_protocol: Option<Arc<dyn ProtocolHandler>>,
}

impl VhostBuilder {
    pub fn new<S: Into<String>>(name: S, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            aliases: Vec::new(),
            default_for_port: false,
            sts: false,
            tls: None,
            mounts: Vec::new(),
            protocols: Vec::new(),
            raw_protocol: None,
        }
    }

    pub fn from_config(config: &VhostConfig) -> Result<Self, ContextError> {
        let mut builder = Self::new(config.name.clone(), config.port).default_for_port(config.default_for_port).sts(config.sts);
        builder.aliases = config.aliases.clone();
        for mount in &config.mounts {
            builder.mounts.push(Mount::from_config(mount)?);
        }
        Ok(builder)
    }

    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn default_for_port(mut self, default_for_port: bool) -> Self {
        self.default_for_port = default_for_port;
        self
    }

    pub fn sts(mut self, sts: bool) -> Self {
        self.sts = sts;
        self
    }

    pub fn tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn protocol(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.protocols.push(handler);
        self
    }

    /// Every connection on this virtual host skips HTTP and goes to `handler` as raw bytes.
    pub fn raw(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.raw_protocol = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn build(self) -> Result<Vhost, ContextError> {
        if self.name.is_empty() {
            return Err(ContextError::config("virtual host name must not be empty"));
        }
        for mount in &self.mounts {
            if let Origin::Callback(name) = mount.origin() {
                if !self.protocols.iter().any(|handler| handler.name() == name) {
                    return Err(ContextError::config(format!(
                        "vhost {} mounts {} on unknown protocol {name}",
                        self.name,
                        mount.mountpoint()
                    )));
                }
            }
        }

        Ok(Vhost {
            name: self.name,
            aliases: self.aliases,
            port: self.port,
            bound_port: AtomicU16::new(0),
            default_for_port: self.default_for_port,
            sts: self.sts,
            tls: self.tls,
            mounts: MountTable::new(self.mounts),
            protocols: self.protocols,
            raw_protocol: self.raw_protocol,
            stats: ConnStats::new(),
            live: AtomicUsize::new(0),
        })
    }
}

impl fmt::Debug for VhostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VhostBuilder").field("name", &self.name).field("port", &self.port).finish_non_exhaustive()
    }
}

/// All virtual hosts of a context, in registration order.
#[derive(Debug)]
pub struct VhostRegistry {
    vhosts: Vec<Vhost>,
}

impl VhostRegistry {
    pub fn from_builders(builders: Vec<VhostBuilder>) -> Result<Self, ContextError> {
        let mut vhosts: Vec<Vhost> = Vec::with_capacity(builders.len());
        for builder in builders {
            let vhost = builder.build()?;
            if vhosts.iter().any(|existing| existing.name == vhost.name && existing.port == vhost.port) {
                return Err(ContextError::config(format!("duplicate vhost {} on port {}", vhost.name, vhost.port)));
            }
            if vhost.default_for_port && vhosts.iter().any(|existing| existing.port == vhost.port && existing.default_for_port) {
                return Err(ContextError::config(format!("port {} has more than one default vhost", vhost.port)));
            }
            vhosts.push(vhost);
        }
        Ok(Self { vhosts })
    }

    pub fn get(&self, id: VhostId) -> &Vhost {
        &self.vhosts[id.0]
    }

    pub fn len(&self) -> usize {
        self.vhosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vhosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VhostId, &Vhost)> {
        self.vhosts.iter().enumerate().map(|(index, vhost)| (VhostId(index), vhost))
    }

    pub fn by_name(&self, name: &str) -> Option<VhostId> {
        self.iter().find(|(_, vhost)| vhost.name == name).map(|(id, _)| id)
    }

    /// Distinct configured ports, in order of first registration.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for vhost in &self.vhosts {
            if !ports.contains(&vhost.port) {
                ports.push(vhost.port);
            }
        }
        ports
    }

    /// The virtual host owning the listening socket of `port`: the first one registered on it.
    pub fn listener_for_port(&self, port: u16) -> Option<VhostId> {
        self.iter().find(|(_, vhost)| vhost.port == port).map(|(id, _)| id)
    }

    /// Picks the virtual host for a connection on `port` addressed to `host`.
    ///
    /// First name or alias match among the port's virtual hosts, then the port's default.
    pub fn match_host(&self, port: u16, host: Option<&str>) -> Option<VhostId> {
        let on_port = || self.iter().filter(move |(_, vhost)| vhost.port == port);

        if let Some(host) = host.filter(|host| !host.is_empty()) {
            if let Some((id, _)) = on_port().find(|(_, vhost)| vhost.matches_host(host)) {
                return Some(id);
            }
        }
        on_port().find(|(_, vhost)| vhost.default_for_port).map(|(id, _)| id)
    }

    /// Sum of every virtual host's counters; the context keeps no counters of its own.
    pub fn totals(&self) -> ConnStatsSnapshot {
        self.vhosts.iter().map(|vhost| vhost.stats.snapshot()).sum()
    }

    /// Live connections over all virtual hosts.
    pub fn live(&self) -> usize {
        self.vhosts.iter().map(Vhost::live).sum()
    }

    pub fn bind(self: &Arc<Self>, id: VhostId) -> VhostBinding {
        self.get(id).live.fetch_add(1, Ordering::AcqRel);
        VhostBinding { registry: Arc::clone(self), id }
    }
}

/// A connection's handle on its virtual host; releases the live gauge on drop.
pub struct VhostBinding {
    registry: Arc<VhostRegistry>,
    id: VhostId,
}

impl VhostBinding {
    pub fn id(&self) -> VhostId {
        self.id
    }

    pub fn vhost(&self) -> &Vhost {
        self.registry.get(self.id)
    }

    pub fn stats(&self) -> &ConnStats {
        &self.vhost().stats
    }
}

impl fmt::Debug for VhostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VhostBinding").field(&self.vhost().name).finish()
    }
}

impl Drop for VhostBinding {
    fn drop(&mut self) {
        let previous = self.vhost().live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "live connection gauge of {} underflow", self.vhost().name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Counter;

    fn registry() -> Arc<VhostRegistry> {
        Arc::new(
            VhostRegistry::from_builders(vec![
                VhostBuilder::new("example", 8080).alias("www.example.com"),
                VhostBuilder::new("wild", 8080).alias("*.apps.local"),
                VhostBuilder::new("fallback", 8080).default_for_port(true),
                VhostBuilder::new("admin", 8081),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn host_matching_order() {
        let registry = registry();
        let name = |id: Option<VhostId>| id.map(|id| registry.get(id).name().to_string());

        assert_eq!(name(registry.match_host(8080, Some("WWW.example.com:8080"))), Some("example".into()));
        assert_eq!(name(registry.match_host(8080, Some("shop.apps.local"))), Some("wild".into()));
        assert_eq!(name(registry.match_host(8080, Some("apps.local"))), Some("fallback".into()));
        assert_eq!(name(registry.match_host(8080, None)), Some("fallback".into()));
        assert_eq!(name(registry.match_host(8081, Some("admin"))), Some("admin".into()));
        // admin is not a default, and not reachable from 8080
        assert_eq!(registry.match_host(8081, Some("example")), None);
    }

    #[test]
    fn listener_is_first_on_port() {
        let registry = registry();
        assert_eq!(registry.listener_for_port(8080), Some(VhostId(0)));
        assert_eq!(registry.listener_for_port(8081), Some(VhostId(3)));
        assert_eq!(registry.listener_for_port(9999), None);
        assert_eq!(registry.ports(), vec![8080, 8081]);
    }

    #[test]
    fn totals_follow_vhost_counters() {
        let registry = registry();
        registry.get(VhostId(0)).stats().add(Counter::H1Trans, 5);
        registry.get(VhostId(3)).stats().add(Counter::H1Trans, 2);
        assert_eq!(registry.totals().h1_trans, 7);
    }

    #[test]
    fn binding_tracks_live_connections() {
        let registry = registry();
        let first = registry.bind(VhostId(1));
        let second = registry.bind(VhostId(1));
        assert_eq!(registry.get(VhostId(1)).live(), 2);
        drop(first);
        assert_eq!(registry.get(VhostId(1)).live(), 1);
        drop(second);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn two_defaults_on_one_port_are_rejected() {
        let result = VhostRegistry::from_builders(vec![
            VhostBuilder::new("a", 80).default_for_port(true),
            VhostBuilder::new("b", 80).default_for_port(true),
        ]);
        assert!(matches!(result, Err(ContextError::Config { .. })));
    }

    #[test]
    fn callback_mount_needs_its_protocol() {
        let result = VhostRegistry::from_builders(vec![
            VhostBuilder::new("a", 80).mount(Mount::parse("/api", "callback://api").unwrap()),
        ]);
        assert!(result.is_err());
    }
}
