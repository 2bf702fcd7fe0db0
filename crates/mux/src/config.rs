//! Context and virtual host configuration.
//!
//! Everything here derives `serde::Deserialize` with defaults so a host application can load
//! it from whatever format it likes. Values that can't be deserialized (protocol handlers, TLS
//! acceptors) are attached afterwards through [`VhostBuilder`](crate::vhost::VhostBuilder).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ContextError;

/// How the acceptor picks a service thread for a new socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    #[default]
    RoundRobin,
    LeastLoaded,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of service threads.
    pub threads: usize,
    /// Header pool slots per service thread.
    pub header_pool_size: usize,
    /// Size of one header pool slot, the largest request header accepted.
    pub header_slot_bytes: usize,
    pub max_connections_per_thread: usize,
    pub max_body_bytes: usize,
    pub max_ws_message_bytes: usize,
    /// Largest CGI output accepted; longer output answers 502.
    pub max_cgi_output_bytes: usize,
    pub bind_address: IpAddr,
    pub distribution: Distribution,
    pub timeouts: Timeouts,
    #[serde(deserialize_with = "millis")]
    pub housekeeping_interval: Duration,
    pub h2: Http2Config,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            header_pool_size: 32,
            header_slot_bytes: 8 * 1024,
            max_connections_per_thread: 4096,
            max_body_bytes: 1024 * 1024,
            max_ws_message_bytes: 1024 * 1024,
            max_cgi_output_bytes: 8 * 1024 * 1024,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            distribution: Distribution::RoundRobin,
            timeouts: Timeouts::default(),
            housekeeping_interval: Duration::from_secs(1),
            h2: Http2Config::default(),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.threads == 0 {
            return Err(ContextError::config("threads must be at least 1"));
        }
        if self.header_pool_size == 0 {
            return Err(ContextError::config("header_pool_size must be at least 1"));
        }
        if self.header_slot_bytes < 64 {
            return Err(ContextError::config(format!("header_slot_bytes {} is below 64", self.header_slot_bytes)));
        }
        if self.max_connections_per_thread == 0 {
            return Err(ContextError::config("max_connections_per_thread must be at least 1"));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(ContextError::config("housekeeping_interval must not be zero"));
        }
        Ok(())
    }
}

/// Deadlines enforced by the housekeeping sweep, all in milliseconds when deserialized.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// From accept until the protocol role is known (TLS handshake, preface sniffing).
    #[serde(deserialize_with = "millis")]
    pub handshake: Duration,
    /// From the first header byte until the header is complete.
    #[serde(deserialize_with = "millis")]
    pub header: Duration,
    /// Without any traffic on an established connection.
    #[serde(deserialize_with = "millis")]
    pub idle: Duration,
    /// A CGI child producing its complete output.
    #[serde(deserialize_with = "millis")]
    pub cgi: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            header: Duration::from_secs(10),
            idle: Duration::from_secs(60),
            cgi: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self { max_concurrent_streams: 100, initial_window_size: 65_535, max_frame_size: 16_384 }
    }
}

/// Declarative part of a virtual host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VhostConfig {
    pub name: String,
    pub port: u16,
    pub aliases: Vec<String>,
    pub default_for_port: bool,
    pub sts: bool,
    pub mounts: Vec<MountConfig>,
}

/// One mount, with the origin written as an lws style URL:
/// `file:///srv/www`, `cgi:///usr/lib/cgi-bin/app`, `>https://example.com/`, `callback://name`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mountpoint: String,
    pub origin: String,
    pub default_document: Option<String>,
    pub cache_max_age: u32,
    pub cache_reusable: bool,
    pub cache_revalidate: bool,
    pub cache_intermediaries: bool,
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ContextConfig = serde_json::from_str(
            r#"{ "threads": 4, "distribution": "least_loaded", "timeouts": { "idle": 1500 } }"#,
        )
        .unwrap();

        assert_eq!(config.threads, 4);
        assert_eq!(config.distribution, Distribution::LeastLoaded);
        assert_eq!(config.timeouts.idle, Duration::from_millis(1500));
        assert_eq!(config.timeouts.header, Duration::from_secs(10));
        assert_eq!(config.header_slot_bytes, 8 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let config = ContextConfig { threads: 0, ..ContextConfig::default() };
        assert!(matches!(config.validate(), Err(ContextError::Config { .. })));
    }

    #[test]
    fn vhost_with_mounts() {
        let vhost: VhostConfig = serde_json::from_str(
            r#"{
                "name": "example",
                "port": 8080,
                "aliases": ["*.example.com"],
                "mounts": [
                    { "mountpoint": "/", "origin": "file:///srv/www", "default_document": "index.html", "cache_max_age": 60, "cache_reusable": true },
                    { "mountpoint": "/api", "origin": "callback://api" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(vhost.port, 8080);
        assert_eq!(vhost.mounts.len(), 2);
        assert_eq!(vhost.mounts[0].default_document.as_deref(), Some("index.html"));
        assert!(!vhost.default_for_port);
    }
}
