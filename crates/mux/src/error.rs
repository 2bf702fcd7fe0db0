//! Connection and context level errors.
//!
//! [`ConnError`] never leaves a connection task: it is logged and drives the connection to
//! closing. [`ContextError`] is what the embedding application sees from
//! [`Context::build`](crate::ContextBuilder::build) and [`Context::destroy`](crate::Context::destroy).

use std::io;

use thiserror::Error;

use crate::protocol::{ParseError, SendError};

/// Why a single connection stopped making progress.
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("{resource} exhausted")]
    ResourceExhausted { resource: &'static str },

    #[error("no virtual host matches host {host:?} on port {port}")]
    NoMatchingVhost { host: Option<String>, port: u16 },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("upgrade to {protocol} rejected")]
    UpgradeRejected { protocol: String },

    #[error("{phase} timeout")]
    Timeout { phase: &'static str },
}

impl ConnError {
    pub fn protocol_violation<S: ToString>(str: S) -> Self {
        Self::ProtocolViolation { reason: str.to_string() }
    }

    pub fn no_matching_vhost(host: Option<&str>, port: u16) -> Self {
        Self::NoMatchingVhost { host: host.map(str::to_string), port }
    }

    pub fn upgrade_rejected<S: ToString>(protocol: S) -> Self {
        Self::UpgradeRejected { protocol: protocol.to_string() }
    }

    pub fn resource_exhausted(resource: &'static str) -> Self {
        Self::ResourceExhausted { resource }
    }

    pub fn timeout(phase: &'static str) -> Self {
        Self::Timeout { phase }
    }

    /// Socket level failures that say nothing about the peer's protocol behavior.
    pub fn is_socket_error(&self) -> bool {
        matches!(self, ConnError::PeerClosed | ConnError::Io { .. })
    }
}

impl From<ParseError> for ConnError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Io { source } => ConnError::Io { source },
            e => ConnError::protocol_violation(e),
        }
    }
}

impl From<SendError> for ConnError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Io { source } => ConnError::Io { source },
            e => ConnError::protocol_violation(e),
        }
    }
}

/// Failures of the process-wide context lifecycle.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("failed to start runtime: {source}")]
    Runtime {
        #[from]
        source: io::Error,
    },

    #[error("{count} connections still alive after teardown")]
    LeakedConnections { count: usize },

    #[error("thread {name} panicked")]
    ThreadPanicked { name: String },
}

impl ContextError {
    pub fn config<S: ToString>(str: S) -> Self {
        Self::Config { reason: str.to_string() }
    }

    pub fn bind(port: u16, source: io::Error) -> Self {
        Self::Bind { port, source }
    }
}
