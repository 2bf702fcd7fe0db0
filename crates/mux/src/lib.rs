//! An embeddable multi-protocol, multi virtual host server engine.
//!
//! `micro-mux` terminates several wire protocols over one set of listening sockets: HTTP/1.x,
//! WebSocket upgraded from HTTP/1.1, HTTP/2 (ALPN, prior knowledge or `h2c` upgrade) and raw
//! byte streams. Connections are spread over a fixed number of service threads; each thread
//! runs its own single threaded tokio runtime and never shares a connection with another.
//!
//! The host application describes virtual hosts with [`VhostBuilder`]: names and aliases, the
//! port, optional TLS, URL mounts ([`Mount`]) and [`ProtocolHandler`] callbacks. A [`Context`]
//! owns all of it from [`ContextBuilder::build`] until [`Context::destroy`].
//!
//! # Layers
//!
//! - [`codec`]: HTTP/1 header and body codecs, WebSocket and HTTP/2 frame codecs.
//! - [`pool`]: the per thread header pool leased while a request header is parsed.
//! - [`connection`]: the sans-I/O connection state machine and its protocol roles.
//! - [`vhost`]: virtual host matching and mount resolution.
//! - [`stats`]: atomic per virtual host counters and per thread gauges.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use micro_mux::handler::{BoxError, http_handler};
//! use micro_mux::{Context, ContextConfig, Mount, VhostBuilder};
//! use tracing::Level;
//! use tracing_subscriber::FmtSubscriber;
//!
//! let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//! tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//! let hello = http_handler("hello", |request: Request<Bytes>| async move {
//!     let body = format!("hello from {}", request.uri().path());
//!     Ok::<_, BoxError>(Response::new(Bytes::from(body)))
//! });
//!
//! let context = Context::builder(ContextConfig::default())
//!     .vhost(
//!         VhostBuilder::new("localhost", 8080)
//!             .default_for_port(true)
//!             .protocol(hello)
//!             .mount(Mount::parse("/", "callback://hello").unwrap()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! // serve until the application decides to stop
//! context.destroy().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod pool;
pub mod protocol;
pub mod stats;
pub mod tls;
pub mod vhost;

mod context;
mod service;
mod snapshot;
mod utils;

pub use config::{ContextConfig, Distribution, Http2Config, MountConfig, Timeouts, VhostConfig};
pub use context::{Context, ContextBuilder, ContextHandle};
pub use error::{ConnError, ContextError};
pub use handler::{ConnInfo, ProtocolHandler};
pub use snapshot::{ContextSnapshot, MountSnapshot, VhostSnapshot};
pub use stats::{ConnStatsSnapshot, ThreadSnapshot};
pub use vhost::{CachePolicy, Mount, Origin, VhostBuilder};

pub(crate) use utils::ensure;
