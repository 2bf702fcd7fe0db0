//! TLS boundary.
//!
//! The library does not implement TLS. A virtual host may carry a [`TlsAcceptor`] that performs
//! the handshake and reports what was negotiated; the connection treats completion of
//! [`TlsAcceptor::accept`] as the end of its negotiating phase.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream a connection runs on, plain or encrypted.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// Outcome of a completed handshake.
pub struct Negotiated {
    pub io: BoxIo,
    /// SNI server name sent by the client.
    pub server_name: Option<String>,
    /// Application protocol picked through ALPN, e.g. `b"h2"`.
    pub alpn: Option<Vec<u8>>,
}

impl Negotiated {
    pub fn plain<T: Io + 'static>(io: T) -> Self {
        Self { io: Box::new(io), server_name: None, alpn: None }
    }
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated").field("server_name", &self.server_name).field("alpn", &self.alpn).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait TlsAcceptor: Send + Sync + 'static {
    async fn accept(&self, stream: TcpStream) -> io::Result<Negotiated>;
}
