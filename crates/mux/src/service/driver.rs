//! Runs one [`Connection`] over its socket.
//!
//! The driver owns the I/O: it performs the TLS handshake when the listening virtual host has
//! an acceptor, feeds reads into the connection, writes its output and runs its dispatches
//! concurrently with reading. Graceful closes flush pending output; aborts (timeouts, I/O
//! errors, shutdown) drop the socket as is.

use std::rc::Rc;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::connection::{Completion, ConnId, Connection, Limits, Step, TimeoutKind};
use crate::error::ConnError;
use crate::pool::{Acquire, Lease};
use crate::tls::Negotiated;

use super::{ConnSlot, Incoming, Shared, dispatch};

pub(crate) async fn run(shared: &Rc<Shared>, id: ConnId, socket: Incoming, slot: &ConnSlot) {
    let env = &shared.env;
    let limits = Limits::from(env.config.as_ref());
    let mut conn = Connection::new(id, env.index, socket.peer, socket.port, Arc::clone(&env.registry), limits);

    match serve(shared, &mut conn, socket.stream, slot).await {
        Ok(()) => trace!(conn = %id, "connection finished"),
        Err(e) if e.is_socket_error() => debug!(conn = %id, cause = %e, "connection dropped"),
        Err(e) => warn!(conn = %id, cause = %e, "connection aborted"),
    }
    conn.close();
}

async fn serve(shared: &Rc<Shared>, conn: &mut Connection, stream: std::net::TcpStream, slot: &ConnSlot) -> Result<(), ConnError> {
    let timeouts = shared.env.config.timeouts;
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream)?;
    if let Err(e) = stream.set_nodelay(true) {
        trace!(conn = %conn.id(), cause = %e, "can't set TCP_NODELAY");
    }

    slot.arm(TimeoutKind::Handshake, &timeouts);
    let negotiated = match conn.listener_tls() {
        Some(tls) => tokio::select! {
            biased;
            () = slot.aborted() => return Err(slot.abort_reason()),
            negotiated = tls.accept(stream) => negotiated?,
        },
        None => Negotiated::plain(stream),
    };
    conn.negotiated(negotiated.server_name.as_deref(), negotiated.alpn.as_deref());
    let (mut reader, mut writer) = tokio::io::split(negotiated.io);

    let mut inflight: FuturesUnordered<LocalBoxFuture<'static, Completion>> = FuturesUnordered::new();
    let mut eof = false;
    loop {
        flush(conn, &mut writer, slot).await?;

        let wants_read = match conn.step() {
            Step::Dispatch(work) => {
                trace!(conn = %conn.id(), ?work, "dispatch");
                inflight.push(dispatch::run(Rc::clone(shared), work));
                continue;
            }
            Step::Lease => {
                let lease = acquire(shared, conn, &mut reader, &mut eof, slot).await?;
                conn.grant_lease(lease);
                continue;
            }
            Step::Close => {
                slot.arm(TimeoutKind::Idle, &timeouts);
                flush(conn, &mut writer, slot).await?;
                if let Err(e) = writer.shutdown().await {
                    trace!(conn = %conn.id(), cause = %e, "shutdown after close failed");
                }
                return Ok(());
            }
            Step::Read => !eof,
            Step::Wait => !eof && inflight.is_empty(),
        };
        // whatever the step wrote goes out before waiting on the peer
        flush(conn, &mut writer, slot).await?;

        if inflight.is_empty() {
            slot.arm(conn.timeout_kind(), &timeouts);
        } else {
            slot.disarm();
        }

        tokio::select! {
            biased;
            () = slot.aborted() => return Err(slot.abort_reason()),
            Some(completion) = inflight.next(), if !inflight.is_empty() => conn.complete(completion),
            read = reader.read_buf(conn.read_buf_mut()), if wants_read => match read? {
                0 => {
                    eof = true;
                    conn.set_eof();
                }
                n => {
                    conn.record_rx(n);
                    slot.traffic();
                }
            },
        }
    }
}

/// Takes a header pool slot, queueing behind other connections when the pool is exhausted.
///
/// While queued the socket is still read, up to one slot of header bytes, so a peer hanging up
/// leaves the queue without ever being promoted.
async fn acquire<R: AsyncRead + Unpin>(
    shared: &Shared,
    conn: &mut Connection,
    reader: &mut R,
    eof: &mut bool,
    slot: &ConnSlot,
) -> Result<Lease, ConnError> {
    let pending = match shared.pool.acquire(conn.id()) {
        Acquire::Leased(lease) => return Ok(lease),
        Acquire::Pending(pending) => pending,
    };
    trace!(conn = %conn.id(), waiting = shared.pool.waiting(), "waiting for a header pool slot");
    slot.arm(TimeoutKind::Header, &shared.env.config.timeouts);
    tokio::pin!(pending);

    let limit = shared.pool.slot_bytes();
    loop {
        let watch = !*eof && conn.read_buf_mut().len() < limit;
        tokio::select! {
            biased;
            () = slot.aborted() => return Err(slot.abort_reason()),
            lease = &mut pending => return Ok(lease),
            read = reader.read_buf(conn.read_buf_mut()), if watch => match read? {
                0 => {
                    *eof = true;
                    conn.set_eof();
                    debug!(conn = %conn.id(), "peer closed while queued for a header pool slot");
                    return Err(ConnError::PeerClosed);
                }
                n => conn.record_rx(n),
            },
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(conn: &mut Connection, writer: &mut W, slot: &ConnSlot) -> Result<(), ConnError> {
    if !conn.has_output() {
        return Ok(());
    }
    while conn.has_output() {
        let out = conn.take_output();
        tokio::select! {
            biased;
            () = slot.aborted() => return Err(slot.abort_reason()),
            written = writer.write_all(&out) => written?,
        }
        conn.record_tx(out.len());
    }
    writer.flush().await?;
    Ok(())
}
