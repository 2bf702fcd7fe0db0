//! The acceptor thread.
//!
//! One thread owns every listening socket, accepts connections and hands each socket to a
//! service thread picked by the configured [`Distribution`]. The socket stays with that thread
//! for its whole life.

use std::io;
use std::net::TcpListener as StdListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::FutureExt;
use futures::future::select_all;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::Distribution;
use crate::stats::ThreadGauges;

use super::Incoming;

/// Pause after a failed accept, typically descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Routes accepted sockets to service threads.
#[derive(Debug)]
pub(crate) struct Distributor {
    policy: Distribution,
    threads: Vec<(UnboundedSender<Incoming>, Arc<ThreadGauges>)>,
    next: usize,
}

impl Distributor {
    pub(crate) fn new(policy: Distribution, threads: Vec<(UnboundedSender<Incoming>, Arc<ThreadGauges>)>) -> Self {
        Self { policy, threads, next: 0 }
    }

    fn pick(&mut self) -> usize {
        match self.policy {
            Distribution::RoundRobin => {
                let index = self.next % self.threads.len();
                self.next = self.next.wrapping_add(1);
                index
            }
            Distribution::LeastLoaded => self
                .threads
                .iter()
                .enumerate()
                .min_by_key(|(index, (_, gauges))| (gauges.snapshot().fds_count, *index))
                .map_or(0, |(index, _)| index),
        }
    }

    /// Hands `socket` to a service thread; false when that thread has stopped.
    pub(crate) fn hand_off(&mut self, socket: Incoming) -> bool {
        if self.threads.is_empty() {
            return false;
        }
        let index = self.pick();
        trace!(thread = index, peer = %socket.peer, port = socket.port, "handing off connection");
        self.threads[index].0.send(socket).is_ok()
    }
}

/// Starts the acceptor over `listeners`, each tagged with its configured port.
pub(crate) fn spawn(
    listeners: Vec<(u16, StdListener)>,
    distributor: Distributor,
    shutdown: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    std::thread::Builder::new()
        .name("mux-acceptor".to_string())
        .spawn(move || runtime.block_on(accept_loop(listeners, distributor, shutdown)))
}

async fn accept_loop(listeners: Vec<(u16, StdListener)>, mut distributor: Distributor, shutdown: CancellationToken) {
    let mut tokio_listeners = Vec::with_capacity(listeners.len());
    for (port, listener) in listeners {
        match listener.set_nonblocking(true).and_then(|()| TcpListener::from_std(listener)) {
            Ok(listener) => tokio_listeners.push((port, listener)),
            Err(e) => error!(port, cause = %e, "can't register listener"),
        }
    }
    if tokio_listeners.is_empty() {
        shutdown.cancelled().await;
        return;
    }
    info!(listeners = tokio_listeners.len(), "acceptor started");

    loop {
        let accepts = tokio_listeners.iter().map(|(port, listener)| listener.accept().map(move |accepted| (*port, accepted)).boxed());
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            ((port, accepted), _, _) = select_all(accepts) => match accepted {
                Ok((stream, peer)) => {
                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(port, peer = %peer, cause = %e, "can't detach accepted socket");
                            continue;
                        }
                    };
                    if !distributor.hand_off(Incoming { stream, peer, port }) {
                        warn!(port, peer = %peer, "service thread gone, dropping connection");
                    }
                }
                Err(e) => {
                    warn!(port, cause = %e, "failed to accept");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    info!("acceptor stopped");
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    fn gauges(fds: usize) -> Arc<ThreadGauges> {
        let gauges = Arc::new(ThreadGauges::default());
        ThreadGauges::set(&gauges.fds, fds);
        gauges
    }

    fn socket() -> Incoming {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer = stream.local_addr().unwrap();
        Incoming { stream, peer, port: 8080 }
    }

    #[test]
    fn round_robin_cycles_threads() {
        let threads = (0..3).map(|_| (unbounded_channel().0, gauges(0))).collect();
        let mut distributor = Distributor::new(Distribution::RoundRobin, threads);
        let picks: Vec<_> = (0..5).map(|_| distributor.pick()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn least_loaded_prefers_fewest_connections() {
        let threads = vec![(unbounded_channel().0, gauges(4)), (unbounded_channel().0, gauges(1)), (unbounded_channel().0, gauges(1))];
        let mut distributor = Distributor::new(Distribution::LeastLoaded, threads);
        assert_eq!(distributor.pick(), 1);

        ThreadGauges::set(&distributor.threads[1].1.fds, 9);
        assert_eq!(distributor.pick(), 2);
    }

    #[test]
    fn hand_off_reaches_picked_thread() {
        let (tx, mut rx) = unbounded_channel();
        let mut distributor = Distributor::new(Distribution::RoundRobin, vec![(tx, gauges(0))]);
        assert!(distributor.hand_off(socket()));
        assert_eq!(rx.try_recv().unwrap().port, 8080);

        drop(rx);
        assert!(!distributor.hand_off(socket()));
    }
}
