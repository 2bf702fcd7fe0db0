//! Connection statistics.
//!
//! Every virtual host owns one [`ConnStats`]. Counters are only ever incremented, with
//! relaxed atomics, from whichever service thread owns the connection. Readers take a
//! [`ConnStatsSnapshot`] and sum snapshots; context totals are never stored separately, so
//! the context view always equals the sum over its virtual hosts.

use std::iter::Sum;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Monotonic per virtual host counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    rx: AtomicU64,
    tx: AtomicU64,
    h1_conn: AtomicU64,
    h1_trans: AtomicU64,
    h2_trans: AtomicU64,
    ws_upg: AtomicU64,
    h2_upg: AtomicU64,
    h2_alpn: AtomicU64,
    h2_subs: AtomicU64,
    rejected: AtomicU64,
}

/// Which counter an event bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    H1Conn,
    H1Trans,
    H2Trans,
    WsUpg,
    H2Upg,
    H2Alpn,
    H2Subs,
    Rejected,
}

impl ConnStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::H1Conn => &self.h1_conn,
            Counter::H1Trans => &self.h1_trans,
            Counter::H2Trans => &self.h2_trans,
            Counter::WsUpg => &self.ws_upg,
            Counter::H2Upg => &self.h2_upg,
            Counter::H2Alpn => &self.h2_alpn,
            Counter::H2Subs => &self.h2_subs,
            Counter::Rejected => &self.rejected,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    /// Point in time copy; each counter is read independently.
    pub fn snapshot(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            h1_conn: self.h1_conn.load(Ordering::Relaxed),
            h1_trans: self.h1_trans.load(Ordering::Relaxed),
            h2_trans: self.h2_trans.load(Ordering::Relaxed),
            ws_upg: self.ws_upg.load(Ordering::Relaxed),
            h2_upg: self.h2_upg.load(Ordering::Relaxed),
            h2_alpn: self.h2_alpn.load(Ordering::Relaxed),
            h2_subs: self.h2_subs.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of a [`ConnStats`], summable across virtual hosts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnStatsSnapshot {
    pub rx: u64,
    pub tx: u64,
    pub h1_conn: u64,
    pub h1_trans: u64,
    pub h2_trans: u64,
    pub ws_upg: u64,
    pub h2_upg: u64,
    pub h2_alpn: u64,
    pub h2_subs: u64,
    pub rejected: u64,
}

impl AddAssign for ConnStatsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.rx += rhs.rx;
        self.tx += rhs.tx;
        self.h1_conn += rhs.h1_conn;
        self.h1_trans += rhs.h1_trans;
        self.h2_trans += rhs.h2_trans;
        self.ws_upg += rhs.ws_upg;
        self.h2_upg += rhs.h2_upg;
        self.h2_alpn += rhs.h2_alpn;
        self.h2_subs += rhs.h2_subs;
        self.rejected += rhs.rejected;
    }
}

impl Sum for ConnStatsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ConnStatsSnapshot::default(), |mut acc, item| {
            acc += item;
            acc
        })
    }
}

/// Gauges a service thread publishes for the diagnostic snapshot.
///
/// Unlike [`ConnStats`] these go up and down; only the owning thread writes them.
#[derive(Debug, Default)]
pub struct ThreadGauges {
    pub(crate) fds: AtomicUsize,
    pub(crate) pool_in_use: AtomicUsize,
    pub(crate) pool_waiting: AtomicUsize,
    pub(crate) cgi_alive: AtomicUsize,
}

/// Plain copy of one thread's [`ThreadGauges`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadSnapshot {
    pub fds_count: usize,
    pub ah_pool_inuse: usize,
    pub ah_wait_list: usize,
    pub cgi_alive: usize,
}

impl ThreadGauges {
    pub(crate) fn set(cell: &AtomicUsize, value: usize) {
        cell.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            fds_count: self.fds.load(Ordering::Relaxed),
            ah_pool_inuse: self.pool_in_use.load(Ordering::Relaxed),
            ah_wait_list: self.pool_waiting.load(Ordering::Relaxed),
            cgi_alive: self.cgi_alive.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_the_sum_of_vhosts() {
        let example = ConnStats::new();
        let admin = ConnStats::new();
        example.add(Counter::H1Trans, 5);
        admin.add(Counter::H1Trans, 2);
        example.add_rx(100);
        admin.add_rx(20);
        admin.incr(Counter::Rejected);

        let total: ConnStatsSnapshot = [&example, &admin].iter().map(|stats| stats.snapshot()).sum();

        assert_eq!(total.h1_trans, 7);
        assert_eq!(total.rx, 120);
        assert_eq!(total.rejected, 1);
        assert_eq!(total.ws_upg, 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = std::sync::Arc::new(ConnStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.incr(Counter::H2Subs);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().h2_subs, 4000);
    }
}
