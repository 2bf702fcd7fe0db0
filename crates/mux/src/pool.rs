//! Per-thread header pool.
//!
//! A fixed number of fixed-size scratch buffers that connections lease while they parse a
//! request header. The pool lives on one service thread and is never shared across threads,
//! hence `Rc<RefCell<_>>` instead of a lock.
//!
//! When every slot is taken, [`HeaderPool::acquire`] hands out a [`PendingLease`] future and
//! the caller joins a FIFO queue. Dropping a [`Lease`] gives its slot to the head of the queue
//! and wakes it. Dropping a [`PendingLease`] before it resolves removes it from the queue; if
//! the slot had already been granted to it, the slot moves on to the next waiter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use tracing::trace;

use crate::connection::ConnId;
use crate::stats::ThreadGauges;

/// Handle to one thread's pool; clones share the same slots.
#[derive(Clone)]
pub struct HeaderPool {
    inner: Rc<RefCell<PoolInner>>,
}

/// Result of [`HeaderPool::acquire`].
#[derive(Debug)]
pub enum Acquire {
    Leased(Lease),
    Pending(PendingLease),
}

enum Slot {
    Free(BytesMut),
    Leased,
    Granted { ticket: u64, conn: ConnId, buf: BytesMut },
}

struct Waiter {
    ticket: u64,
    conn: ConnId,
    waker: Option<Waker>,
}

struct PoolInner {
    slot_bytes: usize,
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    gauges: Option<Arc<ThreadGauges>>,
}

impl HeaderPool {
    pub fn new(capacity: usize, slot_bytes: usize) -> Self {
        Self::with_gauges(capacity, slot_bytes, None)
    }

    pub(crate) fn with_gauges(capacity: usize, slot_bytes: usize, gauges: Option<Arc<ThreadGauges>>) -> Self {
        let slots = (0..capacity).map(|_| Slot::Free(BytesMut::with_capacity(slot_bytes))).collect();
        let inner = PoolInner { slot_bytes, slots, waiters: VecDeque::new(), next_ticket: 0, gauges };
        Self { inner: Rc::new(RefCell::new(inner)) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    pub fn slot_bytes(&self) -> usize {
        self.inner.borrow().slot_bytes
    }

    /// Slots leased or granted and not yet collected.
    pub fn in_use(&self) -> usize {
        self.inner.borrow().in_use()
    }

    pub fn waiting(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Leases a free slot to `conn`, or queues it behind earlier waiters.
    pub fn acquire(&self, conn: ConnId) -> Acquire {
        let mut inner = self.inner.borrow_mut();

        // queued connections keep their turn
        if inner.waiters.is_empty() {
            let free = inner.slots.iter().position(|slot| matches!(slot, Slot::Free(_)));
            if let Some(index) = free {
                let Slot::Free(buf) = std::mem::replace(&mut inner.slots[index], Slot::Leased) else {
                    unreachable!("slot {index} was checked to be free");
                };
                inner.publish();
                trace!(%conn, slot = index, "header pool slot leased");
                return Acquire::Leased(Lease { pool: Rc::clone(&self.inner), slot: index, conn, buf });
            }
        }

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.waiters.push_back(Waiter { ticket, conn, waker: None });
        inner.publish();
        trace!(%conn, waiting = inner.waiters.len(), "header pool exhausted, queued");
        Acquire::Pending(PendingLease { pool: Rc::clone(&self.inner), ticket, conn, done: false })
    }

    /// Drops every queued request of `conn`; a slot already granted to it moves on.
    ///
    /// Returns true if anything was removed.
    pub fn cancel(&self, conn: ConnId) -> bool {
        let mut wakers = Vec::new();
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.waiters.len();
            inner.waiters.retain(|waiter| waiter.conn != conn);
            let mut removed = before != inner.waiters.len();

            for index in 0..inner.slots.len() {
                if matches!(&inner.slots[index], Slot::Granted { conn: owner, .. } if *owner == conn) {
                    let Slot::Granted { buf, .. } = std::mem::replace(&mut inner.slots[index], Slot::Leased) else {
                        unreachable!("slot {index} was checked to be granted");
                    };
                    wakers.extend(inner.release(index, buf));
                    removed = true;
                }
            }
            inner.publish();
            removed
        };
        wakers.into_iter().for_each(Waker::wake);
        removed
    }
}

impl fmt::Debug for HeaderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("HeaderPool")
            .field("capacity", &inner.slots.len())
            .field("in_use", &inner.in_use())
            .field("waiting", &inner.waiters.len())
            .finish()
    }
}

impl PoolInner {
    fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| !matches!(slot, Slot::Free(_))).count()
    }

    fn publish(&self) {
        if let Some(gauges) = &self.gauges {
            ThreadGauges::set(&gauges.pool_in_use, self.in_use());
            ThreadGauges::set(&gauges.pool_waiting, self.waiters.len());
        }
    }

    /// Returns `slot` to the pool, granting it to the queue head if there is one.
    ///
    /// The caller wakes the returned waker once the borrow is released.
    fn release(&mut self, slot: usize, mut buf: BytesMut) -> Option<Waker> {
        assert!(
            matches!(self.slots.get(slot), Some(Slot::Leased)),
            "header pool slot {slot} released while not leased"
        );

        buf.clear();
        buf.reserve(self.slot_bytes);

        match self.waiters.pop_front() {
            Some(waiter) => {
                trace!(conn = %waiter.conn, slot, "header pool slot granted to waiter");
                self.slots[slot] = Slot::Granted { ticket: waiter.ticket, conn: waiter.conn, buf };
                waiter.waker
            }
            None => {
                self.slots[slot] = Slot::Free(buf);
                None
            }
        }
    }
}

/// Exclusive hold on one pool slot; the slot returns to the pool on drop.
pub struct Lease {
    pool: Rc<RefCell<PoolInner>>,
    slot: usize,
    conn: ConnId,
    buf: BytesMut,
}

impl Lease {
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Logical size of the slot; header bytes beyond it don't fit.
    pub fn capacity(&self) -> usize {
        self.pool.borrow().slot_bytes
    }

    pub fn buf(&self) -> &BytesMut {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("slot", &self.slot).field("conn", &self.conn).finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let waker = {
            let mut inner = self.pool.borrow_mut();
            let waker = inner.release(self.slot, buf);
            inner.publish();
            waker
        };
        trace!(conn = %self.conn, slot = self.slot, "header pool slot released");
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// A queued acquisition; resolves once a released slot is granted to it.
pub struct PendingLease {
    pool: Rc<RefCell<PoolInner>>,
    ticket: u64,
    conn: ConnId,
    done: bool,
}

impl PendingLease {
    pub fn conn(&self) -> ConnId {
        self.conn
    }
}

impl fmt::Debug for PendingLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLease").field("ticket", &self.ticket).field("conn", &self.conn).finish()
    }
}

impl Future for PendingLease {
    type Output = Lease;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ticket = self.ticket;
        let conn = self.conn;
        let mut inner = self.pool.borrow_mut();

        let granted = inner.slots.iter().position(|slot| matches!(slot, Slot::Granted { ticket: t, .. } if *t == ticket));
        if let Some(index) = granted {
            let Slot::Granted { buf, .. } = std::mem::replace(&mut inner.slots[index], Slot::Leased) else {
                unreachable!("slot {index} was checked to be granted");
            };
            inner.publish();
            drop(inner);
            self.done = true;
            return Poll::Ready(Lease { pool: Rc::clone(&self.pool), slot: index, conn, buf });
        }

        if let Some(waiter) = inner.waiters.iter_mut().find(|waiter| waiter.ticket == ticket) {
            match &waiter.waker {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => waiter.waker = Some(cx.waker().clone()),
            }
        }
        Poll::Pending
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let ticket = self.ticket;
        let waker = {
            let mut inner = self.pool.borrow_mut();
            inner.waiters.retain(|waiter| waiter.ticket != ticket);

            let granted = inner.slots.iter().position(|slot| matches!(slot, Slot::Granted { ticket: t, .. } if *t == ticket));
            let waker = granted.and_then(|index| {
                let Slot::Granted { buf, conn, .. } = std::mem::replace(&mut inner.slots[index], Slot::Leased) else {
                    unreachable!("slot {index} was checked to be granted");
                };
                trace!(%conn, slot = index, "granted header pool slot abandoned");
                inner.release(index, buf)
            });
            inner.publish();
            waker
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn leased(acquire: Acquire) -> Lease {
        match acquire {
            Acquire::Leased(lease) => lease,
            Acquire::Pending(pending) => panic!("expected a lease, got {pending:?}"),
        }
    }

    fn pending(acquire: Acquire) -> PendingLease {
        match acquire {
            Acquire::Pending(pending) => pending,
            Acquire::Leased(lease) => panic!("expected to queue, got {lease:?}"),
        }
    }

    #[test]
    fn third_acquirer_waits_for_a_release() {
        let pool = HeaderPool::new(2, 1024);

        let first = leased(pool.acquire(ConnId::new(1)));
        let _second = leased(pool.acquire(ConnId::new(2)));
        let mut third = pending(pool.acquire(ConnId::new(3)));

        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.waiting(), 1);
        assert!((&mut third).now_or_never().is_none());

        drop(first);
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.in_use(), 2);

        let lease = third.now_or_never().expect("granted after release");
        assert_eq!(lease.conn(), ConnId::new(3));
        assert_eq!(lease.capacity(), 1024);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn waiters_are_served_in_order() {
        let pool = HeaderPool::new(1, 64);
        let holder = leased(pool.acquire(ConnId::new(1)));
        let first = pending(pool.acquire(ConnId::new(2)));
        let second = pending(pool.acquire(ConnId::new(3)));

        drop(holder);
        let mut second = second;
        assert!((&mut second).now_or_never().is_none());

        let lease = first.now_or_never().expect("head of queue granted first");
        assert_eq!(lease.conn(), ConnId::new(2));
        drop(lease);

        let lease = second.now_or_never().expect("next waiter granted");
        assert_eq!(lease.conn(), ConnId::new(3));
    }

    #[test]
    fn free_slot_does_not_jump_the_queue() {
        let pool = HeaderPool::new(1, 64);
        let holder = leased(pool.acquire(ConnId::new(1)));
        let _waiter = pending(pool.acquire(ConnId::new(2)));
        drop(holder);

        // slot is granted to conn 2, a newcomer queues
        let _late = pending(pool.acquire(ConnId::new(3)));
        assert_eq!(pool.waiting(), 1);
    }

    #[test]
    fn dropped_waiter_is_never_granted() {
        let pool = HeaderPool::new(1, 64);
        let holder = leased(pool.acquire(ConnId::new(1)));
        let cancelled = pending(pool.acquire(ConnId::new(2)));
        let next = pending(pool.acquire(ConnId::new(3)));

        drop(cancelled);
        assert_eq!(pool.waiting(), 1);

        drop(holder);
        let lease = next.now_or_never().expect("slot skips the cancelled waiter");
        assert_eq!(lease.conn(), ConnId::new(3));
    }

    #[test]
    fn granted_but_dropped_passes_the_slot_on() {
        let pool = HeaderPool::new(1, 64);
        let holder = leased(pool.acquire(ConnId::new(1)));
        let granted = pending(pool.acquire(ConnId::new(2)));
        let next = pending(pool.acquire(ConnId::new(3)));

        drop(holder);
        drop(granted);

        let lease = next.now_or_never().expect("slot moved on");
        assert_eq!(lease.conn(), ConnId::new(3));
        drop(lease);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn cancel_removes_queued_connection() {
        let pool = HeaderPool::new(1, 64);
        let holder = leased(pool.acquire(ConnId::new(1)));
        let mut waiter = pending(pool.acquire(ConnId::new(2)));

        assert!(pool.cancel(ConnId::new(2)));
        assert_eq!(pool.waiting(), 0);

        drop(holder);
        assert!((&mut waiter).now_or_never().is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn never_more_leases_than_capacity() {
        let pool = HeaderPool::new(3, 64);
        let mut leases = Vec::new();
        let mut waiters = Vec::new();

        for id in 0..10 {
            match pool.acquire(ConnId::new(id)) {
                Acquire::Leased(lease) => leases.push(lease),
                Acquire::Pending(pending) => waiters.push(pending),
            }
            assert!(pool.in_use() <= pool.capacity());
        }
        assert_eq!(leases.len(), 3);

        while let Some(lease) = leases.pop() {
            drop(lease);
            assert!(pool.in_use() <= pool.capacity());
            if !waiters.is_empty() {
                let next = waiters.remove(0);
                leases.push(next.now_or_never().expect("released slot granted"));
            }
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn gauges_follow_the_pool() {
        let gauges = Arc::new(ThreadGauges::default());
        let pool = HeaderPool::with_gauges(1, 64, Some(gauges.clone()));
        let lease = leased(pool.acquire(ConnId::new(1)));
        let _waiter = pending(pool.acquire(ConnId::new(2)));

        let snapshot = gauges.snapshot();
        assert_eq!(snapshot.ah_pool_inuse, 1);
        assert_eq!(snapshot.ah_wait_list, 1);

        drop(lease);
        assert_eq!(gauges.snapshot().ah_wait_list, 0);
    }
}
