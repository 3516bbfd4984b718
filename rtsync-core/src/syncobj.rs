// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sync object: a FIFO/priority-ordered wait queue with a grant side
//! and a drain side, shared by every L2 primitive (mutex excepted -- it
//! rides directly on a native lock).
//!
//! A sync object tracks two logical queues of waiting threads. The *grant*
//! side holds threads waiting for something to be produced (data, a free
//! block, a signaled event); the *drain* side holds threads waiting for
//! something to be consumed (space, a cleared event). Each queued thread
//! carries a small payload of type `P` -- the size it asked to allocate,
//! the number of bytes it wants to read, and so on -- which the granting
//! side may rewrite before waking it (e.g. to hand back an allocated
//! pointer).

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use rtsync_abi::{CoreError, CoreResult, Priority, QueueOrder, Timeout};

use crate::thread::ThreadObject;

/// Which of the two queues an operation addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Grant,
    Drain,
}

/// Outcome cell shared between a waiting thread and whoever eventually
/// wakes it. Lives behind its own tiny lock so granting a waiter never has
/// to hold the sync object's queue lock while it waits for a wakeup.
struct Waiter<P> {
    seq: u64,
    priority: Mutex<Priority>,
    cond: Condvar,
    cell: Mutex<Outcome<P>>,
}

enum Outcome<P> {
    Pending(P),
    Granted(P),
    TimedOut,
    Interrupted,
    Removed,
}

struct Ticket<P> {
    seq: u64,
    waiter: Arc<Waiter<P>>,
}

struct State<P> {
    order: QueueOrder,
    next_seq: u64,
    grant: Vec<Ticket<P>>,
    drain: Vec<Ticket<P>>,
    deleted: bool,
}

impl<P> State<P> {
    fn queue_mut(&mut self, side: Side) -> &mut Vec<Ticket<P>> {
        match side {
            Side::Grant => &mut self.grant,
            Side::Drain => &mut self.drain,
        }
    }

    /// Picks the waiter this object's ordering policy says should run next,
    /// and removes it from its queue. Mirrors a linear priority scan with
    /// insertion-order tie-break, the same shape as a classic RTOS
    /// ready-queue pick.
    fn pop_best(&mut self, side: Side) -> Option<Arc<Waiter<P>>> {
        let order = self.order;
        let queue = self.queue_mut(side);
        if queue.is_empty() {
            return None;
        }
        let idx = match order {
            QueueOrder::Fifo => 0,
            QueueOrder::Priority => {
                let mut best = 0;
                let mut best_prio = *queue[0].waiter.priority.lock().unwrap();
                for (i, t) in queue.iter().enumerate().skip(1) {
                    let p = *t.waiter.priority.lock().unwrap();
                    if p.is_more_urgent_than(best_prio) {
                        best = i;
                        best_prio = p;
                    }
                }
                best
            }
        };
        Some(queue.remove(idx).waiter)
    }

    /// Returns the indices of `side`'s queue in the order this object
    /// would serve them: insertion order for FIFO, descending priority
    /// (ties broken by insertion order) for `Priority`. Used by scans
    /// that need to consider more than just the immediate head, such as
    /// the heap/region/event-group requeue-on-free/signal sweep.
    fn ordered_indices(&self, side: Side) -> Vec<usize> {
        let queue = match side {
            Side::Grant => &self.grant,
            Side::Drain => &self.drain,
        };
        let mut idx: Vec<usize> = (0..queue.len()).collect();
        match self.order {
            QueueOrder::Fifo => idx.sort_by_key(|&i| queue[i].seq),
            QueueOrder::Priority => idx.sort_by(|&a, &b| {
                let pa = *queue[a].waiter.priority.lock().unwrap();
                let pb = *queue[b].waiter.priority.lock().unwrap();
                pb.cmp(&pa).then(queue[a].seq.cmp(&queue[b].seq))
            }),
        }
        idx
    }

    fn remove_seq(&mut self, side: Side, seq: u64) -> bool {
        let queue = self.queue_mut(side);
        if let Some(pos) = queue.iter().position(|t| t.seq == seq) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }
}

/// The coordination primitive shared by every L2 primitive built on this
/// core. Generic over the per-wait payload `P` each side exchanges.
pub struct SyncObject<P> {
    state: Mutex<State<P>>,
}

impl<P> SyncObject<P> {
    pub fn new(order: QueueOrder) -> Self {
        SyncObject {
            state: Mutex::new(State {
                order,
                next_seq: 0,
                grant: Vec::new(),
                drain: Vec::new(),
                deleted: false,
            }),
        }
    }

    /// Runs `f` with exclusive access to the queue state, mirroring the
    /// `lock`/`unlock` pair described for the sync object: this is the one
    /// way callers get mutual exclusion over the object without also
    /// queueing on it. Returns `Err(Invalid)` if the object has already
    /// been destroyed.
    pub fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut QueueHandle<'_, P>) -> R,
    ) -> CoreResult<R> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Invalid);
        }
        Ok(f(&mut QueueHandle { state: &mut state }))
    }

    fn enqueue(&self, side: Side, priority: Priority, payload: P) -> CoreResult<Arc<Waiter<P>>> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Removed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let waiter = Arc::new(Waiter {
            seq,
            priority: Mutex::new(priority),
            cond: Condvar::new(),
            cell: Mutex::new(Outcome::Pending(payload)),
        });
        state.queue_mut(side).push(Ticket {
            seq,
            waiter: waiter.clone(),
        });
        Ok(waiter)
    }

    /// Removes the waiter identified by `seq` from `side` and marks it
    /// interrupted, notifying it. This is what a cancellation request
    /// delivered to a blocked thread actually invokes.
    fn interrupt_seq(self: &Arc<Self>, side: Side, seq: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue_mut(side).iter().position(|t| t.seq == seq) {
            let t = state.queue_mut(side).remove(pos);
            drop(state);
            let mut cell = t.waiter.cell.lock().unwrap();
            if let Outcome::Pending(_) = &*cell {
                *cell = Outcome::Interrupted;
            }
            drop(cell);
            t.waiter.cond.notify_one();
        }
    }
}

impl<P: Send + 'static> SyncObject<P> {
    /// Blocks the caller on the grant side until granted, timed out,
    /// interrupted, or the object is destroyed. Re-acquires nothing on the
    /// caller's behalf; the caller's own control-block lock discipline
    /// (dropped before calling this, re-taken after a successful return)
    /// lives in the primitive built atop this sync object.
    ///
    /// `thread` is the caller's own thread object; while blocked here it
    /// transitions to the cancellable state described for the scoped
    /// service guard, so a cancellation delivered to `thread` unwinds this
    /// wait immediately instead of waiting for the deadline.
    pub fn wait_grant(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        priority: Priority,
        payload: P,
        timeout: Timeout,
    ) -> CoreResult<P> {
        self.wait(Side::Grant, thread, priority, payload, timeout)
    }

    /// Symmetric with [`SyncObject::wait_grant`], enqueued on the drain
    /// side.
    pub fn wait_drain(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        priority: Priority,
        payload: P,
        timeout: Timeout,
    ) -> CoreResult<P> {
        self.wait(Side::Drain, thread, priority, payload, timeout)
    }

    fn wait(
        self: &Arc<Self>,
        side: Side,
        thread: &Arc<ThreadObject>,
        priority: Priority,
        payload: P,
        timeout: Timeout,
    ) -> CoreResult<P> {
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        if thread.cancel_pending() {
            thread.clear_cancel();
            return Err(CoreError::Interrupted);
        }
        let waiter = self.enqueue(side, priority, payload)?;
        let seq = waiter.seq;
        let sync = self.clone();
        let _guard = thread.enter_wait(Box::new(move || sync.interrupt_seq(side, seq)));

        let deadline = timeout.deadline_from(Instant::now());
        let mut guard = waiter.cell.lock().unwrap();
        loop {
            match &*guard {
                Outcome::Pending(_) => {}
                Outcome::Granted(_) => break,
                Outcome::TimedOut => return Err(CoreError::TimedOut),
                Outcome::Interrupted => return Err(CoreError::Interrupted),
                Outcome::Removed => return Err(CoreError::Removed),
            }
            match deadline {
                None => guard = waiter.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.finish_timeout(side, &waiter, guard);
                    }
                    let (g2, res) =
                        waiter.cond.wait_timeout(guard, deadline - now).unwrap();
                    guard = g2;
                    if res.timed_out() {
                        if let Outcome::Pending(_) = &*guard {
                            return self.finish_timeout(side, &waiter, guard);
                        }
                    }
                }
            }
        }
        match std::mem::replace(&mut *guard, Outcome::Removed) {
            Outcome::Granted(p) => Ok(p),
            _ => unreachable!("checked above"),
        }
    }

    /// Handles a deadline expiry: removes the waiter from its queue under
    /// the object lock (closing the race against a concurrent grant), then
    /// reports whatever the now-settled outcome actually is.
    fn finish_timeout<'a>(
        self: &Arc<Self>,
        side: Side,
        waiter: &Arc<Waiter<P>>,
        mut guard: MutexGuard<'a, Outcome<P>>,
    ) -> CoreResult<P> {
        let mut state = self.state.lock().unwrap();
        state.remove_seq(side, waiter.seq);
        drop(state);
        match std::mem::replace(&mut *guard, Outcome::Removed) {
            Outcome::Pending(_) => Err(CoreError::TimedOut),
            Outcome::Granted(p) => Ok(p),
            Outcome::TimedOut => Err(CoreError::TimedOut),
            Outcome::Interrupted => Err(CoreError::Interrupted),
            Outcome::Removed => Err(CoreError::Removed),
        }
    }

    pub fn grant_one(&self) -> CoreResult<bool> {
        self.grant_one_with(|_| ())
    }

    /// Wakes the best grant-side waiter, replacing its payload via `f`.
    /// Returns `Ok(true)` if a waiter was woken.
    pub fn grant_one_with(&self, f: impl FnOnce(P) -> P) -> CoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Invalid);
        }
        match state.pop_best(Side::Grant) {
            Some(w) => {
                drop(state);
                Self::grant(&w, f);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn grant_all(&self) -> CoreResult<usize> {
        self.drain_side(Side::Grant)
    }

    /// Pops the best grant-side waiter, if any, and lets `commit` observe
    /// its payload and produce a result *before* the waiter is actually
    /// woken -- all under the one lock acquisition on that waiter's own
    /// outcome cell. This closes the window a separate peek-then-grant
    /// pair would leave open: a caller that needs to commit some other
    /// piece of state (e.g. a mutex's new owner) to match whichever
    /// waiter gets granted cannot do so safely if the waiter it peeked
    /// can still time out before the later grant call actually reaches
    /// it.
    ///
    /// If the popped waiter turns out to have already timed out or been
    /// interrupted by the time its cell is locked here (it was removed
    /// from the queue by this call either way), it is skipped and the
    /// next-best waiter is tried instead. Returns `Ok(None)` once the
    /// queue is exhausted.
    pub fn grant_one_committing<R>(
        &self,
        mut commit: impl FnMut(&P) -> R,
    ) -> CoreResult<Option<R>> {
        loop {
            let mut state = self.state.lock().unwrap();
            if state.deleted {
                return Err(CoreError::Invalid);
            }
            let waiter = match state.pop_best(Side::Grant) {
                Some(w) => w,
                None => return Ok(None),
            };
            drop(state);
            let mut cell = waiter.cell.lock().unwrap();
            if let Outcome::Pending(p) = &*cell {
                let result = commit(p);
                if let Outcome::Pending(p) = std::mem::replace(&mut *cell, Outcome::Removed) {
                    *cell = Outcome::Granted(p);
                }
                drop(cell);
                waiter.cond.notify_one();
                return Ok(Some(result));
            }
            // Lost the race to this waiter's own timeout/interrupt
            // between being popped and locked here; it's already gone
            // from the queue either way, so move on to the next-best.
        }
    }

    /// Scans the grant queue in the order this object would serve it
    /// (FIFO arrival order, or descending priority), calling
    /// `try_transform` on each pending waiter's payload until one
    /// returns `Some(new_payload)`. That waiter is removed from the
    /// queue and granted with the returned payload; later candidates are
    /// left untouched. Returns the granted payload, if any.
    ///
    /// This is the `grant_to(t)` operation from spec.md §4.4 generalized
    /// from "target a specific thread" to "target whichever waiter a
    /// single test-and-commit closure accepts first" -- the heap/region
    /// requeue-on-free scan, the event group's signal-satisfies-waiters
    /// scan, and the message queue's directed/zero-copy delivery all
    /// need to both test a candidate and commit a side effect (an
    /// allocation, a bit-clear, a buffer copy) atomically with removing
    /// it from the queue, which a separate predicate-then-rewrite pair
    /// of closures cannot express without two overlapping mutable
    /// borrows of the same external state.
    pub fn grant_matching(
        &self,
        mut try_transform: impl FnMut(&P) -> Option<P>,
    ) -> CoreResult<Option<P>>
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Invalid);
        }
        let order = state.ordered_indices(Side::Grant);
        let mut found = None;
        for idx in order {
            let ticket = &state.grant[idx];
            let cell = ticket.waiter.cell.lock().unwrap();
            if let Outcome::Pending(p) = &*cell {
                if let Some(new_p) = try_transform(p) {
                    found = Some((idx, new_p));
                    break;
                }
            }
        }
        match found {
            Some((idx, new_p)) => {
                let t = state.grant.remove(idx);
                drop(state);
                let result = new_p.clone();
                Self::grant(&t.waiter, move |_| new_p);
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    pub fn drain_one(&self) -> CoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Invalid);
        }
        match state.pop_best(Side::Drain) {
            Some(w) => {
                drop(state);
                Self::grant(&w, |p| p);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn drain_all(&self) -> CoreResult<usize> {
        self.drain_side(Side::Drain)
    }

    fn drain_side(&self, side: Side) -> CoreResult<usize> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Err(CoreError::Invalid);
        }
        let woken = std::mem::take(state.queue_mut(side));
        drop(state);
        let n = woken.len();
        for t in woken {
            Self::grant(&t.waiter, |p| p);
        }
        Ok(n)
    }

    fn grant(waiter: &Arc<Waiter<P>>, f: impl FnOnce(P) -> P) {
        let mut cell = waiter.cell.lock().unwrap();
        if let Outcome::Pending(p) = std::mem::replace(&mut *cell, Outcome::Removed) {
            *cell = Outcome::Granted(f(p));
        }
        drop(cell);
        waiter.cond.notify_one();
    }

    pub fn count_grant(&self) -> usize {
        self.state.lock().unwrap().grant.len()
    }

    pub fn count_drain(&self) -> usize {
        self.state.lock().unwrap().drain.len()
    }

    /// Destroys the sync object: every currently queued waiter (either
    /// side) is released with [`CoreError::Removed`]. Subsequent queueing
    /// attempts also fail with `Removed`.
    pub fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.deleted = true;
        let grant = std::mem::take(&mut state.grant);
        let drain = std::mem::take(&mut state.drain);
        drop(state);
        for t in grant.into_iter().chain(drain) {
            let mut cell = t.waiter.cell.lock().unwrap();
            *cell = Outcome::Removed;
            drop(cell);
            t.waiter.cond.notify_one();
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().unwrap().deleted
    }
}

impl<P: Clone> SyncObject<P> {
    /// Non-destructively inspects the head of the grant queue, used by the
    /// byte buffer to detect mutual producer/consumer starvation.
    pub fn peek_grant(&self) -> Option<P> {
        self.peek(Side::Grant)
    }

    pub fn peek_drain(&self) -> Option<P> {
        self.peek(Side::Drain)
    }

    fn peek(&self, side: Side) -> Option<P> {
        let state = self.state.lock().unwrap();
        let queue = match side {
            Side::Grant => &state.grant,
            Side::Drain => &state.drain,
        };
        let ticket = queue.first()?;
        let cell = ticket.waiter.cell.lock().unwrap();
        match &*cell {
            Outcome::Pending(p) => Some(p.clone()),
            _ => None,
        }
    }
}

/// A scoped view of the queue state handed to `with_lock` callers, used by
/// primitives (event group, semaphore) that need to manipulate state and
/// the queues atomically without going through a full wait.
pub struct QueueHandle<'a, P> {
    state: &'a mut State<P>,
}

impl<'a, P> QueueHandle<'a, P> {
    pub fn count_grant(&self) -> usize {
        self.state.grant.len()
    }

    pub fn count_drain(&self) -> usize {
        self.state.drain.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_arrival_order() {
        let so: Arc<SyncObject<u32>> = Arc::new(SyncObject::new(QueueOrder::Fifo));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let so = so.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let got = so
                    .wait_grant(&crate::thread::current(), Priority(0), i, Timeout::Infinite)
                    .unwrap();
                order.lock().unwrap().push(got);
            }));
            // Give each thread a beat to enqueue before the next spawns,
            // so arrival order is deterministic for the test.
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(so.count_grant(), 3);
        for _ in 0..3 {
            assert!(so.grant_one().unwrap());
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn priority_order_picks_most_urgent_first() {
        let so: Arc<SyncObject<&'static str>> =
            Arc::new(SyncObject::new(QueueOrder::Priority));
        let low = so.clone();
        let high = so.clone();
        let low_started = Arc::new(std::sync::Barrier::new(2));
        let b1 = low_started.clone();
        let t1 = thread::spawn(move || {
            b1.wait();
            low.wait_grant(&crate::thread::current(), Priority(1), "low", Timeout::Infinite)
        });
        low_started.wait();
        thread::sleep(Duration::from_millis(20));
        let t2 = thread::spawn(move || {
            high.wait_grant(&crate::thread::current(), Priority(5), "high", Timeout::Infinite)
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(so.count_grant(), 2);
        assert!(so.grant_one().unwrap());
        assert_eq!(t2.join().unwrap().unwrap(), "high");
        assert!(so.grant_one().unwrap());
        assert_eq!(t1.join().unwrap().unwrap(), "low");
    }

    #[test]
    fn timeout_removes_waiter_without_disturbing_others() {
        let so: Arc<SyncObject<()>> = Arc::new(SyncObject::new(QueueOrder::Fifo));
        let so2 = so.clone();
        let impatient = thread::spawn(move || {
            so2.wait_grant(
                &crate::thread::current(),
                Priority(0),
                (),
                Timeout::Relative(Duration::from_millis(30)),
            )
        });
        thread::sleep(Duration::from_millis(10));
        let patient = so.clone();
        let t2 = thread::spawn(move || {
            patient.wait_grant(&crate::thread::current(), Priority(0), (), Timeout::Infinite)
        });
        thread::sleep(Duration::from_millis(10));
        assert_eq!(impatient.join().unwrap(), Err(CoreError::TimedOut));
        assert_eq!(so.count_grant(), 1);
        assert!(so.grant_one().unwrap());
        assert_eq!(t2.join().unwrap(), Ok(()));
    }

    #[test]
    fn destroy_wakes_all_waiters_with_removed() {
        let so: Arc<SyncObject<()>> = Arc::new(SyncObject::new(QueueOrder::Fifo));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let so = so.clone();
            handles.push(thread::spawn(move || {
                so.wait_grant(&crate::thread::current(), Priority(0), (), Timeout::Infinite)
            }));
        }
        thread::sleep(Duration::from_millis(30));
        so.destroy();
        for h in handles {
            assert_eq!(h.join().unwrap(), Err(CoreError::Removed));
        }
    }
}
