// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Circular FIFO byte buffer with mutual-starvation short reads, per
//! spec.md §4.12.
//!
//! Unlike [`crate::heap::Heap`]/[`crate::region::Region`], the ring's own
//! `rdoff`/`wroff`/`fill` have to be inspected and mutated in the same
//! critical section as the grant/drain queue scan (a writer deciding
//! whether to wake readers early needs to see both "how much data is
//! there" and "is a reader already waiting" atomically), so this keeps
//! the ring bytes and the [`SyncObject`] under one combined state lock
//! rather than letting the sync object serialize only its own queues.

use std::sync::{Arc, Mutex};

use rtsync_abi::{CoreError, CoreResult, Magic, Name, QueueOrder, Timeout};

use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

/// A reader's or writer's payload while parked: the size it asked for.
/// Granting a waiter never rewrites this payload -- unlike the heap's
/// size-to-pointer handoff, a byte-buffer grant just means "go look
/// again," since the actual bytes move through the shared ring rather
/// than through the wait payload itself.
#[derive(Copy, Clone)]
struct Requested(usize);

struct Ring {
    buf: Vec<u8>,
    capacity: usize,
    rdoff: usize,
    wroff: usize,
    fill: usize,
}

impl Ring {
    fn write_bytes(&mut self, data: &[u8]) {
        let n = data.len();
        let first = (self.capacity - self.wroff).min(n);
        self.buf[self.wroff..self.wroff + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..]);
        }
        self.wroff = (self.wroff + n) % self.capacity;
        self.fill += n;
    }

    fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        let first = (self.capacity - self.rdoff).min(n);
        out[..first].copy_from_slice(&self.buf[self.rdoff..self.rdoff + first]);
        if first < n {
            out[first..].copy_from_slice(&self.buf[..n - first]);
        }
        self.rdoff = (self.rdoff + n) % self.capacity;
        self.fill -= n;
        out
    }
}

/// A fixed-capacity circular byte FIFO, per spec.md §4.12.
///
/// Writes are all-or-nothing and never short; reads normally block until
/// the full requested length is available, except for the one
/// deadlock-breaking case described in spec.md §4.12: a reader that
/// would otherwise block forever opposite a writer that itself cannot
/// make progress is handed whatever is currently in the ring instead.
pub struct ByteBuffer {
    magic: Magic,
    name: Name,
    ring: Mutex<Ring>,
    sync: Arc<SyncObject<Requested>>,
}

impl ByteBuffer {
    pub fn new(name: Name, capacity: usize, order: QueueOrder) -> Arc<Self> {
        log::debug!(target: "rtsync_core::bytebuffer", "create byte buffer {name} capacity={capacity}");
        Arc::new(ByteBuffer {
            magic: Magic::ByteBuffer,
            name,
            ring: Mutex::new(Ring {
                buf: vec![0u8; capacity.max(1)],
                capacity,
                rdoff: 0,
                wroff: 0,
                fill: 0,
            }),
            sync: Arc::new(SyncObject::new(order)),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().unwrap().capacity
    }

    pub fn fill(&self) -> usize {
        self.ring.lock().unwrap().fill
    }

    /// Writes exactly `data.len()` bytes, blocking according to
    /// `timeout` until there is enough free space.
    ///
    /// Before blocking, if the ring currently holds any data and at
    /// least one reader is already parked on the grant queue, every
    /// grant waiter is woken so it can take a short read of what is
    /// available now -- the mutual-starvation rule from spec.md §4.12,
    /// which is what lets a reader asking for more than a writer can
    /// ever supply alone make progress instead of deadlocking.
    pub fn write(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        data: &[u8],
        timeout: Timeout,
    ) -> CoreResult<()> {
        let n = data.len();
        if n == 0 {
            return Ok(());
        }
        let mut ring = self.ring.lock().unwrap();
        if n > ring.capacity {
            return Err(CoreError::Invalid);
        }
        loop {
            if ring.fill + n <= ring.capacity {
                ring.write_bytes(data);
                drop(ring);
                self.wake_drain_if_fits();
                self.wake_read_if_fits();
                return Ok(());
            }
            if ring.fill > 0 && self.sync.count_grant() > 0 {
                drop(ring);
                self.sync.grant_all()?;
                ring = self.ring.lock().unwrap();
                continue;
            }
            break;
        }
        drop(ring);
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let prio = thread.effective_priority();
        loop {
            self.sync
                .wait_drain(thread, prio, Requested(n), timeout)?;
            let mut ring = self.ring.lock().unwrap();
            if ring.fill + n <= ring.capacity {
                ring.write_bytes(data);
                drop(ring);
                self.wake_drain_if_fits();
                self.wake_read_if_fits();
                return Ok(());
            }
            // Woken spuriously by another writer's starvation-avoidance
            // grant_all, or by a drain that still doesn't leave enough
            // room for this writer specifically: loop back and wait
            // again rather than fabricating a short write, which
            // spec.md §4.12 never permits.
        }
    }

    /// Reads exactly `n` bytes, blocking according to `timeout` until
    /// that many are available -- unless the short-read exception
    /// fires: while blocked with `fill > 0`, if a writer is already
    /// parked on the drain queue, the read returns immediately with
    /// whatever is currently in the ring, per spec.md §4.12.
    pub fn read(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        n: usize,
        timeout: Timeout,
    ) -> CoreResult<Vec<u8>> {
        let mut ring = self.ring.lock().unwrap();
        if n > ring.capacity {
            return Err(CoreError::Invalid);
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        if ring.fill >= n {
            let out = ring.read_bytes(n);
            drop(ring);
            self.wake_grant_if_fits(n);
            return Ok(out);
        }
        if ring.fill > 0 && self.sync.count_drain() > 0 {
            let avail = ring.fill;
            let out = ring.read_bytes(avail);
            drop(ring);
            self.wake_grant_if_fits(avail);
            return Ok(out);
        }
        drop(ring);
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let prio = thread.effective_priority();
        loop {
            self.sync.wait_grant(thread, prio, Requested(n), timeout)?;
            let mut ring = self.ring.lock().unwrap();
            if ring.fill >= n {
                let out = ring.read_bytes(n);
                drop(ring);
                self.wake_grant_if_fits(n);
                return Ok(out);
            }
            if ring.fill > 0 && self.sync.count_drain() > 0 {
                let avail = ring.fill;
                let out = ring.read_bytes(avail);
                drop(ring);
                self.wake_grant_if_fits(avail);
                return Ok(out);
            }
            // Spuriously woken (another reader's request was satisfied
            // by the same write) without enough left for us: wait again.
        }
    }

    /// After freeing `n` bytes of room, checks the drain queue head: if
    /// the now-available space satisfies its recorded request, wakes
    /// every drainer (spec.md §4.12 specifies granting the whole side
    /// once the head fits, not a requeue-style incremental scan the way
    /// the heap does, since a byte buffer has only one producer-facing
    /// resource -- contiguous free space -- rather than independently
    /// sized blocks).
    fn wake_drain_if_fits(&self) {
        let ring = self.ring.lock().unwrap();
        let free = ring.capacity - ring.fill;
        drop(ring);
        if let Some(Requested(head)) = self.sync.peek_drain() {
            if head <= free {
                let _ = self.sync.drain_all();
            }
        }
    }

    /// After a read frees up ring space, a still-queued writer's
    /// *blocked* write may now fit; this is exactly
    /// [`ByteBuffer::wake_drain_if_fits`], kept as a distinct name at the
    /// read call sites so the intent at each call site reads clearly (a
    /// read can unblock writers; `n` here is informational only, since
    /// the check is over current capacity, not `n`).
    fn wake_grant_if_fits(&self, _n: usize) {
        self.wake_drain_if_fits();
    }

    /// After a successful write grows `ring.fill`, checks the grant
    /// queue head: if a blocked reader's recorded request now fits in
    /// what's buffered, wakes every reader (same whole-side grant
    /// rationale as [`ByteBuffer::wake_drain_if_fits`], mirrored onto
    /// the other queue).
    fn wake_read_if_fits(&self) {
        let ring = self.ring.lock().unwrap();
        let fill = ring.fill;
        drop(ring);
        if let Some(Requested(head)) = self.sync.peek_grant() {
            if head <= fill {
                let _ = self.sync.grant_all();
            }
        }
    }
}
