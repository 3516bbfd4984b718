// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Variable-length message queue with refcounted broadcast delivery and
//! a zero-copy write fast path, per spec.md §4.13.
//!
//! Message storage is drawn from a private [`Heap`], so the queue's
//! total outstanding payload bytes is bounded the same way any other
//! heap-backed allocation is (including blocking `alloc` when the heap
//! is momentarily exhausted); the message list itself and its refcounts
//! live in this module, since neither concept belongs inside the generic
//! block allocator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rtsync_abi::{CoreError, CoreResult, Magic, Name, QueueOrder, Timeout};

use crate::heap::Heap;
use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

/// How a sent message is placed relative to the queue's existing
/// contents when no waiter absorbs it directly, per spec.md §4.13.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Prepend: delivered ahead of everything already queued.
    Urgent,
    /// Append: ordinary FIFO placement.
    Normal,
    /// Deliver to every currently waiting receiver, sharing one
    /// refcounted payload; only enqueued (as an ordinary single
    /// message) if no receiver was waiting to take it.
    Broadcast,
}

/// Construction-time limits for a [`MsgQueue`].
pub struct QueueConfig {
    /// Total bytes available to the queue's private message heap.
    pub capacity_bytes: usize,
    /// Maximum number of messages allowed to sit in the queue at once.
    /// `None` means unlimited.
    pub limit: Option<usize>,
    /// Maximum payload size accepted by a single message. `None` means
    /// bounded only by `capacity_bytes`.
    pub max_msg_size: Option<usize>,
    /// Ordering discipline for receivers blocked on an empty queue.
    pub order: QueueOrder,
}

struct Message {
    payload: Mutex<Vec<u8>>,
    heap_offset: usize,
    heap_size: usize,
    /// Number of outstanding owners: one per receiver currently holding
    /// a [`MsgRef`] to this message, or one representing "still sitting
    /// in the queue" while unclaimed. Reaching zero releases the
    /// backing heap storage.
    refcount: Mutex<u32>,
}

impl Message {
    fn retain(&self) {
        *self.refcount.lock().unwrap() += 1;
    }

    /// Releases one ownership. Returns `true` if this was the last one.
    fn release(&self) -> bool {
        let mut rc = self.refcount.lock().unwrap();
        *rc -= 1;
        *rc == 0
    }
}

/// An opaque reference to a message, returned by [`MsgQueue::alloc`] and
/// [`MsgQueue::receive`].
///
/// Cloning a `MsgRef` shares the same double-free check as the original
/// (both clones mark the same underlying flag), which is exactly what
/// should happen if a caller legitimately holds two handles to the same
/// logical ownership slot; a *new* owner (as minted per-recipient during
/// [`SendMode::Broadcast`] delivery) gets a fresh `MsgRef` with its own
/// flag instead.
#[derive(Clone)]
pub struct MsgRef {
    msg: Arc<Message>,
    freed: Arc<AtomicBool>,
}

impl MsgRef {
    fn new(msg: Arc<Message>) -> Self {
        MsgRef {
            msg,
            freed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn len(&self) -> usize {
        self.msg.payload.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the message's current payload bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.msg.payload.lock().unwrap().clone()
    }

    /// Fills (replacing) the message's payload. Fails with
    /// [`CoreError::Invalid`] if `data` exceeds the size reserved at
    /// [`MsgQueue::alloc`].
    pub fn fill(&self, data: &[u8]) -> CoreResult<()> {
        let mut buf = self.msg.payload.lock().unwrap();
        if data.len() > self.msg.heap_size {
            return Err(CoreError::Invalid);
        }
        buf.clear();
        buf.extend_from_slice(data);
        Ok(())
    }
}

/// A waiting receiver's request, or the delivery it was granted. Used as
/// the grant-side payload of the queue's [`SyncObject`].
#[derive(Clone)]
enum Slot {
    /// Parked in `receive`: wants a [`MsgRef`] to the next message.
    WaitingReceive,
    /// Parked in `read`: wants up to this many bytes copied into its
    /// own local buffer.
    WaitingRead(usize),
    GotMessage(MsgRef),
    GotBytes(Vec<u8>),
}

struct QueueState {
    msgs: VecDeque<Arc<Message>>,
    mcount: usize,
}

/// A variable-length message queue, per spec.md §4.13.
pub struct MsgQueue {
    magic: Magic,
    name: Name,
    state: Mutex<QueueState>,
    sync: Arc<SyncObject<Slot>>,
    heap: Arc<Heap>,
    limit: Option<usize>,
    max_msg_size: Option<usize>,
}

impl MsgQueue {
    pub fn new(name: Name, config: QueueConfig) -> Arc<Self> {
        log::debug!(
            target: "rtsync_core::msgqueue",
            "create message queue {name} capacity_bytes={} limit={:?}",
            config.capacity_bytes, config.limit,
        );
        Arc::new(MsgQueue {
            magic: Magic::MsgQueue,
            name,
            state: Mutex::new(QueueState {
                msgs: VecDeque::new(),
                mcount: 0,
            }),
            sync: Arc::new(SyncObject::new(config.order)),
            heap: Heap::new(name, config.capacity_bytes, QueueOrder::Fifo),
            limit: config.limit,
            max_msg_size: config.max_msg_size,
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn mcount(&self) -> usize {
        self.state.lock().unwrap().mcount
    }

    /// Reserves a message descriptor and payload buffer of `size` bytes
    /// from the queue's own heap, blocking according to `timeout` if the
    /// heap cannot currently satisfy it. The caller fills the payload
    /// (via [`MsgRef::fill`]) before passing the result to
    /// [`MsgQueue::send`].
    pub fn alloc(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        size: usize,
        timeout: Timeout,
    ) -> CoreResult<MsgRef> {
        if let Some(max) = self.max_msg_size {
            if size > max {
                return Err(CoreError::Invalid);
            }
        }
        let offset = self.heap.alloc(thread, size, timeout)?;
        Ok(MsgRef::new(Arc::new(Message {
            payload: Mutex::new(Vec::new()),
            heap_offset: offset,
            heap_size: size,
            refcount: Mutex::new(1),
        })))
    }

    /// Sends a previously allocated, filled message. See
    /// [`MsgQueue::send_message`] for the delivery rules.
    pub fn send(self: &Arc<Self>, msg: MsgRef, mode: SendMode) -> CoreResult<()> {
        if msg.freed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Invalid);
        }
        self.send_message(msg.msg, mode)
    }

    /// Sends `data` as a new message, with a zero-copy fast path:
    /// outside broadcast mode, if a receiver is already parked in
    /// [`MsgQueue::read`] with room for at least `data.len()` bytes, the
    /// bytes are handed to it directly and the queue (and its heap) are
    /// never touched. Otherwise a message is allocated, `data` is
    /// copied in, and delivery proceeds as in [`MsgQueue::send`].
    pub fn write(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        data: &[u8],
        mode: SendMode,
        timeout: Timeout,
    ) -> CoreResult<()> {
        if let Some(max) = self.max_msg_size {
            if data.len() > max {
                return Err(CoreError::Invalid);
            }
        }
        if mode != SendMode::Broadcast {
            let got = self.sync.grant_matching(|slot: &Slot| match slot {
                Slot::WaitingRead(cap) if *cap >= data.len() => Some(Slot::GotBytes(data.to_vec())),
                _ => None,
            })?;
            if got.is_some() {
                return Ok(());
            }
        }
        let msg = self.alloc(thread, data.len(), timeout)?;
        msg.fill(data)?;
        self.send(msg, mode)
    }

    /// Delivers `msg`: for [`SendMode::Broadcast`], to every currently
    /// waiting receiver (sharing the payload via refcount); otherwise to
    /// the single best-ordered waiter if one is present. Anything left
    /// undelivered is enqueued -- at the front for
    /// [`SendMode::Urgent`], the back for [`SendMode::Normal`], or the
    /// back for an unabsorbed broadcast. Fails with
    /// [`CoreError::NoMem`] if the hard limit is reached and no waiter
    /// absorbed the message.
    fn send_message(&self, msg: Arc<Message>, mode: SendMode) -> CoreResult<()> {
        match mode {
            SendMode::Broadcast => {
                let mut delivered = 0usize;
                loop {
                    let got = self.sync.grant_matching(|slot: &Slot| match slot {
                        Slot::WaitingReceive => {
                            msg.retain();
                            Some(Slot::GotMessage(MsgRef::new(msg.clone())))
                        }
                        Slot::WaitingRead(cap) => Some(Slot::GotBytes(truncate(&msg, *cap))),
                        _ => None,
                    })?;
                    if got.is_none() {
                        break;
                    }
                    delivered += 1;
                }
                if delivered == 0 {
                    self.enqueue(msg, false)
                } else {
                    if msg.release() {
                        self.heap.free(msg.heap_offset, msg.heap_size);
                    }
                    Ok(())
                }
            }
            SendMode::Urgent | SendMode::Normal => {
                let got = self.sync.grant_matching(|slot: &Slot| match slot {
                    Slot::WaitingReceive => {
                        msg.retain();
                        Some(Slot::GotMessage(MsgRef::new(msg.clone())))
                    }
                    Slot::WaitingRead(cap) => Some(Slot::GotBytes(truncate(&msg, *cap))),
                    _ => None,
                })?;
                match got {
                    Some(_) => {
                        if msg.release() {
                            self.heap.free(msg.heap_offset, msg.heap_size);
                        }
                        Ok(())
                    }
                    None => self.enqueue(msg, mode == SendMode::Urgent),
                }
            }
        }
    }

    fn enqueue(&self, msg: Arc<Message>, front: bool) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = self.limit {
            if state.mcount >= limit {
                drop(state);
                if msg.release() {
                    self.heap.free(msg.heap_offset, msg.heap_size);
                }
                return Err(CoreError::NoMem);
            }
        }
        if front {
            state.msgs.push_front(msg);
        } else {
            state.msgs.push_back(msg);
        }
        state.mcount += 1;
        Ok(())
    }

    /// Pops the oldest message (the queue's current front, regardless
    /// of whether it arrived via `Urgent` or `Normal` send), blocking
    /// according to `timeout` if the queue is empty.
    pub fn receive(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        timeout: Timeout,
    ) -> CoreResult<MsgRef> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.msgs.pop_front() {
            state.mcount -= 1;
            return Ok(MsgRef::new(msg));
        }
        drop(state);
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let prio = thread.effective_priority();
        match self.sync.wait_grant(thread, prio, Slot::WaitingReceive, timeout)? {
            Slot::GotMessage(m) => Ok(m),
            _ => unreachable!("wait_grant only returns a granted slot"),
        }
    }

    /// Pops the oldest message and copies up to `buf.len()` bytes of its
    /// payload into `buf`, truncating a larger message, then frees the
    /// message. Blocks according to `timeout` if the queue is empty; the
    /// zero-copy form of [`MsgQueue::write`] delivers directly here
    /// without ever populating the queue.
    pub fn read(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> CoreResult<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.msgs.pop_front() {
            state.mcount -= 1;
            drop(state);
            let bytes = truncate(&msg, buf.len());
            let n = bytes.len();
            buf[..n].copy_from_slice(&bytes);
            if msg.release() {
                self.heap.free(msg.heap_offset, msg.heap_size);
            }
            return Ok(n);
        }
        drop(state);
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let prio = thread.effective_priority();
        match self
            .sync
            .wait_grant(thread, prio, Slot::WaitingRead(buf.len()), timeout)?
        {
            Slot::GotBytes(bytes) => {
                let n = bytes.len();
                buf[..n].copy_from_slice(&bytes);
                Ok(n)
            }
            _ => unreachable!("wait_grant only returns a granted slot"),
        }
    }

    /// Explicitly releases a message obtained from [`MsgQueue::alloc`]
    /// or [`MsgQueue::receive`]. Fails with [`CoreError::Invalid`] if
    /// this exact handle (or a clone sharing its ownership slot) was
    /// already freed.
    pub fn free(&self, msg: MsgRef) -> CoreResult<()> {
        if msg.freed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Invalid);
        }
        if msg.msg.release() {
            self.heap.free(msg.msg.heap_offset, msg.msg.heap_size);
        }
        Ok(())
    }

    /// Drops every queued message, freeing each.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let msgs = std::mem::take(&mut state.msgs);
        state.mcount = 0;
        drop(state);
        for msg in msgs {
            if msg.release() {
                self.heap.free(msg.heap_offset, msg.heap_size);
            }
        }
    }
}

fn truncate(msg: &Message, cap: usize) -> Vec<u8> {
    let buf = msg.payload.lock().unwrap();
    let take = buf.len().min(cap);
    buf[..take].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn cfg() -> QueueConfig {
        QueueConfig {
            capacity_bytes: 4096,
            limit: None,
            max_msg_size: None,
            order: QueueOrder::Fifo,
        }
    }

    #[test]
    fn alloc_fill_send_receive_round_trip() {
        let q = MsgQueue::new(Name::new("q").unwrap(), cfg());
        let t = crate::thread::current();
        let m = q.alloc(&t, 5, Timeout::NonBlocking).unwrap();
        m.fill(b"hello").unwrap();
        q.send(m, SendMode::Normal).unwrap();
        assert_eq!(q.mcount(), 1);
        let got = q.receive(&t, Timeout::NonBlocking).unwrap();
        assert_eq!(got.to_vec(), b"hello");
        q.free(got).unwrap();
    }

    #[test]
    fn urgent_send_prepends_ahead_of_normal() {
        let q = MsgQueue::new(Name::new("q").unwrap(), cfg());
        let t = crate::thread::current();
        let m1 = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        m1.fill(b"A").unwrap();
        q.send(m1, SendMode::Normal).unwrap();
        let m2 = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        m2.fill(b"B").unwrap();
        q.send(m2, SendMode::Urgent).unwrap();

        let first = q.receive(&t, Timeout::NonBlocking).unwrap();
        assert_eq!(first.to_vec(), b"B");
        let second = q.receive(&t, Timeout::NonBlocking).unwrap();
        assert_eq!(second.to_vec(), b"A");
    }

    #[test]
    fn hard_limit_returns_nomem() {
        let q = MsgQueue::new(
            Name::new("q").unwrap(),
            QueueConfig { limit: Some(1), ..cfg() },
        );
        let t = crate::thread::current();
        let m1 = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        q.send(m1, SendMode::Normal).unwrap();
        let m2 = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        assert_eq!(q.send(m2, SendMode::Normal).unwrap_err(), CoreError::NoMem);
    }

    #[test]
    fn double_free_is_rejected() {
        let q = MsgQueue::new(Name::new("q").unwrap(), cfg());
        let t = crate::thread::current();
        let m = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        let clone = m.clone();
        q.free(m).unwrap();
        assert_eq!(q.free(clone).unwrap_err(), CoreError::Invalid);
    }

    #[test]
    fn zero_copy_write_delivers_directly_to_a_waiting_reader() {
        let q = Arc::new(MsgQueue::new(Name::new("q").unwrap(), cfg()));
        let q2 = q.clone();
        let reader = thread::spawn(move || {
            let t = crate::thread::current();
            let mut buf = [0u8; 8];
            let n = q2
                .read(&t, &mut buf, Timeout::Relative(Duration::from_millis(300)))
                .unwrap();
            buf[..n].to_vec()
        });
        thread::sleep(Duration::from_millis(30));
        let t = crate::thread::current();
        q.write(&t, b"zerocopy", SendMode::Normal, Timeout::NonBlocking)
            .unwrap();
        assert_eq!(reader.join().unwrap(), b"zerocopy");
        // The fast path never touched the queue.
        assert_eq!(q.mcount(), 0);
    }

    #[test]
    fn broadcast_shares_one_message_with_refcount_per_receiver() {
        // Scenario from spec.md §8 #4: three receivers blocked on
        // `receive`, a broadcast send wakes all three with the same
        // payload, and each must independently free it.
        let q = Arc::new(MsgQueue::new(Name::new("q").unwrap(), cfg()));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                let t = crate::thread::current();
                let m = q
                    .receive(&t, Timeout::Relative(Duration::from_millis(300)))
                    .unwrap();
                let payload = m.to_vec();
                q.free(m).unwrap();
                payload
            }));
        }
        thread::sleep(Duration::from_millis(30));
        let t = crate::thread::current();
        let m = q.alloc(&t, 3, Timeout::NonBlocking).unwrap();
        m.fill(b"all").unwrap();
        q.send(m, SendMode::Broadcast).unwrap();

        for h in handles {
            assert_eq!(h.join().unwrap(), b"all");
        }
        assert_eq!(q.mcount(), 0);
    }

    #[test]
    fn broadcast_with_no_waiters_enqueues_a_single_message() {
        let q = MsgQueue::new(Name::new("q").unwrap(), cfg());
        let t = crate::thread::current();
        let m = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
        m.fill(b"x").unwrap();
        q.send(m, SendMode::Broadcast).unwrap();
        assert_eq!(q.mcount(), 1);
        let got = q.receive(&t, Timeout::NonBlocking).unwrap();
        assert_eq!(got.to_vec(), b"x");
    }

    #[test]
    fn flush_drops_every_queued_message() {
        let q = MsgQueue::new(Name::new("q").unwrap(), cfg());
        let t = crate::thread::current();
        for _ in 0..3 {
            let m = q.alloc(&t, 1, Timeout::NonBlocking).unwrap();
            q.send(m, SendMode::Normal).unwrap();
        }
        assert_eq!(q.mcount(), 3);
        q.flush();
        assert_eq!(q.mcount(), 0);
    }
}
