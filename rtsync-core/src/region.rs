// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! pSOS-style region: a fixed-interior allocator with an explicit usage
//! cap, per spec.md §4.10. Shares its requeue-on-free scan with
//! [`crate::heap::Heap`]; the two are kept as separate types because a
//! region additionally tracks a `used`/`length` cap independent of how
//! fragmented the backing arena is, and exposes `force_delete`.

use std::sync::{Arc, Mutex};

use rtsync_abi::{CoreError, CoreResult, Magic, Name, QueueOrder, Timeout};

use crate::alloc::FreeListAllocator;
use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

#[derive(Copy, Clone)]
enum Slot {
    Requested(usize),
    Granted(usize),
}

struct Inner {
    alloc: FreeListAllocator,
    used: usize,
    length: usize,
}

/// A fixed-interior allocator with a usage cap, per spec.md §4.10.
///
/// Unlike [`crate::heap::Heap`], which owns a generic arena of its own, a
/// pSOS region is built over a caller-supplied interior: the application
/// hands the region its backing bytes at create time, and the region's
/// allocator only ever borrows them (see `FreeListAllocator::new_borrowed`).
/// `storage` exists solely to keep that arena alive for as long as the
/// region does.
pub struct Region {
    magic: Magic,
    name: Name,
    inner: Mutex<Inner>,
    sync: Arc<SyncObject<Slot>>,
    force_delete: bool,
    unit_size: usize,
    storage: Box<[u8]>,
}

impl Region {
    /// Creates a region over the caller-supplied `storage` arena, with
    /// `unit_size` the minimum allocation granularity (spec.md §3
    /// requires this be a power of two, at or above some implementation
    /// minimum; `unit_size` is used only as the allocator's alignment
    /// here). The region takes ownership of `storage` for its own
    /// lifetime, matching pSOS's fixed-interior semantics.
    pub fn new(
        name: Name,
        mut storage: Box<[u8]>,
        unit_size: usize,
        order: QueueOrder,
        force_delete: bool,
    ) -> CoreResult<Arc<Self>> {
        if unit_size == 0 || !unit_size.is_power_of_two() {
            return Err(CoreError::Invalid);
        }
        let length = storage.len();
        log::debug!(target: "rtsync_core::region", "create region {name} length={length}");
        let base = storage.as_mut_ptr();
        // Safety: `base`/`length` describe `storage`, which this `Region`
        // keeps alive in its own `storage` field for exactly as long as
        // the allocator built here may hand out pointers into it.
        let alloc = unsafe { FreeListAllocator::new_borrowed(base, length) };
        Ok(Arc::new(Region {
            magic: Magic::Region,
            name,
            inner: Mutex::new(Inner {
                alloc,
                used: 0,
                length,
            }),
            sync: Arc::new(SyncObject::new(order)),
            force_delete,
            unit_size,
            storage,
        }))
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn used(&self) -> usize {
        self.inner.lock().unwrap().used
    }

    pub fn length(&self) -> usize {
        self.inner.lock().unwrap().length
    }

    /// Reserves `size` bytes, blocking (unless `timeout` is
    /// non-blocking) while `used + size > length`.
    pub fn getseg(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        size: usize,
        timeout: Timeout,
    ) -> CoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.used + size <= inner.length {
            if let Some(off) = inner.alloc.alloc(size, self.unit_size) {
                inner.used += size;
                return Ok(off);
            }
        }
        drop(inner);
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let prio = thread.effective_priority();
        match self
            .sync
            .wait_grant(thread, prio, Slot::Requested(size), timeout)?
        {
            Slot::Granted(off) => Ok(off),
            Slot::Requested(_) => unreachable!("wait_grant only returns a granted slot"),
        }
    }

    /// Releases `size` bytes at `offset`, then performs the same
    /// waiter-requeue scan as [`crate::heap::Heap::free`], bounded
    /// additionally by the region's usage cap.
    pub fn retseg(&self, offset: usize, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.alloc.free(offset, size);
        inner.used = inner.used.saturating_sub(size);
        loop {
            let unit = self.unit_size;
            let length = inner.length;
            let used = &mut inner.used;
            let alloc = &mut inner.alloc;
            let granted = self.sync.grant_matching(|slot: &Slot| match slot {
                Slot::Requested(want) if *used + want <= length && alloc.can_fit(*want, unit) => {
                    let off = alloc
                        .alloc(*want, unit)
                        .expect("can_fit just confirmed this allocation succeeds");
                    *used += want;
                    Some(Slot::Granted(off))
                }
                _ => None,
            });
            match granted {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }

    /// Destroys the region. Fails with [`CoreError::Busy`] unless no
    /// bytes are currently reserved, unless `force_delete` was set at
    /// create, per spec.md §4.10.
    pub fn delete(&self) -> CoreResult<()> {
        if !self.force_delete && self.used() > 0 {
            return Err(CoreError::Busy);
        }
        self.sync.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getseg_retseg_round_trip() {
        let r = Region::new(
            Name::new("r").unwrap(),
            vec![0u8; 1024].into_boxed_slice(),
            16,
            QueueOrder::Fifo,
            false,
        )
        .unwrap();
        let t = crate::thread::current();
        let off = r.getseg(&t, 256, Timeout::NonBlocking).unwrap();
        assert_eq!(r.used(), 256);
        r.retseg(off, 256);
        assert_eq!(r.used(), 0);
    }

    #[test]
    fn getseg_blocks_when_cap_exceeded() {
        let r = Region::new(
            Name::new("r").unwrap(),
            vec![0u8; 256].into_boxed_slice(),
            16,
            QueueOrder::Fifo,
            false,
        )
        .unwrap();
        let t = crate::thread::current();
        let _off = r.getseg(&t, 256, Timeout::NonBlocking).unwrap();
        assert_eq!(
            r.getseg(&t, 16, Timeout::NonBlocking).unwrap_err(),
            CoreError::WouldBlock
        );
    }

    #[test]
    fn delete_without_force_fails_while_in_use() {
        let r = Region::new(
            Name::new("r").unwrap(),
            vec![0u8; 256].into_boxed_slice(),
            16,
            QueueOrder::Fifo,
            false,
        )
        .unwrap();
        let t = crate::thread::current();
        let _off = r.getseg(&t, 16, Timeout::NonBlocking).unwrap();
        assert_eq!(r.delete().unwrap_err(), CoreError::Busy);
    }

    #[test]
    fn force_delete_ignores_outstanding_users() {
        let r = Region::new(
            Name::new("r").unwrap(),
            vec![0u8; 256].into_boxed_slice(),
            16,
            QueueOrder::Fifo,
            true,
        )
        .unwrap();
        let t = crate::thread::current();
        let _off = r.getseg(&t, 16, Timeout::NonBlocking).unwrap();
        assert!(r.delete().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_unit_size() {
        assert_eq!(
            Region::new(
                Name::new("r").unwrap(),
                vec![0u8; 256].into_boxed_slice(),
                3,
                QueueOrder::Fifo,
                false,
            )
            .unwrap_err(),
            CoreError::Invalid
        );
    }
}
