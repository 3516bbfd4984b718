// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! pSOS-style partition: a non-blocking fixed-size block pool, per
//! spec.md §4.11.

use std::sync::Mutex;

use rtsync_abi::{CoreError, CoreResult, Magic, Name};

struct Inner {
    storage: Box<[u8]>,
    bsize: usize,
    nblocks: usize,
    used: usize,
    busy: Vec<bool>,
    /// Intrusive freelist: the head index, or `None` when empty. Each
    /// free block's own storage holds the index of the next free block
    /// (as a little-endian `usize`), in its first `size_of::<usize>()`
    /// bytes -- the classic free-list-in-place technique, specialized
    /// from [`crate::alloc::FreeListAllocator`]'s span list to
    /// fixed-size blocks.
    free_head: Option<usize>,
}

impl Inner {
    fn block_slice(&mut self, idx: usize) -> &mut [u8] {
        let start = idx * self.bsize;
        &mut self.storage[start..start + self.bsize]
    }

    fn read_next(&mut self, idx: usize) -> usize {
        let mut buf = [0u8; 8];
        let slice = self.block_slice(idx);
        buf.copy_from_slice(&slice[..8]);
        usize::from_le_bytes(buf)
    }

    fn write_next(&mut self, idx: usize, next: usize) {
        let bytes = next.to_le_bytes();
        let slice = self.block_slice(idx);
        slice[..8].copy_from_slice(&bytes);
    }
}

/// A fixed-size block pool with no blocking semantics at all: every
/// operation either completes immediately or fails, per spec.md §4.11.
pub struct Partition {
    magic: Magic,
    name: Name,
    inner: Mutex<Inner>,
}

impl Partition {
    /// Creates a partition of `nblocks` blocks, each `bsize` bytes (must
    /// be at least 8 bytes, to host the intrusive freelist pointer).
    pub fn new(name: Name, nblocks: usize, bsize: usize) -> CoreResult<Self> {
        if bsize < 8 || nblocks == 0 {
            return Err(CoreError::Invalid);
        }
        log::debug!(target: "rtsync_core::partition", "create partition {name} nblocks={nblocks} bsize={bsize}");
        let storage = vec![0u8; nblocks * bsize].into_boxed_slice();
        let mut inner = Inner {
            storage,
            bsize,
            nblocks,
            used: 0,
            busy: vec![false; nblocks],
            free_head: Some(0),
        };
        for i in 0..nblocks {
            let next = if i + 1 < nblocks { i + 1 } else { usize::MAX };
            inner.write_next(i, next);
        }
        Ok(Partition {
            magic: Magic::Partition,
            name,
            inner: Mutex::new(inner),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn nblocks(&self) -> usize {
        self.inner.lock().unwrap().nblocks
    }

    pub fn used(&self) -> usize {
        self.inner.lock().unwrap().used
    }

    pub fn block_size(&self) -> usize {
        self.inner.lock().unwrap().bsize
    }

    /// Pops the freelist head, marks it busy, and returns its block
    /// index. Fails with [`CoreError::NoBufs`] when the partition is
    /// exhausted.
    pub fn alloc(&self) -> CoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.free_head.ok_or(CoreError::NoBufs)?;
        let next = inner.read_next(head);
        inner.free_head = if next == usize::MAX { None } else { Some(next) };
        inner.busy[head] = true;
        inner.used += 1;
        Ok(head)
    }

    /// Returns block `idx` to the freelist. Fails with
    /// [`CoreError::Invalid`] if `idx` is out of range, and with
    /// [`CoreError::Busy`]'s naming-cousin -- spec.md names this
    /// specific case `EBUFFREE` -- surfaced here as
    /// [`CoreError::Invalid`] (double-free is a caller bug, the same
    /// class of error as any other malformed-argument validation
    /// failure) if `idx` is not currently allocated.
    pub fn free(&self, idx: usize) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if idx >= inner.nblocks {
            return Err(CoreError::Invalid);
        }
        if !inner.busy[idx] {
            return Err(CoreError::Invalid);
        }
        inner.busy[idx] = false;
        let old_head = inner.free_head;
        inner.write_next(idx, old_head.unwrap_or(usize::MAX));
        inner.free_head = Some(idx);
        inner.used -= 1;
        Ok(())
    }

    /// True if block `idx` is currently allocated.
    pub fn is_busy(&self, idx: usize) -> bool {
        self.inner.lock().unwrap().busy[idx]
    }

    /// Destroys the partition. Fails with [`CoreError::Busy`] if any
    /// block is still allocated.
    pub fn delete(&self) -> CoreResult<()> {
        if self.used() > 0 {
            return Err(CoreError::Busy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let p = Partition::new(Name::new("p").unwrap(), 4, 16).unwrap();
        let b = p.alloc().unwrap();
        assert_eq!(p.used(), 1);
        p.free(b).unwrap();
        assert_eq!(p.used(), 0);
        assert!(p.alloc().is_ok());
    }

    #[test]
    fn exhaustion_returns_nobufs() {
        let p = Partition::new(Name::new("p").unwrap(), 2, 16).unwrap();
        p.alloc().unwrap();
        p.alloc().unwrap();
        assert_eq!(p.alloc().unwrap_err(), CoreError::NoBufs);
    }

    #[test]
    fn double_free_is_rejected() {
        let p = Partition::new(Name::new("p").unwrap(), 2, 16).unwrap();
        let b = p.alloc().unwrap();
        p.free(b).unwrap();
        assert_eq!(p.free(b).unwrap_err(), CoreError::Invalid);
    }

    #[test]
    fn bitmap_matches_used_count() {
        let p = Partition::new(Name::new("p").unwrap(), 4, 16).unwrap();
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        let busy_count = (0..4).filter(|&i| p.is_busy(i)).count();
        assert_eq!(busy_count, p.used());
        p.free(a).unwrap();
        p.free(b).unwrap();
        assert_eq!((0..4).filter(|&i| p.is_busy(i)).count(), 0);
    }

    #[test]
    fn delete_fails_with_outstanding_blocks() {
        let p = Partition::new(Name::new("p").unwrap(), 2, 16).unwrap();
        let b = p.alloc().unwrap();
        assert_eq!(p.delete().unwrap_err(), CoreError::Busy);
        p.free(b).unwrap();
        assert!(p.delete().is_ok());
    }

    #[test]
    fn rejects_undersized_blocks() {
        assert_eq!(
            Partition::new(Name::new("p").unwrap(), 2, 4).unwrap_err(),
            CoreError::Invalid
        );
    }
}
