// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared-arena backing store and the handle -> control-block
//! resolution path described in spec.md §4.2 / §6.
//!
//! A control block lives in one of two places, chosen at `create` time:
//! a process-private allocation (an ordinary [`crate::alloc::FreeListAllocator`]
//! over owned memory), or a [`SharedArena`], a `memmap2`-backed region
//! that other processes can attach by mapping the same backing file.
//! Every pointer stored *inside* a control block that crosses process
//! boundaries is kept as a signed offset from the arena base rather than
//! an absolute address, so the same bytes resolve correctly regardless
//! of where each process happens to map the arena.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapMut;

use rtsync_abi::{CoreError, CoreResult, Magic};

/// A memory-mapped arena other processes can attach to by name.
///
/// This models the "shared arena" half of the create-time choice in
/// spec.md §3/§9: control blocks placed here must store only
/// arena-relative offsets for anything that needs to remain valid across
/// processes, since [`SharedArena::base_ptr`] differs between mappings
/// of the same backing file.
pub struct SharedArena {
    map: MmapMut,
}

impl SharedArena {
    /// Creates (or truncates and reopens) a backing file at `path` sized
    /// to `len` bytes and maps it read/write. Mirrors the external
    /// `arena_init(base, size)` contract from spec.md §6, specialized to
    /// a named file-backed mapping rather than a caller-supplied base
    /// address, since a plain OS-thread/process implementation has no
    /// other portable way to let a second process attach the same
    /// memory.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(len as u64)?;
        // Safety: the file is exclusively owned by this call chain for
        // the duration of the mapping and sized to `len` above.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(SharedArena { map })
    }

    /// Opens an existing backing file at `path`, mapping however many
    /// bytes it currently holds. Used by a second process attaching an
    /// arena a peer already created.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // Safety: see `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(SharedArena { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Resolves a signed offset from this mapping's base to a raw
    /// pointer. Returns `None` if the offset (plus the requested
    /// trailing `len` bytes) would fall outside the mapping, the
    /// `arena_validate` half of the arena contract in spec.md §6.
    pub fn resolve(&self, offset: isize, len: usize) -> Option<*mut u8> {
        let end = offset.checked_add(len as isize)?;
        if offset < 0 || end as usize > self.map.len() {
            return None;
        }
        // Safety: bounds were just checked against the mapping length.
        Some(unsafe { self.base_ptr().offset(offset) })
    }

    /// Computes the signed offset of `ptr` from this mapping's base, for
    /// storing inside a control block so it is portable across
    /// processes mapping the same file at different addresses.
    pub fn offset_of(&self, ptr: *const u8) -> isize {
        unsafe { ptr.offset_from(self.base_ptr()) }
    }
}

/// A handle resolved against a specific backing arena, re-validating the
/// target control block's magic tag under its own sync-object lock
/// before every dereference, per spec.md §4.2.
pub struct ArenaRef<T> {
    ptr: *const MagicHeader<T>,
    expected: Magic,
    /// Kept alive so a process-private arena isn't dropped out from
    /// under a live reference; shared arenas are held by the caller
    /// separately.
    _keepalive: Option<Arc<SharedArena>>,
}

// Safety: `ArenaRef` only ever hands out access through `resolve`, which
// re-checks the magic under the target's own lock; the pointee is
// expected to implement its own interior synchronization (every L2
// primitive in this crate does).
unsafe impl<T: Send + Sync> Send for ArenaRef<T> {}
unsafe impl<T: Send + Sync> Sync for ArenaRef<T> {}

/// The layout every control block begins with: a magic tag the
/// reference layer checks before trusting anything else in the block.
#[repr(C)]
pub struct MagicHeader<T> {
    pub magic: Magic,
    pub body: T,
}

impl<T> ArenaRef<T> {
    /// Wraps a raw pointer to a magic-tagged control block living in
    /// `arena` (or process-private memory, if `arena` is `None`).
    ///
    /// # Safety
    /// `ptr` must point to a live `MagicHeader<T>` for as long as this
    /// `ArenaRef` (and anything cloned from it) is in use.
    pub unsafe fn new(
        ptr: *const MagicHeader<T>,
        expected: Magic,
        arena: Option<Arc<SharedArena>>,
    ) -> Self {
        ArenaRef {
            ptr,
            expected,
            _keepalive: arena,
        }
    }

    /// Validates the magic tag and returns a reference to the control
    /// block's body. Returns `Err(CoreError::Invalid)` on a magic
    /// mismatch -- a corrupted, aliased, or already-finalized handle.
    ///
    /// Callers that need the re-check-under-lock guarantee from
    /// spec.md §4.2 should call this again immediately after acquiring
    /// the target's sync-object lock, since a concurrent delete can
    /// race an unlocked check.
    pub fn resolve(&self) -> CoreResult<&T> {
        // Safety: the pointee's lifetime is the caller's responsibility,
        // established when this `ArenaRef` was constructed.
        let header = unsafe { &*self.ptr };
        if header.magic != self.expected {
            return Err(CoreError::Invalid);
        }
        Ok(&header.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("rtsync-arena-test-{tag}-{nanos}"))
    }

    #[test]
    fn round_trips_an_offset() {
        let path = tmp_path("roundtrip");
        let arena = SharedArena::create(&path, 4096).unwrap();
        let ptr = arena.resolve(128, 16).unwrap();
        let off = arena.offset_of(ptr);
        assert_eq!(off, 128);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_out_of_bounds_offsets() {
        let path = tmp_path("oob");
        let arena = SharedArena::create(&path, 64).unwrap();
        assert!(arena.resolve(60, 16).is_none());
        assert!(arena.resolve(-1, 1).is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let mut header = MagicHeader {
            magic: Magic::Mutex,
            body: 42u32,
        };
        let r = unsafe { ArenaRef::new(&header as *const _, Magic::EventGroup, None) };
        assert_eq!(r.resolve().unwrap_err(), CoreError::Invalid);
        header.magic = Magic::EventGroup;
        let r2 = unsafe { ArenaRef::new(&header as *const _, Magic::EventGroup, None) };
        assert_eq!(*r2.resolve().unwrap(), 42);
    }
}
