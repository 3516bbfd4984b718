// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for the rtsync IPC/synchronization core.
//!
//! This crate holds the types that cross the boundary between the core
//! (`rtsync-core`) and anything built on top of it: handles, priorities,
//! error codes, wait ordering, and timeout/deadline plumbing. None of it
//! is specific to a particular flavor facade -- it is the vocabulary every
//! facade maps its own argument and error conventions onto.

use std::time::{Duration, Instant};

mod error;
mod handle;
mod name;

pub use error::CoreError;
pub use handle::Handle;
pub use name::Name;

/// A thread/task priority.
///
/// Higher numeric values are more urgent, matching the convention used by
/// the classic-RTOS flavors this core supports (the lowest priority is 0).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// The least urgent priority a thread can run at.
    pub const LOWEST: Priority = Priority(0);

    /// Checks whether `self` is strictly more urgent than `other`.
    ///
    /// This reads better at call sites than comparing the raw integers,
    /// since the mapping from integer to urgency is a convention rather
    /// than something the type system enforces.
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 > other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::LOWEST
    }
}

/// Ordering discipline for a sync object's grant/drain queues.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// Waiters are served in the order they arrived.
    #[default]
    Fifo,
    /// Waiters are served by descending priority, ties broken by arrival
    /// order.
    Priority,
}

/// A caller-specified wait duration, as accepted by every blocking entry
/// point in the core.
///
/// This is the in-process analog of the clock contract described for
/// facades: a tick count converted to `(sec, nsec)` collapses to one of
/// these four cases before it ever reaches the core.
#[derive(Copy, Clone, Debug)]
pub enum Timeout {
    /// Do not block at all; fail immediately if the operation cannot
    /// complete right away. Maps to `TM_NONBLOCK` at the facade boundary.
    NonBlocking,
    /// Block until the operation completes, with no time limit. Maps to
    /// `TM_INFINITE` at the facade boundary.
    Infinite,
    /// Block for at most the given duration, measured from the moment the
    /// call entered the core.
    Relative(Duration),
    /// Block until the given monotonic instant, on whatever clock the
    /// caller resolved the deadline against.
    Absolute(Instant),
}

impl Timeout {
    /// Resolves this timeout to an absolute deadline, anchored at `now` for
    /// the relative/non-blocking/infinite cases.
    ///
    /// Returns `None` for [`Timeout::Infinite`], meaning "no deadline."
    pub fn deadline_from(self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::NonBlocking => Some(now),
            Timeout::Infinite => None,
            Timeout::Relative(d) => Some(now + d),
            Timeout::Absolute(t) => Some(t),
        }
    }

    /// True if this timeout cannot possibly suspend the caller.
    pub fn is_non_blocking(self) -> bool {
        matches!(self, Timeout::NonBlocking)
    }
}

/// Runtime type tag stored as the first field of every control block, used
/// to validate a handle under lock before trusting the rest of the block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Magic {
    Mutex = 0x4d54_5831,
    EventGroup = 0x4556_4e54,
    Semaphore = 0x5345_4d41,
    Condvar = 0x434f_4e44,
    Heap = 0x4845_4150,
    Region = 0x5247_4e31,
    Partition = 0x5052_5431,
    ByteBuffer = 0x4259_5442,
    MsgQueue = 0x4d53_4751,
    Alarm = 0x414c_524d,
    Registry = 0x5247_5354,
    Thread = 0x5448_5244,
}

/// Convenience alias used throughout the core: every fallible public entry
/// point returns this.
pub type CoreResult<T> = Result<T, CoreError>;
