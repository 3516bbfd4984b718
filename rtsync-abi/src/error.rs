// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error codes surfaced at the core's boundary.
//!
//! Flavor facades remap these onto their own numeric spaces (`ERR_TIMEOUT`,
//! `ERR_QKILLD`, ...); that mapping lives outside this crate entirely. The
//! core only ever hands back one of these.

/// An error returned by a core operation.
///
/// Validation errors ([`CoreError::Invalid`], [`CoreError::Perm`], ...) are
/// recovered locally by the core: the object's state is unchanged and the
/// caller may retry or give up. Wait outcomes
/// ([`CoreError::TimedOut`], [`CoreError::WouldBlock`],
/// [`CoreError::Interrupted`], [`CoreError::Removed`]) propagate unchanged
/// from whatever blocking call produced them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Null/misaligned handle, bad magic, malformed mode bits, or a size
    /// that can never fit the target object.
    #[error("invalid argument")]
    Invalid,
    /// Operation attempted from a context that forbids it (e.g. a blocking
    /// call from alarm-handler context).
    #[error("operation not permitted in this context")]
    Perm,
    /// The backing arena or registry is exhausted.
    #[error("out of memory")]
    NoMem,
    /// A unique-insert naming operation found the name already taken.
    #[error("name already exists")]
    Exist,
    /// A lookup found no object under the given name.
    #[error("no such object")]
    NotFound,
    /// A blocking call exceeded its deadline.
    #[error("timed out")]
    TimedOut,
    /// A zero-timeout call found the operation could not complete
    /// immediately.
    #[error("would block")]
    WouldBlock,
    /// The waiting thread was cancelled or otherwise interrupted.
    #[error("interrupted")]
    Interrupted,
    /// The object the caller was waiting on, or operating on, was deleted.
    /// Terminal: the caller must not touch the descriptor again.
    #[error("object was deleted")]
    Removed,
    /// Deletion was attempted on an object that is still in use.
    #[error("object is busy")]
    Busy,
    /// Lock acquisition would deadlock (e.g. re-entering a non-recursive
    /// lock already held by the caller).
    #[error("would deadlock")]
    Deadlock,
    /// A mutex's previous owner died while holding it. Recoverable: the
    /// mutex is now marked inconsistent and must be reinitialized.
    #[error("owner died holding the mutex")]
    OwnerDead,
    /// A fixed-capacity pool (partition, message queue with a hard limit)
    /// has no room left and no waiter could absorb the request.
    #[error("no buffer space available")]
    NoBufs,
    /// Transient resource exhaustion distinct from [`CoreError::NoMem`];
    /// retrying later may succeed.
    #[error("resource temporarily unavailable")]
    Again,
}

impl CoreError {
    /// Maps this error onto the POSIX errno space named in the core's
    /// external-interface contract. Flavor facades typically start from
    /// this and then apply their own renumbering on top.
    pub const fn as_errno(self) -> &'static str {
        match self {
            CoreError::Invalid => "EINVAL",
            CoreError::Perm => "EPERM",
            CoreError::NoMem => "ENOMEM",
            CoreError::Exist => "EEXIST",
            CoreError::NotFound => "ENOENT",
            CoreError::TimedOut => "ETIMEDOUT",
            CoreError::WouldBlock => "EWOULDBLOCK",
            CoreError::Interrupted => "EINTR",
            CoreError::Removed => "EIDRM",
            CoreError::Busy => "EBUSY",
            CoreError::Deadlock => "EDEADLK",
            CoreError::OwnerDead => "EOWNERDEAD",
            CoreError::NoBufs => "ENOBUFS",
            CoreError::Again => "EAGAIN",
        }
    }

    /// True for the wait outcomes that propagate out of a blocking call
    /// unchanged, as opposed to validation errors recovered locally.
    pub const fn is_wait_outcome(self) -> bool {
        matches!(
            self,
            CoreError::TimedOut
                | CoreError::WouldBlock
                | CoreError::Interrupted
                | CoreError::Removed
        )
    }
}
