// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scoped service guard: a deferred-cancellation critical section
//! entered at the top of every public core operation.
//!
//! This crate has no signal-based asynchronous cancellation of its own;
//! what it does have is [`crate::thread::ThreadObject`]'s cooperative
//! cancellation flag, which [`crate::syncobj::SyncObject::wait_grant`]/
//! `wait_drain` already flip into the cancellable state for exactly the
//! duration of a blocking wait. `ServiceGuard` is the RAII wrapper a
//! public entry point holds for its whole body, so that "this call is
//! uncancellable except while actually suspended" reads as a single
//! scope rather than a pair of calls a caller could forget to pair up.

use std::cell::Cell;

thread_local! {
    /// Re-entrancy depth for the current thread. Nested entries are
    /// idempotent: only the outermost guard's drop does anything
    /// observable, matching spec.md's "nested entries are idempotent and
    /// cheap."
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// A scoped critical region around a public core entry point.
///
/// Construct one with [`ServiceGuard::enter`] at the top of every
/// operation that may modify or inspect shared state. There is no
/// failure mode: this is purely a scope marker, released on every exit
/// path (normal return, `?`, or panic-driven unwind) by `Drop`.
pub struct ServiceGuard {
    _private: (),
}

impl ServiceGuard {
    /// Enters the scoped region, incrementing the current thread's
    /// re-entrancy depth.
    pub fn enter() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        ServiceGuard { _private: () }
    }

    /// True if the calling thread is currently inside at least one
    /// `ServiceGuard`. Used by operations that must refuse to run
    /// outside task/service context (spec.md §7's `EPERM` "context"
    /// failures).
    pub fn is_active() -> bool {
        DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_are_idempotent() {
        assert!(!ServiceGuard::is_active());
        let outer = ServiceGuard::enter();
        assert!(ServiceGuard::is_active());
        {
            let _inner = ServiceGuard::enter();
            assert!(ServiceGuard::is_active());
        }
        assert!(ServiceGuard::is_active());
        drop(outer);
        assert!(!ServiceGuard::is_active());
    }
}
