// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive, priority-inheriting mutex.
//!
//! Ownership, recursion depth, and the priority-inheritance boost are all
//! kept under the same lock as the wait queue, since a correct unlock has
//! to update all three atomically: hand the object to the next waiter (or
//! clear ownership), pop this thread's inherited boost, and push a fresh
//! boost onto whichever thread is granted ownership next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use rtsync_abi::{CoreError, CoreResult, Priority, QueueOrder, Timeout};

use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

/// Identifies a thread for ownership bookkeeping without holding a strong
/// reference to its [`ThreadObject`] (a mutex must not keep an owner alive
/// past its own lifetime).
#[derive(Clone)]
struct Owner {
    id: ThreadId,
    priority: Priority,
    depth: u32,
}

struct Inner {
    owner: Option<Owner>,
    /// Set when an owning thread dies without unlocking (modeled here as
    /// an explicit [`RecursivePiMutex::abandon`] call, since this crate has
    /// no process-death notion of its own). The next locker observes
    /// [`CoreError::OwnerDead`] exactly once and may call
    /// [`RecursivePiMutex::consistent`] to clear it.
    owner_dead: bool,
}

/// A recursive mutual-exclusion lock with priority inheritance and POSIX
/// robust-mutex semantics.
///
/// Unlike a plain binary [`crate::semaphore::Semaphore`], a mutex tracks
/// *who* owns it: the owning thread may re-acquire it without blocking
/// (recursion), and while a higher-priority thread waits on it the owner
/// temporarily inherits that thread's priority so it cannot be preempted by
/// intermediate-priority threads and stall the handoff (the classic
/// priority-inversion fix).
pub struct RecursivePiMutex {
    sync: Arc<SyncObject<(ThreadId, Priority)>>,
    inner: Mutex<Inner>,
    /// Count of condvars currently bound to this mutex's identity, per
    /// spec.md §4.5's "delete fails ... if still bound to any condvar."
    bound_condvars: AtomicUsize,
}

impl RecursivePiMutex {
    pub fn new() -> Arc<Self> {
        Arc::new(RecursivePiMutex {
            sync: Arc::new(SyncObject::new(QueueOrder::Priority)),
            inner: Mutex::new(Inner {
                owner: None,
                owner_dead: false,
            }),
            bound_condvars: AtomicUsize::new(0),
        })
    }

    pub(crate) fn bind_condvar(&self) {
        self.bound_condvars.fetch_add(1, Ordering::SeqCst);
    }

    /// Deletes the mutex. Fails with [`CoreError::Busy`] if currently
    /// held, or if a condvar is still bound to it, per spec.md §4.5.
    pub fn delete(&self) -> CoreResult<()> {
        if self.is_locked() {
            return Err(CoreError::Busy);
        }
        if self.bound_condvars.load(Ordering::SeqCst) > 0 {
            return Err(CoreError::Busy);
        }
        self.sync.destroy();
        Ok(())
    }

    /// Acquires the mutex, blocking according to `timeout` if it is
    /// currently owned by another thread.
    ///
    /// Returns `Ok(())` on an ordinary acquisition. Returns
    /// `Err(CoreError::OwnerDead)` the first time a lock is granted after
    /// the previous owner was marked abandoned; the new owner holds the
    /// lock in that case too (POSIX robust-mutex behavior) and must call
    /// [`RecursivePiMutex::consistent`] before unlocking to clear the
    /// abandoned flag for the mutex's future owners.
    pub fn lock(self: &Arc<Self>, thread: &Arc<ThreadObject>, timeout: Timeout) -> CoreResult<()> {
        let my_id = thread.id();
        let my_prio = thread.effective_priority();
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.owner {
            None => {
                inner.owner = Some(Owner {
                    id: my_id,
                    priority: my_prio,
                    depth: 1,
                });
                let dead = std::mem::replace(&mut inner.owner_dead, false);
                if dead {
                    log::warn!(
                        target: "rtsync_core::mutex",
                        "lock granted to thread {my_id:?} after previous owner was abandoned (EOWNERDEAD)"
                    );
                    Err(CoreError::OwnerDead)
                } else {
                    Ok(())
                }
            }
            Some(owner) if owner.id == my_id => {
                owner.depth += 1;
                Ok(())
            }
            Some(owner) => {
                if timeout.is_non_blocking() {
                    return Err(CoreError::WouldBlock);
                }
                let owner_id = owner.id;
                if my_prio.is_more_urgent_than(owner.priority) {
                    if let Some(owner_thread) = crate::thread::lookup(owner_id) {
                        owner_thread.push_inherited(my_prio);
                    }
                    owner.priority = my_prio;
                }
                drop(inner);
                // `unlock` installs the granted waiter as owner itself
                // (under `inner`'s lock) before waking it, so there is no
                // barging window between being granted and taking
                // ownership here.
                self.sync.wait_grant(thread, my_prio, (my_id, my_prio), timeout)?;
                Ok(())
            }
        }
    }

    /// Releases one level of recursive ownership. When the recursion depth
    /// reaches zero, hands ownership directly to the highest-priority
    /// waiter (if any) so the handoff is atomic with respect to other
    /// lockers, and restores this thread's own priority.
    pub fn unlock(self: &Arc<Self>, thread: &Arc<ThreadObject>) -> CoreResult<()> {
        let my_id = thread.id();
        let mut inner = self.inner.lock().unwrap();
        let owner = match &mut inner.owner {
            Some(o) if o.id == my_id => o,
            Some(_) => return Err(CoreError::Perm),
            None => return Err(CoreError::Perm),
        };
        owner.depth -= 1;
        if owner.depth > 0 {
            return Ok(());
        }
        let released_priority = owner.priority;
        if released_priority.is_more_urgent_than(thread.base_priority()) {
            thread.pop_inherited(released_priority);
        }

        // Install the next owner, if any, before releasing `inner` so no
        // other locker can observe the mutex as unowned and barge ahead of
        // whichever waiter the priority-ordered queue is about to wake.
        // `grant_one_committing` pops the waiter and lets us read its
        // `(id, priority)` under the same lock acquisition that grants it,
        // so the owner we install here is always the one actually woken --
        // a waiter whose deadline fires in between is skipped in favor of
        // the next-best one instead of leaving a phantom owner behind.
        inner.owner = self.sync.grant_one_committing(|(id, priority)| Owner {
            id: id.clone(),
            priority: *priority,
            depth: 1,
        })?;
        Ok(())
    }

    /// Drops the caller's ownership fully to zero regardless of current
    /// recursion depth, handing off to the next waiter exactly as
    /// `unlock` does, and returns the depth that was in effect. Used by
    /// [`crate::condvar::Condvar::wait`] to release the mutex for the
    /// duration of the wait and later restore the same depth.
    pub(crate) fn release_fully(self: &Arc<Self>, thread: &Arc<ThreadObject>) -> CoreResult<u32> {
        let my_id = thread.id();
        let mut inner = self.inner.lock().unwrap();
        let owner = match &inner.owner {
            Some(o) if o.id == my_id => o.clone(),
            _ => return Err(CoreError::Perm),
        };
        if owner.priority.is_more_urgent_than(thread.base_priority()) {
            thread.pop_inherited(owner.priority);
        }
        inner.owner = self.sync.grant_one_committing(|(id, priority)| Owner {
            id: id.clone(),
            priority: *priority,
            depth: 1,
        })?;
        Ok(owner.depth)
    }

    fn grant_to_next(self: &Arc<Self>) {
        let _ = self.sync.grant_one();
    }

    /// Reacquires the mutex and sets the caller's recursion depth
    /// directly to `depth`, the counterpart to
    /// [`RecursivePiMutex::release_fully`].
    pub(crate) fn reacquire_to_depth(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        depth: u32,
    ) -> CoreResult<()> {
        self.lock(thread, Timeout::Infinite)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(owner) = &mut inner.owner {
            if owner.id == thread.id() {
                owner.depth = depth;
            }
        }
        Ok(())
    }

    /// Marks the mutex's current owner as dead without releasing it,
    /// modeling the robust-mutex contract for a thread that disappears
    /// while holding the lock. The next successful `lock` observes
    /// [`CoreError::OwnerDead`].
    pub fn abandon(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(owner) = inner.owner.take() {
            if let Some(t) = crate::thread::lookup(owner.id) {
                t.pop_inherited(owner.priority);
            }
            inner.owner_dead = true;
            log::warn!(
                target: "rtsync_core::mutex",
                "owner {:?} abandoned mutex while holding it (EOWNERDEAD pending)",
                owner.id
            );
        }
        drop(inner);
        self.grant_to_next();
    }

    /// Clears the abandoned flag after a new owner has restored the
    /// protected state to a consistent condition. Mirrors
    /// `pthread_mutex_consistent`.
    pub fn consistent(&self) {
        self.inner.lock().unwrap().owner_dead = false;
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.lock().unwrap().owner.as_ref().map(|o| o.id)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().owner.is_some()
    }

    pub(crate) fn sync_object(&self) -> &Arc<SyncObject<(ThreadId, Priority)>> {
        &self.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn recursive_lock_is_reentrant() {
        let m = RecursivePiMutex::new();
        let t = crate::thread::current();
        m.lock(&t, Timeout::Infinite).unwrap();
        m.lock(&t, Timeout::Infinite).unwrap();
        m.unlock(&t).unwrap();
        assert!(m.is_locked());
        m.unlock(&t).unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let m = RecursivePiMutex::new();
        let t = crate::thread::current();
        assert_eq!(m.unlock(&t).unwrap_err(), CoreError::Perm);
    }

    #[test]
    fn contended_lock_hands_off_on_unlock() {
        let m = RecursivePiMutex::new();
        let t0 = crate::thread::current();
        m.lock(&t0, Timeout::Infinite).unwrap();

        let m2 = m.clone();
        let handle = crate::thread::spawn(
            rtsync_abi::Name::new("waiter").unwrap(),
            Priority(5),
            move || {
                let t = crate::thread::current();
                m2.lock(&t, Timeout::Infinite).unwrap();
                m2.unlock(&t).unwrap();
            },
        );
        thread::sleep(Duration::from_millis(20));
        m.unlock(&t0).unwrap();
        handle.join().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn priority_inheritance_scenario_from_spec() {
        // Scenario from spec.md §8 #1: T_low (prio 1) holds M; T_high
        // (prio 3) blocks on it. While T_high is blocked, T_low's
        // effective priority rises to 3. After T_low releases, it drops
        // back to 1.
        use std::sync::mpsc;

        let m = RecursivePiMutex::new();
        let (low_obj_tx, low_obj_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (restored_tx, restored_rx) = mpsc::channel();

        let m_low = m.clone();
        let low = crate::thread::spawn(
            rtsync_abi::Name::new("low").unwrap(),
            Priority(1),
            move || {
                let t = crate::thread::current();
                m_low.lock(&t, Timeout::Infinite).unwrap();
                low_obj_tx.send(t.clone()).unwrap();
                release_rx.recv().unwrap();
                m_low.unlock(&t).unwrap();
                restored_tx.send(t.effective_priority()).unwrap();
            },
        );

        let low_thread = low_obj_rx.recv().unwrap();
        assert_eq!(low_thread.effective_priority(), Priority(1));

        let m_high = m.clone();
        let high = crate::thread::spawn(
            rtsync_abi::Name::new("high").unwrap(),
            Priority(3),
            move || {
                let t = crate::thread::current();
                m_high.lock(&t, Timeout::Infinite).unwrap();
                m_high.unlock(&t).unwrap();
            },
        );

        thread::sleep(Duration::from_millis(30));
        assert_eq!(low_thread.effective_priority(), Priority(3));

        release_tx.send(()).unwrap();
        low.join().unwrap();
        high.join().unwrap();
        assert_eq!(restored_rx.recv().unwrap(), Priority(1));
    }

    #[test]
    fn abandoned_owner_surfaces_owner_dead_once() {
        let m = RecursivePiMutex::new();
        let t0 = crate::thread::current();
        m.lock(&t0, Timeout::Infinite).unwrap();
        m.abandon();

        let res = m.lock(&crate::thread::current(), Timeout::NonBlocking);
        assert_eq!(res, Err(CoreError::OwnerDead));
        m.consistent();
        m.unlock(&crate::thread::current()).unwrap();
    }
}
