// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The thread object: the per-thread record every wait operation
//! registers itself against, and the concrete default implementation of
//! the thread-library contract described in the spec's external
//! interfaces (create/join/cancel, priority get/set, sleep).
//!
//! Real classic-RTOS skins sit on top of a native thread library (pthread
//! plus an RTOS co-scheduler); that library is an external collaborator
//! whose *contract* is what this core depends on. [`ThreadObject`] is the
//! in-core half of that contract: it is what every `wait_*` call
//! registers against so that a cancellation request delivered to a thread
//! can find and unwind whatever it is currently blocked on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use rtsync_abi::{CoreError, CoreResult, Magic, Name, Priority};

/// A registered wait that can be unwound from another thread.
type Canceler = Box<dyn Fn() + Send + Sync>;

/// Per-thread bookkeeping: priority (base and PI-inherited), a name for
/// diagnostics, cooperative cancellation state, and a hook back into
/// whatever sync object the thread currently has itself parked on.
pub struct ThreadObject {
    magic: Magic,
    id: ThreadId,
    name: Mutex<Name>,
    base_priority: Mutex<Priority>,
    inherited: Mutex<Vec<Priority>>,
    cancel_requested: AtomicBool,
    cancellable: AtomicBool,
    current_wait: Mutex<Option<Canceler>>,
}

impl ThreadObject {
    fn new(id: ThreadId, name: Name, priority: Priority) -> Arc<Self> {
        Arc::new(ThreadObject {
            magic: Magic::Thread,
            id,
            name: Mutex::new(name),
            base_priority: Mutex::new(priority),
            inherited: Mutex::new(Vec::new()),
            cancel_requested: AtomicBool::new(false),
            cancellable: AtomicBool::new(false),
            current_wait: Mutex::new(None),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Name {
        *self.name.lock().unwrap()
    }

    /// The priority this thread runs at absent any inheritance boost.
    pub fn base_priority(&self) -> Priority {
        *self.base_priority.lock().unwrap()
    }

    pub fn set_base_priority(&self, p: Priority) {
        *self.base_priority.lock().unwrap() = p;
    }

    /// The priority a priority-ordered queue should schedule this thread
    /// at: the greater of its base priority and every priority it is
    /// currently inheriting from a mutex it owns.
    pub fn effective_priority(&self) -> Priority {
        let base = self.base_priority();
        self.inherited
            .lock()
            .unwrap()
            .iter()
            .copied()
            .fold(base, |acc, p| if p.is_more_urgent_than(acc) { p } else { acc })
    }

    /// Adds `p` to the set of priorities this thread inherits, called when
    /// a higher-priority thread blocks on a mutex this thread owns.
    pub(crate) fn push_inherited(&self, p: Priority) {
        self.inherited.lock().unwrap().push(p);
    }

    /// Removes one instance of `p` from the inherited set, called on
    /// mutex release or when an inheriting waiter gives up.
    pub(crate) fn pop_inherited(&self, p: Priority) {
        let mut v = self.inherited.lock().unwrap();
        if let Some(pos) = v.iter().position(|&x| x == p) {
            v.remove(pos);
        }
    }

    /// Registers the canceler for whatever wait this thread is about to
    /// enter. Returns a guard that clears the registration on drop, so a
    /// wait's cleanup runs on every exit path including stack unwind --
    /// the same cancellation-safety shape as the scoped service guard.
    pub(crate) fn enter_wait(self: &Arc<Self>, canceler: Canceler) -> WaitGuard<'_> {
        *self.current_wait.lock().unwrap() = Some(canceler);
        self.cancellable.store(true, Ordering::SeqCst);
        WaitGuard { thread: self }
    }

    /// Requests cancellation of this thread. If it is currently blocked in
    /// a registered wait, that wait is unwound immediately; otherwise the
    /// request is latched and observed the next time the thread enters a
    /// wait or checks [`ThreadObject::cancel_pending`].
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if self.cancellable.load(Ordering::SeqCst) {
            if let Some(c) = self.current_wait.lock().unwrap().as_ref() {
                c();
            }
        }
    }

    /// True if a cancellation request is outstanding against this thread.
    /// Uncancellable (non-suspending) calls never observe this; only the
    /// suspending half of `wait`/`timedwait` checks it.
    pub fn cancel_pending(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn clear_cancel(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
    }
}

/// RAII guard returned by [`ThreadObject::enter_wait`]; clears the
/// registered canceler when the wait concludes, for any reason.
pub(crate) struct WaitGuard<'a> {
    thread: &'a ThreadObject,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.thread.cancellable.store(false, Ordering::SeqCst);
        *self.thread.current_wait.lock().unwrap() = None;
    }
}

struct Registry {
    by_id: Mutex<HashMap<ThreadId, Arc<ThreadObject>>>,
    anon_serial: std::sync::atomic::AtomicU32,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        by_id: Mutex::new(HashMap::new()),
        anon_serial: std::sync::atomic::AtomicU32::new(0),
    })
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<ThreadObject>>> = const { std::cell::RefCell::new(None) };
}

/// Returns this OS thread's [`ThreadObject`], registering one with a
/// generated name and [`Priority::LOWEST`] the first time it is called
/// from a given thread.
pub fn current() -> Arc<ThreadObject> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(t) = slot.as_ref() {
            return t.clone();
        }
        let id = std::thread::current().id();
        let reg = registry();
        let serial = reg.anon_serial.fetch_add(1, Ordering::Relaxed);
        let name = Name::anonymous("thread", serial);
        let obj = ThreadObject::new(id, name, Priority::LOWEST);
        reg.by_id.lock().unwrap().insert(id, obj.clone());
        *slot = Some(obj.clone());
        obj
    })
}

/// Looks up a previously-registered thread by OS thread id, as used by
/// `cancel`/`set_schedparam`/`get_priority` in the external thread-library
/// contract.
pub fn lookup(id: ThreadId) -> Option<Arc<ThreadObject>> {
    registry().by_id.lock().unwrap().get(&id).cloned()
}

/// Spawns a new OS thread running `entry`, pre-registering its
/// [`ThreadObject`] under `name`/`priority` before the closure runs so
/// that the very first core call it makes already has full bookkeeping.
pub fn spawn<F>(name: Name, priority: Priority, entry: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(move || {
        let id = std::thread::current().id();
        let obj = ThreadObject::new(id, name, priority);
        registry().by_id.lock().unwrap().insert(id, obj.clone());
        CURRENT.with(|cell| *cell.borrow_mut() = Some(obj));
        entry();
    })
}

/// Blocks the calling thread until the given deadline, honoring
/// cancellation the same way a suspending core call would. This is the
/// `sleep(abs_ts)` primitive named in the thread-library contract.
pub fn sleep_until(deadline: Instant) -> CoreResult<()> {
    let me = current();
    loop {
        if me.cancel_pending() {
            me.clear_cancel();
            return Err(CoreError::Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}
