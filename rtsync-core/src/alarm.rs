// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot or periodic alarm/timer, per spec.md §4.14.
//!
//! An alarm has no sync object of its own: it is a timer bound to a
//! callback, not a coordination point other threads wait on. It is
//! implemented with a background thread (spawned via
//! [`crate::thread::spawn`]) parked on [`crate::thread::sleep_until`]
//! until its next deadline, invoking the stored handler and re-arming
//! itself for periodic timers. A monotonically increasing generation
//! counter is how `stop`/`start` invalidate whatever timer thread is
//! currently in flight without having to cancel or join it: a thread
//! that wakes up and finds the alarm's generation has moved on from the
//! one it was armed under simply exits instead of firing or re-arming.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtsync_abi::{CoreResult, Magic, Name, Priority};

struct Inner {
    active: bool,
    period: Option<Duration>,
    expiries: u64,
    generation: u64,
}

/// A timer bound to a callback and an optional reload interval, per
/// spec.md §4.14.
///
/// Handlers run on the alarm's own background thread, which has the
/// same restricted context spec.md §4.14 describes for a real
/// alarm-handler context: a handler should invoke only non-blocking
/// core operations. This crate has no dedicated non-preemptible context
/// to enforce that from the inside, so the restriction is a documented
/// contract on [`Alarm::start`] rather than a mechanically checked one,
/// matching how spec.md §6 treats the handler context as an external
/// collaborator's contract.
pub struct Alarm {
    magic: Magic,
    name: Name,
    inner: Mutex<Inner>,
}

/// A snapshot of an alarm's state, returned by [`Alarm::inquire`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AlarmStatus {
    pub expiries: u64,
    pub active: bool,
}

impl Alarm {
    pub fn new(name: Name) -> Arc<Self> {
        log::debug!(target: "rtsync_core::alarm", "create alarm {name}");
        Arc::new(Alarm {
            magic: Magic::Alarm,
            name,
            inner: Mutex::new(Inner {
                active: false,
                period: None,
                expiries: 0,
                generation: 0,
            }),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// Arms the alarm to fire `initial` from now, and every `period`
    /// thereafter if given (a one-shot alarm otherwise). Calling `start`
    /// again while already armed invalidates whatever timer thread is
    /// currently in flight and arms a fresh one, per spec.md §4.14's
    /// `create`/`start`/`stop` cycle.
    ///
    /// `handler` runs on a dedicated background thread; per this
    /// module's documentation it must only perform non-blocking core
    /// operations.
    pub fn start(
        self: &Arc<Self>,
        initial: Duration,
        period: Option<Duration>,
        mut handler: impl FnMut() + Send + 'static,
    ) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.active = true;
            inner.period = period;
            inner.generation
        };

        let this = self.clone();
        let thread_name = Name::anonymous("alarm", generation as u32);
        crate::thread::spawn(thread_name, Priority::LOWEST, move || {
            let mut deadline = Instant::now() + initial;
            loop {
                if crate::thread::sleep_until(deadline).is_err() {
                    return;
                }
                let period = {
                    let mut inner = this.inner.lock().unwrap();
                    if inner.generation != generation || !inner.active {
                        return;
                    }
                    inner.expiries += 1;
                    inner.period
                };
                handler();
                match period {
                    Some(p) => deadline = Instant::now() + p,
                    None => {
                        let mut inner = this.inner.lock().unwrap();
                        if inner.generation == generation {
                            inner.active = false;
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Disarms the alarm. The control block remains valid -- `inquire`
    /// still reports the expiry count so far -- and may be re-armed with
    /// another `start`, per spec.md §4.14's "stopping a periodic timer
    /// leaves the control block valid but quiescent."
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.active = false;
    }

    /// Disarms the alarm permanently. This crate has no registry
    /// membership or arena storage tied to an alarm beyond the `Arc`
    /// itself, so `delete` is just `stop` plus the usual infallible
    /// teardown; kept as a distinct, fallible-shaped entry point to
    /// match spec.md §4.14's named operation.
    pub fn delete(&self) -> CoreResult<()> {
        self.stop();
        Ok(())
    }

    /// Reports the number of times this alarm has fired and whether it
    /// is currently armed.
    pub fn inquire(&self) -> AlarmStatus {
        let inner = self.inner.lock().unwrap();
        AlarmStatus {
            expiries: inner.expiries,
            active: inner.active,
        }
    }
}
