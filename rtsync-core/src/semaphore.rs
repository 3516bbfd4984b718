// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore with FIFO/priority waiters and an optional pulse
//! mode, per spec.md §4.7.

use std::sync::{Arc, Mutex};

use rtsync_abi::{CoreError, CoreResult, Magic, Name, QueueOrder, Timeout};

use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

/// A counting semaphore, per spec.md §4.7.
///
/// In pulse mode, `post` (`V`) wakes at most one waiter but never
/// increments the counter, so the value stays at 0 whenever nobody is
/// waiting -- a deliberate "lost signal" semantics distinct from the
/// ordinary mode, which always remembers a post with nobody to receive
/// it by incrementing.
pub struct Semaphore {
    magic: Magic,
    name: Name,
    value: Mutex<i32>,
    pulse: bool,
    /// True if the create-time flag requests the "negative value reports
    /// waiter count" convention inherited from the original pSOS/Alchemy
    /// semaphore, rather than clamping the reported value at 0.
    report_negative: bool,
    sync: Arc<SyncObject<()>>,
}

impl Semaphore {
    pub fn new(name: Name, initial: i32, order: QueueOrder, report_negative: bool) -> Arc<Self> {
        log::debug!(target: "rtsync_core::semaphore", "create semaphore {name} initial={initial}");
        Arc::new(Semaphore {
            magic: Magic::Semaphore,
            name,
            value: Mutex::new(initial),
            pulse: false,
            report_negative,
            sync: Arc::new(SyncObject::new(order)),
        })
    }

    /// Constructs a pulse-mode semaphore. Per spec.md §4.7 the initial
    /// value must be 0.
    pub fn pulse(name: Name, order: QueueOrder) -> Arc<Self> {
        log::debug!(target: "rtsync_core::semaphore", "create pulse semaphore {name}");
        Arc::new(Semaphore {
            magic: Magic::Semaphore,
            name,
            value: Mutex::new(0),
            pulse: true,
            report_negative: false,
            sync: Arc::new(SyncObject::new(order)),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// The reported counter value. Negative in the
    /// waiter-count-reporting convention while waiters are queued and
    /// that convention was requested at create.
    pub fn value(&self) -> i32 {
        let v = *self.value.lock().unwrap();
        if self.report_negative {
            v
        } else {
            v.max(0)
        }
    }

    /// `P`: waits for the semaphore to become available.
    pub fn wait(self: &Arc<Self>, thread: &Arc<ThreadObject>, timeout: Timeout) -> CoreResult<()> {
        let mut v = self.value.lock().unwrap();
        if *v > 0 {
            *v -= 1;
            return Ok(());
        }
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        if self.report_negative {
            *v -= 1;
        }
        drop(v);
        let prio = thread.effective_priority();
        match self.sync.wait_grant(thread, prio, (), timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.report_negative {
                    *self.value.lock().unwrap() += 1;
                }
                Err(e)
            }
        }
    }

    /// `V`: releases the semaphore. Wakes the head waiter if one is
    /// present; otherwise increments the counter (except in pulse mode,
    /// where a post with nobody waiting is simply lost).
    pub fn post(&self) -> CoreResult<()> {
        let mut v = self.value.lock().unwrap();
        if self.sync.count_grant() > 0 {
            if self.report_negative {
                *v += 1;
            }
            drop(v);
            self.sync.grant_one()?;
            return Ok(());
        }
        if !self.pulse {
            *v += 1;
        }
        Ok(())
    }

    /// Wakes every waiter and resets the counter to 0, per spec.md
    /// §4.7's `broadcast`.
    pub fn broadcast(&self) -> CoreResult<usize> {
        let mut v = self.value.lock().unwrap();
        *v = 0;
        drop(v);
        self.sync.grant_all()
    }

    pub fn waiter_count(&self) -> usize {
        self.sync.count_grant()
    }
}
