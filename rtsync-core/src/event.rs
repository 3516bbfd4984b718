// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event group: an unsigned bitmask with conjunctive (ALL) and
//! disjunctive (ANY) wait semantics, per spec.md §4.6.

use std::sync::Arc;

use rtsync_abi::{CoreResult, Magic, Name, QueueOrder, Timeout};

use crate::syncobj::SyncObject;
use crate::thread::ThreadObject;

/// Whether a wait is satisfied by any requested bit, or requires all of
/// them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Satisfied as soon as any bit in the requested mask is set.
    Any,
    /// Satisfied only once every bit in the requested mask is set.
    All,
}

#[derive(Clone)]
struct EventWait {
    mask: u32,
    mode: WaitMode,
    /// Filled in by `signal` with the subset of `mask` that was matched
    /// and consumed; read back out of the sync object's payload once the
    /// wait is granted.
    matched: u32,
}

/// A bitmask of events plus the sync object coordinating waiters on it.
pub struct EventGroup {
    magic: Magic,
    name: Name,
    state: std::sync::Mutex<u32>,
    sync: Arc<SyncObject<EventWait>>,
}

impl EventGroup {
    pub fn new(name: Name) -> Arc<Self> {
        log::debug!(target: "rtsync_core::event", "create event group {name}");
        Arc::new(EventGroup {
            magic: Magic::EventGroup,
            name,
            state: std::sync::Mutex::new(0),
            // Spec.md does not call for priority ordering on event-group
            // waiters; FIFO matches the original Xenomai `event.c`, which
            // scans its pended list in arrival order.
            sync: Arc::new(SyncObject::new(QueueOrder::Fifo)),
        })
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// Returns the current mask without side effects.
    pub fn current(&self) -> u32 {
        *self.state.lock().unwrap()
    }

    /// ORs `mask` into the group, then wakes every grant waiter whose
    /// condition is now satisfied, clearing from the group exactly the
    /// bits each woken waiter consumed. Bits nobody wants remain set (no
    /// lost signals), per spec.md §4.6.
    pub fn signal(&self, mask: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        *state |= mask;
        // Repeatedly grant the first satisfiable waiter and subtract
        // exactly the bits it consumed, until no remaining waiter can be
        // satisfied by what's left -- mirrors the heap's requeue-on-free
        // scan, generalized from a size condition to a bitmask one.
        loop {
            let current = *state;
            let granted = self.sync.grant_matching(|w: &EventWait| {
                if is_satisfied(w.clone(), current) {
                    let mut w = w.clone();
                    w.matched = matched_bits(&w, current);
                    Some(w)
                } else {
                    None
                }
            });
            match granted {
                Ok(Some(w)) => *state &= !w.matched,
                _ => break,
            }
        }
        *state
    }

    /// Atomic AND-NOT; returns the mask's previous value.
    pub fn clear(&self, mask: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        let prev = *state;
        *state &= !mask;
        prev
    }

    /// Blocks until `mask` is satisfied under `mode`, returning the
    /// matched subset (and clearing it from the group atomically). A
    /// wait on an empty mask returns the current state immediately.
    pub fn wait(
        self: &Arc<Self>,
        thread: &Arc<ThreadObject>,
        mask: u32,
        mode: WaitMode,
        timeout: Timeout,
    ) -> CoreResult<u32> {
        if mask == 0 {
            return Ok(self.current());
        }
        let mut state = self.state.lock().unwrap();
        let current = *state;
        let wait = EventWait {
            mask,
            mode,
            matched: 0,
        };
        if is_satisfied(wait.clone(), current) {
            let consumed = matched_bits(&wait, current);
            *state &= !consumed;
            return Ok(consumed);
        }
        drop(state);
        let prio = thread.effective_priority();
        let granted = self.sync.wait_grant(thread, prio, wait, timeout)?;
        Ok(granted.matched)
    }
}

fn is_satisfied(wait: EventWait, current: u32) -> bool {
    match wait.mode {
        WaitMode::Any => current & wait.mask != 0,
        WaitMode::All => current & wait.mask == wait.mask,
    }
}

fn matched_bits(wait: &EventWait, current: u32) -> u32 {
    match wait.mode {
        WaitMode::Any => current & wait.mask,
        WaitMode::All => wait.mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn any_wait_returns_as_soon_as_one_bit_set() {
        let g = EventGroup::new(Name::new("eg").unwrap());
        g.signal(0b001);
        let got = g
            .wait(&crate::thread::current(), 0b011, WaitMode::Any, Timeout::NonBlocking)
            .unwrap();
        assert_eq!(got, 0b001);
        assert_eq!(g.current(), 0);
    }

    #[test]
    fn conjunctive_wait_scenario_from_spec() {
        let g = EventGroup::new(Name::new("eg").unwrap());
        let g2 = g.clone();
        let waiter = thread::spawn(move || {
            g2.wait(
                &crate::thread::current(),
                0b101,
                WaitMode::All,
                Timeout::Relative(Duration::from_millis(200)),
            )
        });
        thread::sleep(Duration::from_millis(20));
        g.signal(0b001);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(g.current(), 0b001);
        g.signal(0b100);
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, 0b101);
        assert_eq!(g.current(), 0);
    }

    #[test]
    fn clear_returns_previous_value() {
        let g = EventGroup::new(Name::new("eg").unwrap());
        g.signal(0b110);
        let prev = g.clear(0b010);
        assert_eq!(prev, 0b110);
        assert_eq!(g.current(), 0b100);
    }

    #[test]
    fn unwanted_bits_are_not_lost() {
        let g = EventGroup::new(Name::new("eg").unwrap());
        g.signal(0b1000);
        let got = g.wait(&crate::thread::current(), 0b0001, WaitMode::Any, Timeout::NonBlocking);
        assert!(got.is_err());
        assert_eq!(g.current(), 0b1000);
    }
}
