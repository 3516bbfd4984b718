// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named-object registry clusters: `name -> handle` maps supporting
//! unique insertion, auto-renamed duplicate insertion, lookup, and a
//! timed bind that blocks until a name appears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Instant;

use rtsync_abi::{CoreError, CoreResult, Handle, Name, Timeout};

/// What `add_dup` does when the requested name is already taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DupPolicy {
    /// Suffix the name with a generated serial until it is unique.
    AutoSuffix,
    /// Behave like `add_unique`: fail with `CoreError::Exist`.
    Reject,
}

struct State {
    by_name: HashMap<Name, Handle>,
    anon_serial: AtomicU32,
}

/// A named-object registry cluster, per spec.md §4.3.
///
/// Distinct clusters partition the namespace (a private cluster for
/// pSOS-style partitions/regions, say, versus the shared namespace
/// every other primitive registers into) while sharing the identical
/// set of operations.
pub struct Cluster {
    state: Mutex<State>,
    /// Broadcast whenever any name is added, so a blocked `bind` can
    /// re-check. Spec.md does not specify priority ordering for
    /// registry waiters (unlike the L2 primitives' sync objects), so a
    /// plain condvar broadcast-and-recheck loop is sufficient here.
    new_object: Condvar,
}

impl Cluster {
    pub fn new() -> Self {
        Cluster {
            state: Mutex::new(State {
                by_name: HashMap::new(),
                anon_serial: AtomicU32::new(0),
            }),
            new_object: Condvar::new(),
        }
    }

    /// Inserts `obj` under `name`, failing with [`CoreError::Exist`] if
    /// the name is already taken.
    pub fn add_unique(&self, name: Name, obj: Handle) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.by_name.contains_key(&name) {
            log::warn!(target: "rtsync_core::registry", "add_unique: name {name} already exists");
            return Err(CoreError::Exist);
        }
        state.by_name.insert(name, obj);
        drop(state);
        self.new_object.notify_all();
        Ok(())
    }

    /// Inserts `obj` under `name`, applying `policy` if the name is
    /// already taken. Returns the name actually used (which may differ
    /// from `name` under [`DupPolicy::AutoSuffix`]).
    pub fn add_dup(&self, name: Name, obj: Handle, policy: DupPolicy) -> CoreResult<Name> {
        let mut state = self.state.lock().unwrap();
        if !state.by_name.contains_key(&name) {
            state.by_name.insert(name, obj);
            drop(state);
            self.new_object.notify_all();
            return Ok(name);
        }
        match policy {
            DupPolicy::Reject => Err(CoreError::Exist),
            DupPolicy::AutoSuffix => {
                loop {
                    let serial = state.anon_serial.fetch_add(1, Ordering::Relaxed);
                    let candidate = Name::anonymous(name.as_str(), serial);
                    if !state.by_name.contains_key(&candidate) {
                        state.by_name.insert(candidate, obj);
                        drop(state);
                        self.new_object.notify_all();
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    /// Looks up `name`, returning `None` if no object is registered
    /// under it.
    pub fn find(&self, name: &str) -> Option<Handle> {
        self.state.lock().unwrap().by_name.get(name).copied()
    }

    /// Looks up `name`, blocking according to `timeout` if it is not yet
    /// present. Returns [`CoreError::TimedOut`], [`CoreError::WouldBlock`]
    /// (for a zero timeout), per spec.md §4.3.
    pub fn bind(&self, name: &str, timeout: Timeout) -> CoreResult<Handle> {
        let mut state = self.state.lock().unwrap();
        if let Some(h) = state.by_name.get(name) {
            return Ok(*h);
        }
        if timeout.is_non_blocking() {
            return Err(CoreError::WouldBlock);
        }
        let deadline = timeout.deadline_from(Instant::now());
        loop {
            match deadline {
                None => {
                    state = self.new_object.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoreError::TimedOut);
                    }
                    let (s, res) = self
                        .new_object
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = s;
                    if res.timed_out() && !state.by_name.contains_key(name) {
                        return Err(CoreError::TimedOut);
                    }
                }
            }
            if let Some(h) = state.by_name.get(name) {
                return Ok(*h);
            }
        }
    }

    /// Removes every mapping pointing at `obj`. Spec.md §4.3 names the
    /// operation as deleting by object rather than by name, since a
    /// caller tearing down a control block may not have its canonical
    /// name handy.
    pub fn delete(&self, obj: Handle) {
        let mut state = self.state.lock().unwrap();
        state.by_name.retain(|_, h| *h != obj);
    }

    /// Synthesizes a generator-issued name unique within this cluster,
    /// for anonymous-object creation.
    pub fn anonymous_name(&self, prefix: &str) -> Name {
        let state = self.state.lock().unwrap();
        let serial = state.anon_serial.fetch_add(1, Ordering::Relaxed);
        Name::anonymous(prefix, serial)
    }

    /// A point-in-time snapshot of every `(name, handle)` pair, taken
    /// under the registry lock. This is the minimal hook a filesystem
    /// registry exporter (out of scope per spec.md §1) would build on;
    /// nothing in this crate writes it anywhere.
    pub fn snapshot(&self) -> Vec<(Name, Handle)> {
        self.state
            .lock()
            .unwrap()
            .by_name
            .iter()
            .map(|(n, h)| (*n, *h))
            .collect()
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide default cluster every ordinary primitive registers
/// into, initialized once on first use per spec.md §9's "registries are
/// process-wide, initialized once at library startup" note.
pub fn global() -> &'static Cluster {
    static GLOBAL: OnceLock<Cluster> = OnceLock::new();
    GLOBAL.get_or_init(Cluster::new)
}
