// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The opaque descriptor handed back to callers by every `create` call.

use std::num::NonZeroI32;

/// An opaque, user-visible reference to a control block.
///
/// A `Handle` encodes a signed byte offset from the base of whichever arena
/// (process-private or shared) holds the control block. Because the offset
/// is relative rather than absolute, the same `Handle` resolves to the
/// correct control block even when the backing arena is mapped at a
/// different base address in each process sharing it.
///
/// `Handle` is never zero for a live object; zero is reserved to let
/// facades represent "no handle" without an `Option` wrapper.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroI32);

impl Handle {
    /// Builds a handle from a raw arena-relative offset.
    ///
    /// Returns `None` if `offset` is zero, since the all-zero offset is
    /// reserved as the "invalid handle" sentinel.
    pub fn from_offset(offset: i32) -> Option<Self> {
        NonZeroI32::new(offset).map(Handle)
    }

    /// Returns the raw arena-relative offset this handle encodes.
    pub fn offset(self) -> i32 {
        self.0.get()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:08x}", self.0.get())
    }
}
