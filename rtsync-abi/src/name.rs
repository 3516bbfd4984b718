// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-length object names, as stored inside every control block and
//! indexed by every registry cluster.

use arrayvec::ArrayString;

/// Maximum name length for the extended (Alchemy-style) naming convention.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum name length for the compatibility (pSOS-style) naming
/// convention. Longer names may still be used by flavors that set the
/// "long names" flag described in the registry contract.
pub const COMPAT_NAME_LEN: usize = 4;

/// An immutable, fixed-capacity object name.
///
/// Stored inline (no heap allocation) so that control blocks placed in a
/// shared arena remain self-contained. Comparisons are byte-exact.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(ArrayString<MAX_NAME_LEN>);

/// Returned when a caller-supplied name does not fit in [`MAX_NAME_LEN`]
/// bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("name exceeds {MAX_NAME_LEN} bytes")]
pub struct NameTooLong;

impl Name {
    /// Builds a name from a string slice, rejecting anything over
    /// [`MAX_NAME_LEN`] bytes.
    pub fn new(s: &str) -> Result<Self, NameTooLong> {
        ArrayString::from(s).map(Name).map_err(|_| NameTooLong)
    }

    /// Synthesizes a generator-issued name for an anonymous object, of the
    /// form `prefixN` (e.g. `queue3`), truncating the prefix if necessary
    /// to keep the whole thing within [`MAX_NAME_LEN`] bytes.
    pub fn anonymous(prefix: &str, serial: u32) -> Self {
        let mut s = ArrayString::<MAX_NAME_LEN>::new();
        let suffix_len = count_digits(serial);
        let budget = MAX_NAME_LEN.saturating_sub(suffix_len).max(1);
        let prefix = &prefix[..prefix.len().min(budget)];
        // Both pieces are ASCII and bounded by MAX_NAME_LEN by construction,
        // so this cannot overflow the ArrayString's capacity.
        s.push_str(prefix);
        use std::fmt::Write;
        let _ = write!(s, "{serial}");
        Name(s)
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

fn count_digits(mut n: u32) -> usize {
    if n == 0 {
        return 1;
    }
    let mut digits = 0;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_names() {
        let too_long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(Name::new(&too_long).is_err());
    }

    #[test]
    fn anonymous_names_are_distinct() {
        let a = Name::anonymous("queue", 1);
        let b = Name::anonymous("queue", 2);
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "queue1");
    }
}
