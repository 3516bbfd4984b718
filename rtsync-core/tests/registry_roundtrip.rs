// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Add/find/delete round-trip for [`rtsync_core::registry::Cluster`]:
//! every name added resolves back to its handle until deleted, and a
//! deleted name is no longer found by anyone still holding it.

use proptest::prelude::*;

use rtsync_abi::{Handle, Name};
use rtsync_core::registry::Cluster;

fn distinct_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z]{1,12}", 1..16).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #[test]
    fn add_find_delete_round_trip(names in distinct_names()) {
        let cluster = Cluster::new();
        let mut handles = Vec::new();

        for (i, n) in names.iter().enumerate() {
            let name = Name::new(n).unwrap();
            let handle = Handle::from_offset((i as i32) + 1).unwrap();
            cluster.add_unique(name, handle).unwrap();
            handles.push((name, handle));
        }

        for (name, handle) in &handles {
            prop_assert_eq!(cluster.find(name.as_str()), Some(*handle));
        }

        for (name, handle) in &handles {
            cluster.delete(*handle);
            prop_assert_eq!(cluster.find(name.as_str()), None);
        }
    }
}
