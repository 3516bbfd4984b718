// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concatenation round-trip for [`rtsync_core::bytebuffer::ByteBuffer`]:
//! whatever a single writer hands in, a single reader gets back in the
//! same order, regardless of how the bytes are chunked on either side.

use proptest::prelude::*;

use rtsync_abi::{Name, QueueOrder, Timeout};
use rtsync_core::bytebuffer::ByteBuffer;

fn chunked(total: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    for &sz in sizes {
        if pos >= total.len() {
            break;
        }
        let end = (pos + sz).min(total.len());
        out.push(total[pos..end].to_vec());
        pos = end;
    }
    if pos < total.len() {
        out.push(total[pos..].to_vec());
    }
    out
}

proptest! {
    #[test]
    fn write_then_read_preserves_order(
        payload in prop::collection::vec(any::<u8>(), 0..512),
        write_chunk_sizes in prop::collection::vec(1usize..64, 1..16),
        read_chunk_sizes in prop::collection::vec(1usize..64, 1..16),
    ) {
        let writes = chunked(&payload, &write_chunk_sizes);
        let capacity = payload.len().max(1);
        let buf = ByteBuffer::new(Name::new("ppt_bb").unwrap(), capacity, QueueOrder::Fifo);
        let thread = rtsync_core::thread::current();

        for chunk in &writes {
            if chunk.is_empty() {
                continue;
            }
            buf.write(&thread, chunk, Timeout::Infinite).unwrap();
        }

        let mut reads = Vec::new();
        let mut remaining = payload.len();
        let mut idx = 0usize;
        while remaining > 0 {
            let want = read_chunk_sizes[idx % read_chunk_sizes.len()].min(remaining);
            let got = buf.read(&thread, want, Timeout::Infinite).unwrap();
            remaining -= got.len();
            reads.push(got);
            idx += 1;
        }

        let reassembled: Vec<u8> = reads.into_iter().flatten().collect();
        prop_assert_eq!(reassembled, payload);
    }
}
