// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IPC/synchronization substrate shared by the Alchemy and pSOS
//! flavor facades.
//!
//! This crate implements exactly the layered core described in spec.md
//! §2: a scoped cancellation guard, handle/arena resolution, a named
//! object registry, the thread object every wait registers against, the
//! generic priority/FIFO sync object every L2 primitive is built on, and
//! the L2 primitives themselves (mutex, event group, semaphore, condvar,
//! heap, region, partition, byte buffer, message queue) plus the
//! alarm/timer ambient component. Flavor facades (Alchemy, pSOS, and any
//! future persona) are external collaborators that repack arguments and
//! remap error codes onto this crate's [`rtsync_abi::CoreError`]; none
//! of that repacking lives here.

pub mod alarm;
pub mod alloc;
pub mod arena;
pub mod bytebuffer;
pub mod condvar;
pub mod event;
pub mod guard;
pub mod heap;
pub mod msgqueue;
pub mod mutex;
pub mod partition;
pub mod region;
pub mod registry;
pub mod semaphore;
pub mod syncobj;
pub mod thread;

pub use alarm::Alarm;
pub use bytebuffer::ByteBuffer;
pub use condvar::Condvar;
pub use event::{EventGroup, WaitMode};
pub use guard::ServiceGuard;
pub use heap::Heap;
pub use msgqueue::{MsgQueue, MsgRef, QueueConfig, SendMode};
pub use mutex::RecursivePiMutex;
pub use partition::Partition;
pub use region::Region;
pub use registry::Cluster;
pub use semaphore::Semaphore;
pub use syncobj::SyncObject;
pub use thread::ThreadObject;
