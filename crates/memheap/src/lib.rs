//! Bounded-region heap allocator for embedded and kernel-space usage.
//!
//! A [`RegionHeap`] manages one caller-provided contiguous byte range.
//! All bookkeeping lives inline in that range: every block, used or free,
//! is prefixed by a boundary-tag header, and the headers are threaded
//! into two intrusive lists at once. Allocation is **first-fit** over a
//! circular explicit free list; release merges with both physical
//! neighbors immediately, so no two adjacent free blocks ever exist.
//!
//! # Memory layout
//!
//! ```text
//! pool:  +--------+-----------+--------+-----------+--------+
//!        | header | payload   | header | payload   | tail   |
//!        | (used) |           | (free) |           | header |
//!        +--------+-----------+--------+-----------+--------+
//!                                 ^ also linked on the free list
//! ```
//!
//! The pool ends in a permanent zero-payload *tail sentinel* in the used
//! state; it terminates coalescing and iteration without boundary checks.
//! A block has no size field: its payload size is the distance to the
//! next header, which keeps the headers small and self-checking (each
//! carries a magic word validated on release).
//!
//! # Concurrency
//!
//! Heaps are `Sync`. Every operation serializes on the owning heap's
//! FIFO lock; operations on distinct heaps are independent. [`free`] does
//! not take a heap argument: each header carries a back reference to its
//! descriptor, so a pointer alone identifies its heap.
//!
//! # Usage
//!
//! ```
//! use memheap::RegionHeap;
//!
//! static HEAP: RegionHeap = RegionHeap::new();
//!
//! let mut pool = [0_u64; 1024]; // 8 KiB, pointer-aligned
//! unsafe {
//!     HEAP.init("main", pool.as_mut_ptr().cast(), size_of_val(&pool)).unwrap();
//! }
//!
//! let ptr = HEAP.allocate(100).unwrap();
//! let ptr = unsafe { HEAP.reallocate(ptr, 200) }.unwrap();
//! unsafe { memheap::free(ptr) };
//! ```
//!
//! # What this allocator does not do
//!
//! No best-fit or segregated size classes, no deferred coalescing pass,
//! no compaction, and no growing: the pool is immovable and fixed. The
//! guaranteed alignment is [`ALIGN`] (the platform pointer alignment),
//! which is why there is no `GlobalAlloc` implementation here.

#![cfg_attr(not(test), no_std)]

pub mod dump;
mod errno;
mod heap;
mod item;
mod lock;
mod registry;

#[cfg(feature = "owner-tag")]
pub use self::heap::set_owner_tag;
pub use self::{
    errno::{last_error, take_error},
    heap::{InitError, RegionHeap, free, owning_heap, usable_size},
    item::{ALIGN, HEADER_SIZE, MIN_PAYLOAD},
    lock::LockRevoked,
    registry::heaps,
};
