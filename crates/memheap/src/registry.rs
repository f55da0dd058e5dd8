//! Registry of live heaps.
//!
//! Heaps register at init and unregister at detach. The registry exists
//! for the consumers that need to see every heap at once: the system-heap
//! facade walking secondary heaps on an allocation miss, and the
//! whole-process diagnostic dump.

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::heap::RegionHeap;

/// Upper bound on concurrently registered heaps. Embedded deployments use
/// a handful; the slack accommodates hosted test runners that keep many
/// short-lived heaps alive in parallel.
pub(crate) const CAPACITY: usize = 64;

static HEAPS: Mutex<ArrayVec<&'static RegionHeap, CAPACITY>> = Mutex::new(ArrayVec::new_const());

/// Returns false when the registry is full.
pub(crate) fn register(heap: &'static RegionHeap) -> bool {
    HEAPS.lock().try_push(heap).is_ok()
}

pub(crate) fn unregister(heap: &RegionHeap) {
    HEAPS.lock().retain(|registered| !core::ptr::eq(*registered, heap));
}

/// Snapshot of every currently registered heap, in registration order.
pub fn heaps() -> ArrayVec<&'static RegionHeap, CAPACITY> {
    HEAPS.lock().clone()
}
