//! System-heap facade over [`memheap`].
//!
//! One designated *system heap* backs `malloc`-style entry points. When
//! it cannot satisfy a request, the facade walks every other registered
//! heap in registration order and takes the first success, so secondary
//! pools (e.g. a slower external RAM bank) transparently absorb overflow.
//!
//! ```
//! static mut POOL: [u64; 1024] = [0; 1024];
//!
//! unsafe {
//!     sysheap::init((&raw mut POOL).cast(), size_of::<[u64; 1024]>()).unwrap();
//! }
//!
//! let ptr = sysheap::malloc(256).unwrap();
//! unsafe { sysheap::free(ptr) };
//! ```

#![cfg_attr(not(test), no_std)]

use core::ptr;

use memheap::{InitError, RegionHeap};

static SYSTEM_HEAP: RegionHeap = RegionHeap::new();

/// Arms the system heap with its pool. Call once at startup, before any
/// other entry point.
///
/// # Errors
///
/// Same conditions as [`RegionHeap::init`].
///
/// # Safety
///
/// Same contract as [`RegionHeap::init`]: the pool must be valid,
/// exclusive and immovable for the lifetime of the process.
pub unsafe fn init(start: *mut u8, size: usize) -> Result<(), InitError> {
    unsafe { SYSTEM_HEAP.init("system", start, size) }
}

/// Allocates `size` bytes from the system heap, falling back to every
/// other registered heap on a miss. Returns `None` when no heap can
/// serve the request.
pub fn malloc(size: usize) -> Option<*mut u8> {
    if let Some(ptr) = SYSTEM_HEAP.allocate(size) {
        return Some(ptr);
    }
    for heap in memheap::heaps() {
        if ptr::eq(heap, &SYSTEM_HEAP) {
            continue;
        }
        if let Some(ptr) = heap.allocate(size) {
            log::debug!("[sysheap] malloc({size}) served by a secondary heap");
            return Some(ptr);
        }
    }
    log::debug!("[sysheap] malloc({size}) -> out of memory");
    None
}

/// Releases a block obtained from any facade entry point.
///
/// # Safety
///
/// Same contract as [`memheap::free`].
pub unsafe fn free(ptr: *mut u8) {
    unsafe { memheap::free(ptr) }
}

/// Resizes a block, wherever it currently lives.
///
/// The owning heap is recovered from the block header and asked to
/// resize first. If that heap is exhausted the block moves to whichever
/// registered heap has room, preserving contents.
///
/// # Safety
///
/// `ptr` must be null or a live payload pointer from a facade entry
/// point; on success the old pointer must no longer be used.
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
    if ptr.is_null() {
        return malloc(new_size);
    }
    if new_size == 0 {
        unsafe { free(ptr) };
        return None;
    }
    let heap = unsafe { memheap::owning_heap(ptr) };
    if let Some(resized) = unsafe { heap.reallocate(ptr, new_size) } {
        return Some(resized);
    }

    // the owning heap is out of room: migrate to any other heap
    let old_size = unsafe { memheap::usable_size(ptr) };
    let moved = malloc(new_size)?;
    unsafe {
        ptr::copy_nonoverlapping(ptr, moved, old_size.min(new_size));
        free(ptr);
    }
    log::debug!("[sysheap] realloc({ptr:p}, {new_size}) migrated to {moved:p}");
    Some(moved)
}

/// Allocates a zeroed array of `count` elements of `size` bytes each.
/// Returns `None` on overflow of the total size or on exhaustion.
pub fn calloc(count: usize, size: usize) -> Option<*mut u8> {
    let total = count.checked_mul(size)?;
    let ptr = malloc(total)?;
    unsafe { ptr.write_bytes(0, total) };
    Some(ptr)
}

/// Usage counters of the system heap.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Pool size in bytes.
    pub total: usize,
    /// Bytes currently in use, headers included.
    pub used: usize,
    /// High-water mark of `used`.
    pub max_used: usize,
}

/// Reports the system heap's counters. Secondary heaps are not included.
pub fn memory_info() -> MemoryInfo {
    let total = SYSTEM_HEAP.pool_bytes();
    MemoryInfo {
        total,
        used: total - SYSTEM_HEAP.available_bytes(),
        max_used: SYSTEM_HEAP.max_used_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        alloc::Layout,
        sync::{Mutex, MutexGuard, Once},
    };

    use memheap::RegionHeap;

    use super::*;

    const SYSTEM_POOL: usize = 4096;

    /// Arms the system heap once and serializes tests that share it.
    fn setup() -> MutexGuard<'static, ()> {
        static INIT: Once = Once::new();
        static SERIAL: Mutex<()> = Mutex::new(());

        INIT.call_once(|| {
            let layout = Layout::from_size_align(SYSTEM_POOL, 16).unwrap();
            let pool = unsafe { std::alloc::alloc(layout) };
            unsafe { init(pool, SYSTEM_POOL).unwrap() };
        });
        SERIAL.lock().unwrap()
    }

    fn with_secondary_heap<F: FnOnce(&'static RegionHeap)>(pool_size: usize, f: F) {
        let layout = Layout::from_size_align(pool_size, 16).unwrap();
        let pool = unsafe { std::alloc::alloc(layout) };
        let heap: &'static RegionHeap = Box::leak(Box::new(RegionHeap::new()));
        unsafe { heap.init("secondary", pool, pool_size).unwrap() };
        f(heap);
        heap.detach();
        unsafe { std::alloc::dealloc(pool, layout) };
    }

    #[test]
    fn malloc_free_round_trip() {
        let _serial = setup();
        let before = memory_info();

        let ptr = malloc(128).unwrap();
        assert_eq!(ptr.addr() % memheap::ALIGN, 0);
        assert!(memory_info().used > before.used);

        unsafe { free(ptr) };
        assert_eq!(memory_info().used, before.used);
    }

    #[test]
    fn malloc_overflows_into_secondary_heap() {
        let _serial = setup();
        with_secondary_heap(64 * 1024, |secondary| {
            // larger than the whole system pool, so only the secondary
            // heap can serve it
            let ptr = malloc(2 * SYSTEM_POOL).unwrap();
            assert!(core::ptr::eq(unsafe { memheap::owning_heap(ptr) }, secondary));
            unsafe { free(ptr) };
        });
    }

    #[test]
    fn malloc_with_no_fitting_heap_fails() {
        let _serial = setup();
        assert_eq!(malloc(16 * 1024 * 1024), None);
    }

    #[test]
    fn realloc_grows_within_the_owning_heap() {
        let _serial = setup();
        let ptr = malloc(64).unwrap();
        unsafe {
            ptr.write_bytes(0x42, 64);
            let grown = realloc(ptr, 256).unwrap();
            for i in 0..64 {
                assert_eq!(grown.add(i).read(), 0x42);
            }
            free(grown);
        }
    }

    #[test]
    fn realloc_migrates_when_the_owning_heap_is_full() {
        let _serial = setup();
        with_secondary_heap(64 * 1024, |secondary| {
            let ptr = malloc(64).unwrap();
            assert!(core::ptr::eq(unsafe { memheap::owning_heap(ptr) }, &SYSTEM_HEAP));
            unsafe {
                ptr.write_bytes(0x77, 64);
                let moved = realloc(ptr, 2 * SYSTEM_POOL).unwrap();
                assert!(core::ptr::eq(memheap::owning_heap(moved), secondary));
                for i in 0..64 {
                    assert_eq!(moved.add(i).read(), 0x77);
                }
                free(moved);
            }
        });
    }

    #[test]
    fn realloc_null_and_zero_edges() {
        let _serial = setup();
        let before = memory_info();

        let ptr = unsafe { realloc(core::ptr::null_mut(), 64) }.unwrap();
        assert_eq!(unsafe { realloc(ptr, 0) }, None);
        assert_eq!(memory_info().used, before.used);
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let _serial = setup();

        let ptr = calloc(16, 8).unwrap();
        unsafe {
            for i in 0..128 {
                assert_eq!(ptr.add(i).read(), 0);
            }
            free(ptr);
        }

        assert_eq!(calloc(usize::MAX, 2), None);
    }
}
