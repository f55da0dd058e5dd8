//! Heap descriptors and the allocation operations.
//!
//! A [`RegionHeap`] manages one contiguous pool handed over at
//! [`init`](RegionHeap::init). The pool is carved into items prefixed by
//! boundary-tag headers (see [`item`](crate::item)); the last header in
//! the pool is a permanent zero-payload *tail sentinel* in the used state,
//! which terminates merging and iteration without boundary checks.
//!
//! ```text
//! +-----------------------------------+--------------------------+
//! | whole free memory block           | used tail sentinel       |
//! +-----------------------------------+--------------------------+
//! ```
//!
//! Every operation serializes on the heap's FIFO lock. Freeing does not
//! need the heap named by the caller: each header carries a back reference
//! to its descriptor.

use core::{
    cell::UnsafeCell,
    fmt, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use snafu::{Snafu, ensure};

use crate::{
    errno,
    item::{ALIGN, HEADER_SIZE, ItemHeader, MIN_PAYLOAD, align_down},
    lock::{HeapLock, LockRevoked},
    registry,
};

/// The reasons [`RegionHeap::init`] can fail.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum InitError {
    #[snafu(display("pool of {size} bytes is too small, need at least {min}"))]
    PoolTooSmall {
        size: usize,
        min: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("heap registry is full ({capacity} heaps)"))]
    RegistryFull {
        capacity: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Descriptor state behind the heap lock.
pub(crate) struct HeapState {
    pub(crate) name: &'static str,
    pub(crate) start: *mut u8,
    /// First in-pool item, i.e. the lowest address. The tail sentinel's
    /// `next` wraps back here.
    pub(crate) block_list: *mut ItemHeader,
    /// Free-list sentinel. Lives in the descriptor, never in the pool,
    /// and is never a candidate for allocation. Its block-list links stay
    /// null and must not be traversed.
    pub(crate) free_sentinel: ItemHeader,
}

/// A heap over a caller-provided bounded region.
///
/// The descriptor is constructed `const` so it can live in a `static`,
/// then armed once with [`init`](Self::init). All operations are safe to
/// call from multiple threads; mutations of a single heap serialize in
/// FIFO order on its lock.
///
/// ```
/// use memheap::RegionHeap;
///
/// static HEAP: RegionHeap = RegionHeap::new();
///
/// let mut pool = [0_u64; 512];
/// unsafe {
///     HEAP.init("demo", pool.as_mut_ptr().cast(), size_of_val(&pool)).unwrap();
/// }
///
/// let ptr = HEAP.allocate(64).unwrap();
/// assert!(ptr.addr() % memheap::ALIGN == 0);
/// unsafe { memheap::free(ptr) };
/// ```
pub struct RegionHeap {
    pub(crate) lock: HeapLock,
    pub(crate) state: UnsafeCell<HeapState>,
    /// Free payload bytes. Written only under the lock; read without it
    /// by the allocation fast-reject and by [`available_bytes`].
    ///
    /// [`available_bytes`]: Self::available_bytes
    pub(crate) available: AtomicUsize,
    /// High-water mark of `pool_size - available`.
    pub(crate) max_used: AtomicUsize,
    pub(crate) pool_size: AtomicUsize,
}

unsafe impl Send for RegionHeap {}
unsafe impl Sync for RegionHeap {}

impl Default for RegionHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegionHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHeap")
            .field("pool_size", &self.pool_size.load(Ordering::Relaxed))
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("max_used", &self.max_used.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Rounds a request up to alignment and the minimum payload. `None` only
/// on arithmetic overflow, which no pool could satisfy anyway.
fn request_size(size: usize) -> Option<usize> {
    let size = size.checked_add(ALIGN - 1)? & !(ALIGN - 1);
    Some(if size < MIN_PAYLOAD { MIN_PAYLOAD } else { size })
}

impl RegionHeap {
    /// Creates an unarmed descriptor. Every operation fails (allocation
    /// returns `None`) until [`init`](Self::init) runs.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: HeapLock::new(),
            state: UnsafeCell::new(HeapState {
                name: "",
                start: ptr::null_mut(),
                block_list: ptr::null_mut(),
                free_sentinel: ItemHeader {
                    magic: 0,
                    pool: ptr::null(),
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                    prev_free: ptr::null_mut(),
                    next_free: ptr::null_mut(),
                },
            }),
            available: AtomicUsize::new(0),
            max_used: AtomicUsize::new(0),
            pool_size: AtomicUsize::new(0),
        }
    }

    /// Takes ownership of the pool `start..start + size`, carves it into
    /// a single free body plus the tail sentinel, wires the free list and
    /// registers the heap. `size` is rounded down to [`ALIGN`] first.
    ///
    /// # Errors
    ///
    /// Fails if the rounded pool cannot hold two headers plus
    /// [`MIN_PAYLOAD`] bytes, or if the heap registry is full.
    ///
    /// # Panics
    ///
    /// Panics if `start` is null or unaligned, or if the heap is already
    /// initialized.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the pool bytes are valid, writable and used by nothing else for
    ///   as long as the heap stays initialized;
    /// - the descriptor does not move after this call (headers in the
    ///   pool point back at it);
    /// - `init` is not called concurrently with other operations on the
    ///   same heap.
    pub unsafe fn init(
        &'static self,
        name: &'static str,
        start: *mut u8,
        size: usize,
    ) -> Result<(), InitError> {
        assert!(!start.is_null(), "pool start must not be null");
        assert!(
            start.addr() % ALIGN == 0,
            "pool start must be {ALIGN}-byte aligned",
        );

        let pool_size = align_down(size, ALIGN);
        let min = 2 * HEADER_SIZE + MIN_PAYLOAD;
        ensure!(pool_size >= min, PoolTooSmallSnafu { size, min });
        let available = pool_size - 2 * HEADER_SIZE;

        self.lock.reopen();
        let guard = self.lock.acquire().expect("reopened heap lock");
        let state = self.state.get();
        unsafe {
            assert!((*state).start.is_null(), "heap is already initialized");

            let sentinel = &raw mut (*state).free_sentinel;
            ItemHeader::init_free_sentinel(sentinel, self);

            let body = ItemHeader::emplace(start, self, false);
            let tail = ItemHeader::emplace(start.add(HEADER_SIZE + available), self, true);
            (*body).prev = tail;
            (*body).next = tail;
            (*tail).prev = body;
            (*tail).next = body;
            ItemHeader::push_free(sentinel, body);

            (*state).name = name;
            (*state).start = start;
            (*state).block_list = body;
        }
        self.pool_size.store(pool_size, Ordering::Relaxed);
        self.max_used.store(pool_size - available, Ordering::Relaxed);
        self.available.store(available, Ordering::Relaxed);

        if !registry::register(self) {
            unsafe {
                (*state).start = ptr::null_mut();
                (*state).block_list = ptr::null_mut();
            }
            self.available.store(0, Ordering::Relaxed);
            self.lock.close();
            drop(guard);
            return RegistryFullSnafu { capacity: registry::CAPACITY }.fail();
        }
        drop(guard);

        log::trace!("[memheap] init '{name}': start {start:p}, pool {pool_size}, available {available}");
        Ok(())
    }

    /// Unregisters the heap and revokes its lock. The pool bytes are left
    /// untouched. Operations still queued on the lock, and any issued
    /// later, fail with [`LockRevoked`] recorded in the error slot.
    ///
    /// # Panics
    ///
    /// Panics if the heap was never initialized or is already detached.
    pub fn detach(&self) {
        let Ok(guard) = self.lock.acquire() else {
            panic!("detach of an uninitialized or already detached heap");
        };
        let state = self.state.get();
        unsafe {
            assert!(!(*state).start.is_null(), "detach of an uninitialized heap");
            log::trace!("[memheap] detach '{}'", (*state).name);
            registry::unregister(self);
            (*state).start = ptr::null_mut();
            (*state).block_list = ptr::null_mut();
        }
        self.available.store(0, Ordering::Relaxed);
        self.lock.close();
        drop(guard);
    }

    /// Allocates at least `size` bytes from the pool, first fit.
    ///
    /// The request is rounded up to [`ALIGN`] and [`MIN_PAYLOAD`]. The
    /// returned pointer is [`ALIGN`]-aligned and stays valid until passed
    /// to [`free`] or [`reallocate`](Self::reallocate). Returns `None`
    /// when no free item can satisfy the rounded request.
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        let size = request_size(size)?;
        // Strict on purpose: a request equal to the free total is refused
        // as a safety margin for the embedded header.
        if size >= self.available.load(Ordering::Relaxed) {
            return None;
        }
        let Ok(_guard) = self.lock.acquire() else {
            errno::record(LockRevoked);
            return None;
        };
        let state = self.state.get();
        unsafe {
            let sentinel = &raw mut (*state).free_sentinel;

            let mut fit = (*sentinel).next_free;
            while fit != sentinel && ItemHeader::payload_size(fit) < size {
                fit = (*fit).next_free;
            }
            if fit == sentinel {
                log::trace!("[memheap] '{}' alloc {size}: no fit", (*state).name);
                return None;
            }

            let free_size = ItemHeader::payload_size(fit);
            if free_size >= size + HEADER_SIZE + MIN_PAYLOAD {
                // Split: the remainder becomes a new free item right after
                // the allocated payload.
                let rest = ItemHeader::emplace(
                    ItemHeader::payload(fit).add(size),
                    (*fit).pool,
                    false,
                );
                ItemHeader::link_block_after(fit, rest);
                ItemHeader::unlink_free(fit);
                ItemHeader::push_free(sentinel, rest);
                self.consume(size + HEADER_SIZE);
            } else {
                ItemHeader::unlink_free(fit);
                self.consume(free_size);
            }
            ItemHeader::mark_used(fit);
            #[cfg(feature = "owner-tag")]
            ItemHeader::clear_tag(fit);

            let payload = ItemHeader::payload(fit);
            log::trace!("[memheap] '{}' alloc {size} -> {payload:p}", (*state).name);
            Some(payload)
        }
    }

    /// Resizes the allocation at `ptr` to at least `new_size` bytes,
    /// preserving the first `min(old, new)` payload bytes.
    ///
    /// Grows in place by absorbing a free right neighbor when it leaves a
    /// viable remainder, shrinks in place by splitting off a tail item,
    /// and otherwise falls back to allocate, copy and free. A null `ptr`
    /// behaves like [`allocate`](Self::allocate); `new_size == 0` frees
    /// `ptr` and returns `None`. On `None` for a non-zero request the old
    /// allocation is left intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer previously returned
    /// by this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
        if new_size == 0 {
            unsafe { free(ptr) };
            return None;
        }
        let new_size = request_size(new_size)?;
        if ptr.is_null() {
            return self.allocate(new_size);
        }

        let item = unsafe { ItemHeader::from_payload(ptr) };
        let old_size = unsafe { ItemHeader::payload_size(item) };

        if new_size > old_size {
            {
                let Ok(_guard) = self.lock.acquire() else {
                    errno::record(LockRevoked);
                    return None;
                };
                let state = self.state.get();
                unsafe {
                    let next = (*item).next;
                    // a payload item always precedes its successor
                    assert!(next.addr() > item.addr(), "reallocate of a corrupt item");

                    if !ItemHeader::is_used(next)
                        && ItemHeader::payload_size(next) + old_size > new_size + MIN_PAYLOAD
                    {
                        // Absorb the right neighbor and rebuild a smaller
                        // free item past the grown payload.
                        self.consume(new_size - old_size);
                        ItemHeader::unlink_free(next);
                        ItemHeader::unlink_block(next);

                        let rest = ItemHeader::emplace(ptr.add(new_size), (*item).pool, false);
                        ItemHeader::link_block_after(item, rest);
                        ItemHeader::push_free(&raw mut (*state).free_sentinel, rest);

                        log::trace!("[memheap] realloc {ptr:p}: grown in place to {new_size}");
                        return Some(ptr);
                    }
                }
                // lock dropped here; the fallback re-acquires on its own
            }
            let moved = self.allocate(new_size)?;
            unsafe {
                ptr::copy_nonoverlapping(ptr, moved, old_size.min(new_size));
                free(ptr);
            }
            log::trace!("[memheap] realloc {ptr:p}: moved to {moved:p}");
            return Some(moved);
        }

        // Shrinking: keep the block as is when the cut-off tail could not
        // hold an item of its own.
        if new_size + HEADER_SIZE + MIN_PAYLOAD >= old_size {
            return Some(ptr);
        }
        let Ok(_guard) = self.lock.acquire() else {
            errno::record(LockRevoked);
            return None;
        };
        let state = self.state.get();
        unsafe {
            let sentinel = &raw mut (*state).free_sentinel;
            let mut avail = self.available.load(Ordering::Relaxed);

            let tail = ItemHeader::emplace(ptr.add(new_size), (*item).pool, false);
            ItemHeader::link_block_after(item, tail);

            let next = (*tail).next;
            if !ItemHeader::is_used(next) {
                // merge the tail with the free item that follows it
                avail -= ItemHeader::payload_size(next);
                (*(*next).next).prev = tail;
                (*tail).next = (*next).next;
                ItemHeader::unlink_free(next);
            }
            ItemHeader::push_free(sentinel, tail);
            avail += ItemHeader::payload_size(tail);
            self.available.store(avail, Ordering::Relaxed);

            log::trace!("[memheap] realloc {ptr:p}: shrunk in place to {new_size}");
        }
        Some(ptr)
    }

    /// Free payload bytes currently available for allocation.
    pub fn available_bytes(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// High-water mark of used bytes (headers included).
    pub fn max_used_bytes(&self) -> usize {
        self.max_used.load(Ordering::Relaxed)
    }

    /// Pool size after alignment rounding at init.
    pub fn pool_bytes(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Debits `bytes` from the free total and pushes the high-water mark.
    /// Must be called with the lock held.
    fn consume(&self, bytes: usize) {
        let avail = self.available.load(Ordering::Relaxed) - bytes;
        self.available.store(avail, Ordering::Relaxed);
        let used = self.pool_size.load(Ordering::Relaxed) - avail;
        if used > self.max_used.load(Ordering::Relaxed) {
            self.max_used.store(used, Ordering::Relaxed);
        }
    }

    /// Returns an item to the pool, merging with free neighbors on both
    /// sides. The merged-away header bytes become payload again.
    unsafe fn release_item(&self, item: *mut ItemHeader) {
        let Ok(_guard) = self.lock.acquire() else {
            errno::record(LockRevoked);
            return;
        };
        let state = self.state.get();
        unsafe {
            let sentinel = &raw mut (*state).free_sentinel;
            let mut item = item;

            ItemHeader::mark_free(item);
            let mut avail = self.available.load(Ordering::Relaxed) + ItemHeader::payload_size(item);
            let mut insert = true;

            let prev = (*item).prev;
            if !ItemHeader::is_used(prev) {
                // left merge: splice `item` out, the left neighbor is
                // already on the free list
                avail += HEADER_SIZE;
                (*prev).next = (*item).next;
                (*(*item).next).prev = prev;
                item = prev;
                insert = false;
            }

            let next = (*item).next;
            if !ItemHeader::is_used(next) {
                avail += HEADER_SIZE;
                (*(*next).next).prev = item;
                (*item).next = (*next).next;
                ItemHeader::unlink_free(next);
            }

            if insert {
                ItemHeader::push_free(sentinel, item);
            }
            self.available.store(avail, Ordering::Relaxed);
            log::trace!("[memheap] '{}' free item {item:p}", (*state).name);
        }
    }
}

/// Releases an allocation back to the heap that produced it.
///
/// The owning heap is recovered from the item header, so the caller does
/// not name one. A null `ptr` is a no-op. If the heap was detached in the
/// meantime the call records [`LockRevoked`] in the error slot and leaves
/// everything untouched.
///
/// # Panics
///
/// Panics when the header's magic check fails: double free, a pointer the
/// allocator never returned, or a write past the end of the previous
/// allocation.
///
/// # Safety
///
/// `ptr` must be null or a live payload pointer previously returned by
/// [`RegionHeap::allocate`]/[`RegionHeap::reallocate`], and must not be
/// used after this call.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let item = unsafe { ItemHeader::from_payload(ptr) };
    unsafe {
        ItemHeader::verify_used(item);
        // a trashed successor header means the payload was overrun
        ItemHeader::verify_magic((*item).next);
        let heap = &*(*item).pool;
        heap.release_item(item);
    }
}

/// Returns the heap that owns the allocation at `ptr`.
///
/// # Safety
///
/// `ptr` must be a live payload pointer previously returned by some heap
/// of this process.
pub unsafe fn owning_heap(ptr: *mut u8) -> &'static RegionHeap {
    let item = unsafe { ItemHeader::from_payload(ptr) };
    unsafe {
        ItemHeader::verify_magic(item);
        &*(*item).pool
    }
}

/// Actual payload capacity of the allocation at `ptr`, which is at least
/// what was requested.
///
/// # Safety
///
/// `ptr` must be a live payload pointer previously returned by some heap
/// of this process.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    let item = unsafe { ItemHeader::from_payload(ptr) };
    unsafe {
        ItemHeader::verify_magic(item);
        ItemHeader::payload_size(item)
    }
}

/// Stores a short owner tag in the spare link storage of a used item.
/// Truncated to the platform's tag capacity (two pointers worth of
/// bytes); shown by the diagnostic dump.
///
/// # Safety
///
/// `ptr` must be a live payload pointer previously returned by some heap
/// of this process.
#[cfg(feature = "owner-tag")]
pub unsafe fn set_owner_tag(ptr: *mut u8, tag: &str) {
    if ptr.is_null() {
        return;
    }
    let item = unsafe { ItemHeader::from_payload(ptr) };
    unsafe {
        ItemHeader::verify_used(item);
        ItemHeader::write_tag(item, tag);
    }
}

#[cfg(test)]
pub(crate) struct HeapStats {
    pub(crate) free_items: usize,
}

#[cfg(test)]
impl RegionHeap {
    /// Verifies every structural invariant and returns counters for
    /// further assertions. Test builds only.
    pub(crate) fn assert_invariants(&self) -> HeapStats {
        let _guard = self.lock.acquire().expect("heap lock");
        let state = self.state.get();
        unsafe {
            let pool_size = self.pool_size.load(Ordering::Relaxed);
            let available = self.available.load(Ordering::Relaxed);
            let max_used = self.max_used.load(Ordering::Relaxed);
            let start = (*state).start;
            let head = (*state).block_list;
            let sentinel = &raw mut (*state).free_sentinel;

            assert_eq!(head.addr(), start.addr(), "block list must start at the pool");

            let mut item = head;
            let mut free_sum = 0;
            let mut free_items = 0;
            let mut previous_was_free = false;
            loop {
                ItemHeader::verify_magic(item);
                let next = (*item).next;
                if next == head {
                    // tail sentinel: used, zero payload, closes the cycle
                    assert!(ItemHeader::is_used(item), "tail sentinel must be used");
                    assert_eq!(item.addr(), start.addr() + pool_size - HEADER_SIZE);
                    break;
                }
                assert!(next.addr() > item.addr(), "block list must be address sorted");
                assert_eq!((*next).prev, item, "prev link must invert next");

                if ItemHeader::is_used(item) {
                    previous_was_free = false;
                } else {
                    assert!(!previous_was_free, "adjacent free items left uncoalesced");
                    previous_was_free = true;
                    free_sum += ItemHeader::payload_size(item);
                    free_items += 1;

                    let mut node = (*sentinel).next_free;
                    while node != sentinel && node != item {
                        node = (*node).next_free;
                    }
                    assert_eq!(node, item, "free item missing from the free list");
                }
                item = next;
            }

            let mut node = (*sentinel).next_free;
            let mut on_free_list = 0;
            while node != sentinel {
                assert!(!ItemHeader::is_used(node), "used item on the free list");
                assert_eq!((*(*node).next_free).prev_free, node);
                on_free_list += 1;
                node = (*node).next_free;
            }
            assert_eq!(on_free_list, free_items, "free list and block list disagree");
            assert_eq!(free_sum, available, "available_size accounting is off");
            assert!(pool_size - available <= max_used);
            assert!(max_used <= pool_size);

            HeapStats { free_items }
        }
    }
}
