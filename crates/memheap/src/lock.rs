//! Per-heap serialization primitive.
//!
//! A binary lock with ticket-based FIFO grant order: waiters are served in
//! the order they arrived. The lock can be *closed* (by heap detach), at
//! which point every queued and future [`acquire`](HeapLock::acquire)
//! fails with [`LockRevoked`] instead of handing out access to a dead
//! descriptor. A fresh lock starts closed; initialization opens it.

use core::{
    fmt, hint,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub(crate) struct HeapLock {
    next_ticket: AtomicUsize,
    owner: AtomicUsize,
    closed: AtomicBool,
}

impl HeapLock {
    pub(crate) const fn new() -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            closed: AtomicBool::new(true),
        }
    }

    /// Blocks until the lock is granted in arrival order, or fails if the
    /// lock is (or becomes) closed while waiting. A waiter that bails out
    /// passes its grant on so the queue keeps draining.
    pub(crate) fn acquire(&self) -> Result<HeapGuard<'_>, LockRevoked> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LockRevoked);
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            hint::spin_loop();
        }
        if self.closed.load(Ordering::Acquire) {
            self.owner.fetch_add(1, Ordering::Release);
            return Err(LockRevoked);
        }
        Ok(HeapGuard { lock: self })
    }

    /// Revokes the lock. Call while holding the guard so no new owner can
    /// slip in between the decision and the revocation.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

pub(crate) struct HeapGuard<'a> {
    lock: &'a HeapLock,
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.fetch_add(1, Ordering::Release);
    }
}

/// The heap's lock was revoked (the heap was detached) before or while
/// the operation waited for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRevoked;

impl fmt::Display for LockRevoked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap lock revoked")
    }
}

impl core::error::Error for LockRevoked {}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn open_lock() -> HeapLock {
        let lock = HeapLock::new();
        lock.reopen();
        lock
    }

    #[test]
    fn new_lock_is_closed() {
        let lock = HeapLock::new();
        assert_eq!(lock.acquire().err(), Some(LockRevoked));
    }

    #[test]
    fn acquire_release_cycles() {
        let lock = open_lock();
        for _ in 0..8 {
            let guard = lock.acquire().unwrap();
            drop(guard);
        }
    }

    #[test]
    fn close_fails_queued_and_later_acquires() {
        let lock = Arc::new(open_lock());
        let guard = lock.acquire().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire().map(drop))
        };

        lock.close();
        drop(guard);

        assert_eq!(waiter.join().unwrap(), Err(LockRevoked));
        assert_eq!(lock.acquire().err(), Some(LockRevoked));
    }

    #[test]
    fn contended_acquires_exclude_each_other() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;

        struct Shared {
            lock: HeapLock,
            counter: core::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: open_lock(),
            counter: core::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let _guard = shared.lock.acquire().unwrap();
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let _guard = shared.lock.acquire().unwrap();
        assert_eq!(unsafe { *shared.counter.get() }, THREADS * ROUNDS);
    }
}
