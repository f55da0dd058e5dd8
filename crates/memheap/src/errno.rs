//! Last-error slot for failures that operations cannot return.
//!
//! `free` returns nothing and `allocate`/`reallocate` signal exhaustion
//! and lock revocation the same way (a `None` result), so a revoked lock
//! is additionally recorded here. Exhaustion never touches the slot.
//!
//! The slot is a single process-wide word; an RTOS integration would
//! typically map one slot per thread or per core.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::lock::LockRevoked;

const NONE: u8 = 0;
const LOCK_REVOKED: u8 = 1;

static LAST_ERROR: AtomicU8 = AtomicU8::new(NONE);

pub(crate) fn record(_err: LockRevoked) {
    LAST_ERROR.store(LOCK_REVOKED, Ordering::Relaxed);
}

/// Returns the most recently recorded failure without clearing it.
pub fn last_error() -> Option<LockRevoked> {
    (LAST_ERROR.load(Ordering::Relaxed) == LOCK_REVOKED).then_some(LockRevoked)
}

/// Returns and clears the most recently recorded failure.
pub fn take_error() -> Option<LockRevoked> {
    (LAST_ERROR.swap(NONE, Ordering::Relaxed) == LOCK_REVOKED).then_some(LockRevoked)
}
