//! Spin locks.
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinLock {
    /// Name of lock for debugging.
    name: &'static str,

    /// `true` when some thread holds the lock.
    locked: AtomicBool,
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// The atomic exchange with `Acquire` ordering pairs with the `Release`
    /// store in `release()`, so all stores done in one critical section are
    /// visible to loads in the next.
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
