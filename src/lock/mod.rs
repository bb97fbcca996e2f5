//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion.
//!
//! Two raw locks back the [`Lock`] type:
//!
//! * [`RawSpinLock`]: short-term mutual exclusion; contended acquirers busy
//!   wait. Guards table-level metadata (reference counts, slot identity).
//! * [`RawSleepLock`]: long-term mutual exclusion; contended acquirers give
//!   up the processor instead of spinning. Guards everything that may be
//!   held across disk I/O, such as an inode's on-disk mirror.
//!
//! A spin lock must never be held across a sleep-lock acquisition; the code
//! in this crate acquires sleep locks only while holding no spin lock, or
//! after temporarily releasing one with [`Guard::reacquire_after`].

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleeplock;
mod spinlock;

pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
}

/// Locks that provide mutual exclusion and own their own `RawLock`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock + Send + Sync, T: Send> Sync for Lock<R, T> {}

/// Guards that guarantee exclusive mutable access to the lock's inner data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

unsafe impl<'s, R: RawLock + Send + Sync, T: Sync> Sync for Guard<'s, R, T> {}

/// Returns a new `SpinLock` with name `name` and data `data`.
pub const fn new_spin_lock<T>(name: &'static str, data: T) -> SpinLock<T> {
    Lock::new(RawSpinLock::new(name), data)
}

/// Returns a new `SleepLock` with name `name` and data `data`.
pub const fn new_sleep_lock<T>(name: &'static str, data: T) -> SleepLock<T> {
    Lock::new(RawSleepLock::new(name), data)
}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();

        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn raw_lock(&self) -> &R {
        &self.lock
    }

    /// Returns a raw pointer to the inner data.
    /// The returned pointer is valid until this lock is moved or dropped.
    /// The caller must ensure that accessing the pointer does not incur race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a mutable reference of the lock.
        unsafe { &mut *self.get_mut_raw() }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Unlocks the lock.
    ///
    /// # Safety
    ///
    /// Use this only when we acquired the lock but did `mem::forget()` to
    /// the guard.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock and calls function `f`.
    /// After `f` returns, reacquires the lock and returns the result of the
    /// function call.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<'a, R: RawLock, T> Guard<'a, R, T> {
    pub fn get_lock(&self) -> &'a Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard implies the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard implies the lock is held, and `&mut self` is
        // exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
