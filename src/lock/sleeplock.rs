//! Sleeping locks.
//!
//! Long-term locks for data that is held across disk I/O. Contended
//! acquirers give up the processor through a [`WaitChannel`] instead of
//! spinning, so a thread that sleeps inside the critical section does not
//! starve everyone else.

use super::{new_spin_lock, Guard, Lock, RawLock, SpinLock};
use crate::proc::WaitChannel;

/// Long-term lock whose contended acquirers yield.
pub struct RawSleepLock {
    /// Guards `held`; held only for the instant of the state change.
    held: SpinLock<bool>,

    /// Waiters park here until the holder releases.
    waitchannel: WaitChannel,
}

/// Locks that sleep instead of busy wait.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
/// Guards of `SleepLock<T>`.
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            held: new_spin_lock(name, false),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.waitchannel.sleep(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock();
        assert!(*held, "releasesleep");
        *held = false;
        drop(held);
        self.waitchannel.wakeup();
    }
}
