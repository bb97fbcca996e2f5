//! The process context the host kernel hands to the VFS.
//!
//! The crate never asks the scheduler for "the current process"; instead,
//! every path-based entry point receives a [`Proc`] carrying the two pieces
//! of per-process state the file system cares about: the working directory
//! and the open-file table.

use core::sync::atomic::{AtomicU32, Ordering};

use array_macro::array;

use crate::file::RcFile;
use crate::fs::{Filesystem, RcInode};
use crate::lock::{Guard, RawLock};
use crate::param::NOFILE;

/// Yields a sleeping thread performs before re-checking its condition even
/// without a wakeup.
const SLEEP_ROUNDS: usize = 64;

fn task_yield() {
    cfg_if::cfg_if! {
        if #[cfg(test)] {
            std::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

/// A channel threads sleep on while waiting for a condition to change.
///
/// Sleeping releases the guard's lock, so the thread that will change the
/// condition can get in. Wakeups are advisory: `sleep` may also return
/// spuriously, so callers re-check their condition in a loop.
pub struct WaitChannel {
    /// Bumped by every wakeup; sleepers watch it while parked.
    ticket: AtomicU32,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            ticket: AtomicU32::new(0),
        }
    }

    /// Atomically releases the lock behind `guard`, parks until a wakeup
    /// arrives or a bounded number of yields elapses, and re-acquires the
    /// lock before returning.
    pub fn sleep<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        let ticket = self.ticket.load(Ordering::Acquire);
        guard.reacquire_after(|| {
            for _ in 0..SLEEP_ROUNDS {
                if self.ticket.load(Ordering::Acquire) != ticket {
                    break;
                }
                task_yield();
            }
        });
    }

    /// Wakes up all sleepers on this channel.
    pub fn wakeup(&self) {
        let _ = self.ticket.fetch_add(1, Ordering::AcqRel);
    }
}

/// Per-process state consumed by the VFS: the working directory and the
/// file-descriptor table.
pub struct Proc<FS: Filesystem> {
    /// Current directory. Always `Some` after construction; the `Option`
    /// only exists so teardown can drop the reference.
    cwd: Option<RcInode<FS>>,

    /// Open files, indexed by file descriptor.
    pub ofile: [Option<RcFile<FS>>; NOFILE],
}

impl<FS: Filesystem> Proc<FS> {
    /// Creates a process context rooted at `cwd` (usually `Vfs::root()`).
    pub fn new(cwd: RcInode<FS>) -> Self {
        Self {
            cwd: Some(cwd),
            ofile: array![_ => None; NOFILE],
        }
    }

    /// The current working directory.
    pub fn cwd(&self) -> &RcInode<FS> {
        self.cwd.as_ref().expect("proc: no cwd")
    }

    /// Replaces the working directory, releasing the reference to the old
    /// one.
    pub(crate) fn chdir(&mut self, to: RcInode<FS>) {
        self.cwd = Some(to);
    }

    /// Fetches the open file behind descriptor `fd`.
    pub fn argfd(&self, fd: usize) -> Result<&RcFile<FS>, ()> {
        self.ofile.get(fd).and_then(|f| f.as_ref()).ok_or(())
    }

    /// Allocates a file descriptor for the given file. Takes over the file
    /// reference from the caller on success; drops (and thereby closes) it
    /// when the table is full.
    pub fn fdalloc(&mut self, f: RcFile<FS>) -> Result<usize, ()> {
        let fd = some_or!(self.ofile.iter().position(|f| f.is_none()), return Err(()));
        self.ofile[fd] = Some(f);
        Ok(fd)
    }
}
