//! Buffer cache.
//!
//! The buffer cache is a table of buffers holding cached copies of disk
//! block contents. Caching disk blocks in memory reduces the number of disk
//! reads and also provides a synchronization point for disk blocks used by
//! multiple threads.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call [`Bcache::read`].
//! * After changing buffer data, call [`Bcache::write`] to write it to disk.
//! * When done with the buffer, drop it.
//! * To keep a block cached across a sleep, hold a [`Buf::pin`] handle.
//! * Only one thread at a time can use a buffer, so do not keep them longer
//!   than necessary.

use core::mem;
use core::ops::{Deref, DerefMut};

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::lock::{new_sleep_lock, new_spin_lock, SleepLock, SpinLock};
use crate::param::{BSIZE, NBUF};

/// The disk beneath the cache: fixed-size blocks addressed by number.
///
/// `dev` distinguishes devices the way the `(dev, blockno)` buffer identity
/// does; single-device hosts may ignore it.
pub trait DiskDevice: 'static + Send + Sync {
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData);
    fn write(&self, dev: u32, blockno: u32, data: &BufData);
}

/// One block of buffered data.
// The backend takes u32 views of buffer contents (indirect blocks), so the
// data must have an alignment of at least 4 bytes.
#[repr(align(4))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl BufData {
    pub const fn zeroed() -> Self {
        Self { inner: [0; BSIZE] }
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub struct BufEntry {
    dev: u32,
    blockno: u32,
    inner: SleepLock<BufInner>,
}

struct BufInner {
    /// Has data been read from disk?
    valid: bool,

    data: BufData,
}

impl BufEntry {
    pub fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            inner: new_sleep_lock(
                "buffer",
                BufInner {
                    valid: false,
                    data: BufData::zeroed(),
                },
            ),
        }
    }
}

impl Default for BufEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaObject for BufEntry {
    fn finalize<A: Arena<Data = Self>>(&mut self, _guard: &mut A::Guard<'_>) {
        // The buffer contents were written through on every `Bcache::write`.
        // Does nothing.
    }
}

pub type BufTable = SpinLock<ArrayArena<BufEntry, NBUF>>;

/// An unlocked reference-counted handle to a cache entry. Holding one keeps
/// the block pinned in the cache (the bpin/bunpin counterpart); dropping it
/// unpins.
pub struct BufUnlocked {
    inner: Rc<BufTable>,
}

impl BufUnlocked {
    /// Locks the entry and returns the locked buffer.
    pub fn lock(self) -> Buf {
        mem::forget(self.inner.inner.lock());
        Buf { inner: self.inner }
    }
}

impl Deref for BufUnlocked {
    type Target = BufEntry;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A locked buffer. Dropping it releases the buffer back to the cache.
///
/// # Safety
///
/// The entry's sleep lock is held for the lifetime of this value.
pub struct Buf {
    inner: Rc<BufTable>,
}

impl Buf {
    fn deref_inner(&self) -> &BufInner {
        let entry: &BufEntry = &self.inner;
        // SAFETY: entry.inner is locked.
        unsafe { &*entry.inner.get_mut_raw() }
    }

    fn deref_inner_mut(&mut self) -> &mut BufInner {
        let entry: &BufEntry = &self.inner;
        // SAFETY: entry.inner is locked and `&mut self` is exclusive.
        unsafe { &mut *entry.inner.get_mut_raw() }
    }

    pub fn dev(&self) -> u32 {
        self.inner.dev
    }

    pub fn blockno(&self) -> u32 {
        self.inner.blockno
    }

    /// The buffer's data.
    pub fn data(&self) -> &BufData {
        &self.deref_inner().data
    }

    /// The buffer's data, for modification. Follow up with
    /// [`Bcache::write`] to make the change durable.
    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.deref_inner_mut().data
    }

    /// Returns an unlocked handle that keeps the entry cached after this
    /// buffer is dropped.
    pub fn pin(&self) -> BufUnlocked {
        BufUnlocked {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: the lock was acquired in `BufUnlocked::lock` and its guard
        // forgotten; the handle dropped right after this releases the entry.
        unsafe { self.inner.inner.unlock() };
    }
}

/// The buffer cache: a bounded table of blocks shared by every thread that
/// touches the disk.
pub struct Bcache<D: DiskDevice> {
    bufs: BufTable,
    disk: D,
}

impl<D: DiskDevice> Bcache<D> {
    pub fn new(disk: D) -> Self {
        Self {
            bufs: new_spin_lock("bcache", ArrayArena::new()),
            disk,
        }
    }

    /// Returns a pinned, unlocked handle for `(dev, blockno)` without
    /// touching the disk.
    fn get_buf(&self, dev: u32, blockno: u32) -> BufUnlocked {
        BufUnlocked {
            inner: self
                .bufs
                .find_or_alloc(
                    |b| b.dev == dev && b.blockno == blockno,
                    |b| {
                        b.dev = dev;
                        b.blockno = blockno;
                        b.inner.get_mut().valid = false;
                    },
                )
                .expect("bread: no buffers"),
        }
    }

    /// Returns a locked buffer with the contents of the indicated block.
    pub fn read(&self, dev: u32, blockno: u32) -> Buf {
        let mut buf = self.get_buf(dev, blockno).lock();
        if !buf.deref_inner().valid {
            self.disk.read(dev, blockno, &mut buf.deref_inner_mut().data);
            buf.deref_inner_mut().valid = true;
        }
        buf
    }

    /// Writes the buffer's contents through to the disk. The caller keeps
    /// the locked buffer.
    pub fn write(&self, b: &Buf) {
        self.disk.write(b.dev(), b.blockno(), b.data());
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }
}
