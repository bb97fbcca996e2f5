//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure holds
//! metadata: the file's type, its size, the number of links referring to
//! it, and the list of blocks holding the file's content.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple threads. The
//! in-memory inodes include book-keeping information that is not stored on
//! disk: the slot's reference count, and whether the backend-private state
//! has been materialized.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file-system code:
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   The backend's `alloc_inode` allocates, and dropping the last handle
//!   frees if the link count has also fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if its
//!   reference count is zero. Otherwise the count tracks the number of
//!   in-memory handles to the entry (open files, current directories,
//!   dentries). [`Itable::get_inode`] finds or creates an entry and
//!   increments its count; dropping an [`RcInode`] decrements it.
//!
//! * Materialized: the information (type, size, &c) in a table entry is
//!   only correct when `private` is present. [`Inode::lock`] reads the
//!   inode from disk on first acquisition; dropping the last handle
//!   releases the private state again.
//!
//! * Locked: file-system code may only examine and modify the information
//!   in an inode and its content if it has first locked the inode.
//!
//! Thus a typical sequence is:
//! ```text
//!   let ip = itable.get_inode(vfs, dev, inum);  // iget
//!   let guard = ip.lock();                      // ilock
//!   ... examine and modify through the guard ...
//!   drop(guard);                                // iunlock
//!   drop(ip);                                   // iput
//! ```
//!
//! `lock` is separate from `get_inode` so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g., in read). The separation also helps avoid
//! deadlock and races during pathname lookup: the resolver never locks a
//! child before it has unlocked and released the parent.
//!
//! The inode-table spin lock protects slot allocation: the reference count,
//! `dev`, and `inum` of every entry. The per-inode sleep lock protects all
//! other fields; one must hold it to read or write the type, size, link
//! count, or backend-private state.

use core::mem;
use core::ops::Deref;

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::lock::{new_sleep_lock, SleepLock, SpinLock};
use crate::param::NINODE;
use crate::proc::Proc;

use super::stat::{T_DEVICE, T_DIR, T_FILE};
use super::{FileName, Filesystem, Path, RcDentry, Stat, Vfs};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

impl InodeType {
    /// The type code reported by `Stat` and stored on disk.
    pub fn code(self) -> i16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => T_DIR,
            InodeType::File => T_FILE,
            InodeType::Device { .. } => T_DEVICE,
        }
    }
}

/// In-memory copy of the on-disk inode fields.
pub struct InodeInner<FS: Filesystem> {
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,

    /// Backend-private state, e.g. the block-address list. Present exactly
    /// when the on-disk fields have been materialized; mirrors the disk as
    /// of the last `write_inode`.
    pub private: Option<FS::Private>,
}

/// In-memory copy of an inode.
pub struct Inode<FS: Filesystem> {
    /// Device number.
    pub dev: u32,

    /// Inode number.
    pub inum: u32,

    /// The mounted filesystem this inode is bound to; it stands in for the
    /// operations and superblock pointers. Written when the table slot is
    /// claimed, under the table lock.
    vfs: Option<&'static Vfs<FS>>,

    pub inner: SleepLock<InodeInner<FS>>,
}

// Manual impls instead of relying on auto-derivation: `Inode<FS>` sits on a
// reference cycle (`Inode` -> `Vfs` -> `SuperBlock` -> `RcInode` ->
// `Inode`) that makes the compiler's auto-trait search overflow. `FS`
// itself is already `Send + Sync` (see `Filesystem`'s supertraits), and
// every field is guarded by a lock or is plain data, so this holds for the
// same reason the derived impl would have, had it been computable.
unsafe impl<FS: Filesystem> Send for Inode<FS> {}
unsafe impl<FS: Filesystem> Sync for Inode<FS> {}

impl<FS: Filesystem> Default for Inode<FS> {
    fn default() -> Self {
        Self {
            dev: 0,
            inum: 0,
            vfs: None,
            inner: new_sleep_lock(
                "inode",
                InodeInner {
                    typ: InodeType::None,
                    nlink: 0,
                    size: 0,
                    private: None,
                },
            ),
        }
    }
}

impl<FS: Filesystem> Inode<FS> {
    /// The mounted filesystem this inode belongs to.
    pub fn vfs(&self) -> &'static Vfs<FS> {
        self.vfs.expect("inode: not bound")
    }

    /// Locks the inode, materializing its on-disk fields first if this is
    /// the first acquisition since the entry was (re)claimed.
    pub fn lock(&self) -> InodeGuard<'_, FS> {
        let mut guard = self.inner.lock();
        if guard.private.is_none() {
            self.vfs().fs().update_lock(self, &mut guard);
            assert!(guard.private.is_some(), "ilock: not materialized");
            assert_ne!(guard.typ, InodeType::None, "ilock: no type");
        }
        mem::forget(guard);
        InodeGuard { inode: self }
    }
}

impl<FS: Filesystem> ArenaObject for Inode<FS> {
    /// The slow half of dropping the last reference to an in-memory inode.
    /// If the inode also has no links to it, frees the inode (and its
    /// content) on disk; otherwise writes it back and releases the
    /// backend-private state.
    fn finalize<A: Arena<Data = Self>>(&mut self, guard: &mut A::Guard<'_>) {
        if self.inner.get_mut().private.is_none() {
            // Admitted to the table but never locked: nothing on disk to
            // reconcile.
            return;
        }
        let vfs = self.vfs();
        let this: &Self = self;

        // Write-back and freeing do disk I/O, so release the table lock
        // meanwhile. No thread revives the entry while it is out: a dead
        // inode (nlink == 0) is named by no directory entry anymore, and a
        // live one that gets re-fetched concurrently simply re-materializes
        // after we are done.
        A::reacquire_after(guard, move || {
            // The reference count is 1, so no other thread can have the
            // inode locked: this acquisition won't block (or deadlock).
            let mut ip = this.lock();
            if ip.deref_inner().nlink == 0 {
                // No links and no other references: truncate and free.
                ip.deref_inner_mut().typ = InodeType::None;
                vfs.fs().trunc(&mut ip);
                vfs.fs().write_inode(&mut ip);
                vfs.fs().free_inode(&mut ip);
            } else {
                vfs.fs().write_inode(&mut ip);
                vfs.fs().release_inode(&mut ip);
            }
            drop(ip);
        });
    }
}

/// Asserts that the inode's sleep lock is held by the current thread.
/// Dropping the guard unlocks; dropping the handle afterwards releases the
/// reference (the unlock-then-put idiom).
pub struct InodeGuard<'a, FS: Filesystem> {
    pub inode: &'a Inode<FS>,
}

impl<FS: Filesystem> Deref for InodeGuard<'_, FS> {
    type Target = Inode<FS>;

    fn deref(&self) -> &Self::Target {
        self.inode
    }
}

impl<FS: Filesystem> InodeGuard<'_, FS> {
    pub fn deref_inner(&self) -> &InodeInner<FS> {
        // SAFETY: self.inner is locked.
        unsafe { &*self.inode.inner.get_mut_raw() }
    }

    pub fn deref_inner_mut(&mut self) -> &mut InodeInner<FS> {
        // SAFETY: self.inner is locked and &mut self is exclusive.
        unsafe { &mut *self.inode.inner.get_mut_raw() }
    }

    /// Copies the modified in-memory inode to disk. Call after every change
    /// to an on-disk-visible field.
    pub fn update(&mut self) {
        let vfs = self.inode.vfs();
        vfs.fs().write_inode(self);
    }

    /// Releases all data blocks; the size becomes zero.
    pub fn trunc(&mut self) {
        let vfs = self.inode.vfs();
        vfs.fs().trunc(self);
    }

    /// Copies up to `dst.len()` bytes starting at `off` out of the inode.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        let vfs = self.inode.vfs();
        vfs.fs().read(self, dst, off)
    }

    /// Copies `src` into the inode at `off`.
    pub fn write_bytes(&mut self, src: &[u8], off: u32) -> Result<usize, ()> {
        let vfs = self.inode.vfs();
        vfs.fs().write(self, src, off)
    }

    /// Looks `name` up in this directory. The caller owns, and eventually
    /// drops, the returned dentry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<RcDentry<FS>, ()> {
        let vfs = self.inode.vfs();
        vfs.fs().dirlookup(self, name)
    }

    /// True iff this directory contains nothing beyond "." and "..".
    pub fn is_dir_empty(&mut self) -> bool {
        let vfs = self.inode.vfs();
        vfs.fs().isdirempty(self)
    }

    /// Copies stat information out of the inode.
    pub fn stat(&self) -> Stat {
        let inner = self.deref_inner();
        Stat {
            dev: self.inode.dev,
            ino: self.inode.inum,
            typ: inner.typ.code(),
            nlink: inner.nlink,
            size: inner.size as usize,
        }
    }
}

impl<FS: Filesystem> Drop for InodeGuard<'_, FS> {
    fn drop(&mut self) {
        // SAFETY: `Inode::lock` acquired the sleep lock and forgot its
        // guard.
        unsafe { self.inode.inner.unlock() };
    }
}

/// The in-memory inode table.
pub type Itable<FS> = SpinLock<ArrayArena<Inode<FS>, NINODE>>;

/// A reference-counted handle to an in-memory inode.
pub type RcInode<FS> = Rc<Itable<FS>>;

impl<FS: Filesystem> Itable<FS> {
    /// Finds the inode with number `inum` on device `dev` and returns its
    /// in-memory copy, claiming a free slot on a miss. Does not lock the
    /// inode and does not read it from disk. Table exhaustion is fatal.
    pub fn get_inode(&self, vfs: &'static Vfs<FS>, dev: u32, inum: u32) -> RcInode<FS> {
        self.find_or_alloc(
            |ip| ip.dev == dev && ip.inum == inum,
            |ip| {
                ip.dev = dev;
                ip.inum = inum;
                ip.vfs = Some(vfs);
                ip.inner.get_mut().private = None;
            },
        )
        .expect("iget: no inodes")
    }
}

impl<FS: Filesystem> Vfs<FS> {
    /// Looks up and returns the inode for `path`.
    pub fn namei(&'static self, path: &Path, proc: &Proc<FS>) -> Result<RcInode<FS>, ()> {
        Ok(self.namex(path, false, proc)?.0)
    }

    /// Returns the parent directory of the object `path` names, plus the
    /// final path component.
    ///
    /// The parent comes back *unlocked* but referenced; callers lock it
    /// themselves before looking further.
    pub fn nameiparent<'p>(
        &'static self,
        path: &'p Path,
        proc: &Proc<FS>,
    ) -> Result<(RcInode<FS>, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true, proc)?;
        let name = name.ok_or(())?;
        Ok((ip, name))
    }

    /// The shared walk behind `namei` and `nameiparent`.
    ///
    /// At most one inode lock is held at any point: a child is never locked
    /// until the parent has been both unlocked and released, which rules
    /// out parent-child deadlocks between concurrent walks.
    fn namex<'p>(
        &'static self,
        mut path: &'p Path,
        parent: bool,
        proc: &Proc<FS>,
    ) -> Result<(RcInode<FS>, Option<&'p FileName>), ()> {
        let mut ptr = if path.is_absolute() {
            self.root()
        } else {
            proc.cwd().clone()
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut ip = ptr.lock();
            if ip.deref_inner().typ != InodeType::Dir {
                return Err(());
            }
            if parent && path.is_empty() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let de = ip.dirlookup(name)?;
            let next = de.inode().clone();
            drop(de);
            drop(ip);
            ptr = next;
        }
        if parent {
            // The path named the root or had no final component.
            return Err(());
        }
        Ok((ptr, None))
    }
}
