//! The generic file-system layer.
//!
//! Every concrete filesystem plugs into the kernel through one vector of
//! operations, the [`Filesystem`] trait; the structures in this module
//! (superblock, inode table, dentry table, file table) are shared by every
//! backend. [`Vfs`] bundles them for one mounted filesystem and carries the
//! system-call surface (see `sysfile.rs`).
//!
//! The generic layer owns naming, reference counting, and lock ordering;
//! the backend owns the disk format. Backends are dispatched through the
//! trait the way the original function vectors were: an inode reaches its
//! operations through the `Vfs` it is bound to.

use spin::Once;

use crate::arena::{Arena, ArrayArena};
use crate::fcntl::FcntlFlags;
use crate::file::{Devsw, FTable, File, FileType, RcFile};
use crate::lock::{new_spin_lock, SpinLock};
use crate::param::NDEV;
use crate::pipe::PipeTable;

mod dentry;
mod inode;
mod path;
mod stat;

pub use dentry::{Dentry, Dtable, RcDentry};
pub use inode::{Inode, InodeGuard, InodeInner, InodeType, Itable, RcInode};
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEVICE, T_DIR, T_FILE};

/// Directory entries and dentries carry names of at most `DIRSIZ` bytes.
pub const DIRSIZ: usize = 14;

/// The operation vector of one filesystem type.
///
/// Methods that take an [`InodeGuard`] require the caller to hold the
/// inode's sleep lock; the guard parameter makes that a compile-time fact.
pub trait Filesystem: 'static + Sized + Send + Sync {
    /// Backend-private inode state: present exactly when the on-disk fields
    /// have been materialized in memory by `update_lock`.
    type Private: 'static + Send;

    /// One-time filesystem-type initialization, e.g. reading the on-disk
    /// superblock. Fails fatally on a malformed filesystem.
    fn init(&self, dev: u32);

    /// Returns an initialized superblock rooted at a valid inode. Called
    /// once per filesystem instance, after `init`.
    fn mount(&self, vfs: &'static Vfs<Self>, dev: u32) -> SuperBlock<Self>;

    /// Allocates a fresh inode of type `typ` on disk and returns it
    /// referenced but unlocked, or `None` when no free on-disk slot
    /// remains.
    fn alloc_inode(
        &self,
        vfs: &'static Vfs<Self>,
        dev: u32,
        typ: InodeType,
    ) -> Option<RcInode<Self>>;

    /// Returns the inode-table entry for `(dev, inum)`, referenced.
    /// Dropping the returned handle undoes the reference.
    fn geti(&self, vfs: &'static Vfs<Self>, dev: u32, inum: u32) -> RcInode<Self> {
        vfs.itable().get_inode(vfs, dev, inum)
    }

    /// Materializes the on-disk inode fields into `inner` the first time
    /// the inode is locked after entering the table. Must leave
    /// `inner.private` present.
    fn update_lock(&self, ip: &Inode<Self>, inner: &mut InodeInner<Self>);

    /// Flushes every on-disk-visible inode field.
    fn write_inode(&self, ip: &mut InodeGuard<'_, Self>);

    /// Drops in-memory backend state. Called when the last reference goes
    /// away while `nlink > 0`; the next lock re-materializes.
    fn release_inode(&self, ip: &mut InodeGuard<'_, Self>);

    /// Permanently frees the inode on disk. Called when the last reference
    /// goes away with `nlink == 0`, after the type has been zeroed and
    /// written back.
    fn free_inode(&self, ip: &mut InodeGuard<'_, Self>);

    /// Releases all data blocks and sets the size to zero.
    fn trunc(&self, ip: &mut InodeGuard<'_, Self>);

    /// Allocates a file object bound to `ip`, honouring the mode flags.
    /// Rejects device inodes with out-of-range major numbers.
    fn open(&self, ip: RcInode<Self>, omode: FcntlFlags) -> Result<RcFile<Self>, ()>;

    /// Copies up to `dst.len()` bytes starting at `off` out of the inode.
    /// Returns the number of bytes copied, which is short at end of file.
    fn read(&self, ip: &mut InodeGuard<'_, Self>, dst: &mut [u8], off: u32) -> Result<usize, ()>;

    /// Copies `src` into the inode at `off`, extending the size and
    /// persisting the inode. Bounded by the maximum-file policy. A short
    /// count means the disk filled up mid-write.
    fn write(&self, ip: &mut InodeGuard<'_, Self>, src: &[u8], off: u32) -> Result<usize, ()>;

    /// Finalizes backend state for the freshly linked child `ip` of `dir`
    /// described by `target` (e.g. persisting device numbers).
    fn create(
        &self,
        dir: &mut InodeGuard<'_, Self>,
        ip: &mut InodeGuard<'_, Self>,
        target: &Dentry<Self>,
        typ: InodeType,
    ) -> Result<(), ()>;

    /// Inserts `target`'s (name, child) into the directory `dir`. Fails if
    /// the name already exists.
    fn link(&self, dir: &mut InodeGuard<'_, Self>, target: &Dentry<Self>) -> Result<(), ()>;

    /// Removes `target`'s name from the directory `dir`.
    fn unlink(&self, dir: &mut InodeGuard<'_, Self>, target: &Dentry<Self>) -> Result<(), ()>;

    /// Searches the directory `dir` for `name`. The caller owns, and
    /// eventually drops, the returned dentry.
    fn dirlookup(
        &self,
        dir: &mut InodeGuard<'_, Self>,
        name: &FileName,
    ) -> Result<RcDentry<Self>, ()>;

    /// True iff `dir` contains only "." and "..".
    fn isdirempty(&self, dir: &mut InodeGuard<'_, Self>) -> bool;
}

/// Singleton per mounted filesystem.
pub struct SuperBlock<FS: Filesystem> {
    /// Device the filesystem is mounted from.
    pub dev: u32,

    /// Root directory inode.
    root: RcInode<FS>,

    /// Mount point in an enclosing namespace; reserved for nested mounts.
    pub mountpoint: Option<RcDentry<FS>>,

    /// Enclosing superblock; reserved for nested mounts.
    pub parent: Option<&'static SuperBlock<FS>>,
}

impl<FS: Filesystem> SuperBlock<FS> {
    pub fn new(dev: u32, root: RcInode<FS>) -> Self {
        Self {
            dev,
            root,
            mountpoint: None,
            parent: None,
        }
    }

    pub fn root(&self) -> &RcInode<FS> {
        &self.root
    }
}

/// One mounted filesystem: the backend plus the shared tables of the
/// generic layer.
///
/// Inodes and files carry back-references to their `Vfs` for their whole
/// life, hence the `&'static self` receivers on the mount- and path-level
/// entry points. Hosts keep the `Vfs` in static storage (or leak a box, as
/// the tests do).
pub struct Vfs<FS: Filesystem> {
    fs: FS,
    itable: Itable<FS>,
    dtable: Dtable<FS>,
    ftable: FTable<FS>,
    pipes: PipeTable,
    devsw: SpinLock<[Devsw; NDEV]>,
    sb: Once<SuperBlock<FS>>,
}

impl<FS: Filesystem> Vfs<FS> {
    pub fn new(fs: FS) -> Self {
        Self {
            fs,
            itable: new_spin_lock("itable", ArrayArena::new()),
            dtable: new_spin_lock("dtable", ArrayArena::new()),
            ftable: new_spin_lock("ftable", ArrayArena::new()),
            pipes: new_spin_lock("pipes", ArrayArena::new()),
            devsw: new_spin_lock("devsw", [Devsw::new(); NDEV]),
            sb: Once::new(),
        }
    }

    /// Mounts the filesystem rooted at device `dev`. Call once, before any
    /// other operation.
    pub fn mount(&'static self, dev: u32) {
        self.fs.init(dev);
        let _ = self.sb.call_once(|| self.fs.mount(self, dev));
    }

    fn super_block(&self) -> &SuperBlock<FS> {
        self.sb.get().expect("vfs: not mounted")
    }

    /// A fresh reference to the root directory inode.
    pub fn root(&self) -> RcInode<FS> {
        self.super_block().root.clone()
    }

    pub fn fs(&self) -> &FS {
        &self.fs
    }

    pub fn itable(&self) -> &Itable<FS> {
        &self.itable
    }

    pub fn dtable(&self) -> &Dtable<FS> {
        &self.dtable
    }

    pub fn ftable(&self) -> &FTable<FS> {
        &self.ftable
    }

    pub(crate) fn pipes(&self) -> &PipeTable {
        &self.pipes
    }

    /// Allocates a file object.
    pub fn alloc_file(
        &self,
        typ: FileType<FS>,
        readable: bool,
        writable: bool,
    ) -> Result<RcFile<FS>, ()> {
        self.ftable
            .alloc(|f| *f = File::new(typ, readable, writable))
            .ok_or(())
    }

    /// Registers device functions for major number `major`.
    pub fn set_devsw(&self, major: u16, dev: Devsw) -> Result<(), ()> {
        let mut tab = self.devsw.lock();
        let slot = tab.get_mut(major as usize).ok_or(())?;
        *slot = dev;
        Ok(())
    }

    pub(crate) fn devsw(&self, major: u16) -> Result<Devsw, ()> {
        self.devsw.lock().get(major as usize).copied().ok_or(())
    }
}
