//! Dentries: name→inode bindings within a directory.
//!
//! A dentry serves two purposes. As a short-lived descriptor it communicates
//! the (parent, name, child) triple to the backend's link, unlink, and
//! create operations in one bundle. As a table entry it caches the binding a
//! lookup produced, but the cache is never authoritative: path resolution
//! re-reads the directory every time.
//!
//! Dentries hold *counted* references to both inodes; releasing a dentry
//! releases them. The `..` entry of a directory contributes to the on-disk
//! link count instead, so no in-memory cycle is ever formed.

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::lock::SpinLock;
use crate::param::NDENTRY;

use super::{FileName, Filesystem, RcInode, DIRSIZ};

pub struct Dentry<FS: Filesystem> {
    parent: Option<RcInode<FS>>,
    inode: Option<RcInode<FS>>,

    /// Fixed-width name; NUL-terminated when shorter than `DIRSIZ`.
    name: [u8; DIRSIZ],

    /// A filesystem is mounted on this dentry; reserved for nested mounts.
    pub ismount: bool,

    /// The binding has been removed from its directory.
    pub deleted: bool,
}

impl<FS: Filesystem> Default for Dentry<FS> {
    fn default() -> Self {
        Self {
            parent: None,
            inode: None,
            name: [0; DIRSIZ],
            ismount: false,
            deleted: false,
        }
    }
}

impl<FS: Filesystem> Dentry<FS> {
    /// The bound name.
    pub fn name(&self) -> &FileName {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        // SAFETY: self.name[..len] contains no NUL, and len <= DIRSIZ.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }

    fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// The child inode of the binding.
    pub fn inode(&self) -> &RcInode<FS> {
        self.inode.as_ref().expect("dentry: no inode")
    }

    /// The directory the binding lives in.
    pub fn parent(&self) -> &RcInode<FS> {
        self.parent.as_ref().expect("dentry: no parent")
    }
}

impl<FS: Filesystem> ArenaObject for Dentry<FS> {
    fn finalize<A: Arena<Data = Self>>(&mut self, guard: &mut A::Guard<'_>) {
        let parent = self.parent.take();
        let inode = self.inode.take();
        self.name = [0; DIRSIZ];
        self.ismount = false;
        self.deleted = false;

        // Releasing the inode references may write the inodes back; do that
        // without the dentry-table lock held.
        A::reacquire_after(guard, move || {
            drop(inode);
            drop(parent);
        });
    }
}

/// The dentry table: a bounded pool the lookups and directory mutations
/// draw their descriptors from.
pub type Dtable<FS> = SpinLock<ArrayArena<Dentry<FS>, NDENTRY>>;

/// An owned handle to a dentry. Dropping it releases the binding and both
/// inode references.
pub type RcDentry<FS> = Rc<Dtable<FS>>;

impl<FS: Filesystem> Dtable<FS> {
    /// Allocates a dentry binding `(parent, name, inode)`. Fails when the
    /// pool is exhausted.
    pub fn alloc_dentry(
        &self,
        parent: RcInode<FS>,
        inode: RcInode<FS>,
        name: &FileName,
    ) -> Result<RcDentry<FS>, ()> {
        self.alloc(|de| {
            de.parent = Some(parent);
            de.inode = Some(inode);
            de.set_name(name);
        })
        .ok_or(())
    }
}
