//! On-disk inodes, block mapping, and directory records.

use core::iter::StepBy;
use core::mem;
use core::ops::Range;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::DiskDevice;
use crate::fs::{FileName, Filesystem, InodeGuard, InodeType, DIRSIZ, T_DEVICE, T_DIR, T_FILE};
use crate::param::BSIZE;

use super::Xv6fs;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 12;

/// Block addresses held by the indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// On-disk inode structure. Inodes are packed [`super::IPB`] to a block,
/// starting at `superblock.inodestart`; an inode's number indexes that run.
#[repr(C)]
#[derive(Copy, Clone, Default, FromBytes, AsBytes)]
pub struct Dinode {
    /// File type; 0 marks a free inode.
    pub typ: i16,

    /// Major device number (device inodes only).
    pub major: u16,

    /// Minor device number (device inodes only).
    pub minor: u16,

    /// Number of links to inode in file system.
    pub nlink: i16,

    /// Size of file (bytes).
    pub size: u32,

    /// Direct data block addresses.
    pub addr_direct: [u32; NDIRECT],

    /// Indirect data block address.
    pub addr_indirect: u32,
}

const_assert!(mem::size_of::<Dinode>() == 64);

impl Dinode {
    pub(super) fn to_itype(&self) -> InodeType {
        match self.typ {
            0 => InodeType::None,
            T_DIR => InodeType::Dir,
            T_FILE => InodeType::File,
            T_DEVICE => InodeType::Device {
                major: self.major,
                minor: self.minor,
            },
            t => panic!("dinode: unknown type {}", t),
        }
    }

    pub(crate) fn set_itype(&mut self, typ: InodeType) {
        let (t, major, minor) = match typ {
            InodeType::None => (0, 0, 0),
            InodeType::Dir => (T_DIR, 0, 0),
            InodeType::File => (T_FILE, 0, 0),
            InodeType::Device { major, minor } => (T_DEVICE, major, minor),
        };
        self.typ = t;
        self.major = major;
        self.minor = minor;
    }
}

/// Backend-private inode state: the in-memory mirror of the inode's
/// block-address list. The remaining on-disk fields live in the generic
/// inode.
#[derive(Copy, Clone, Default)]
pub struct DiskAddrs {
    pub direct: [u32; NDIRECT],
    pub indirect: u32,
}

/// Size of one directory record.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// A directory is a file containing a sequence of these records; a zero
/// `inum` marks a free slot.
#[repr(C)]
#[derive(Clone, Default, FromBytes, AsBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    pub(crate) fn new(inum: u16, name: &FileName) -> Self {
        let mut de = Self {
            inum,
            name: [0; DIRSIZ],
        };
        de.set_name(name);
        de
    }

    /// Fills in the name. If it is shorter than DIRSIZ, a NUL terminator is
    /// appended.
    pub(super) fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the slice which exactly contains the entry's name, without
    /// NUL characters.
    pub(super) fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        // SAFETY: self.name[..len] contains no NUL, and len <= DIRSIZ.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

pub(super) struct DirentIter<'s, 't, D: DiskDevice> {
    fs: &'s Xv6fs<D>,
    guard: &'s mut InodeGuard<'t, Xv6fs<D>>,
    iter: StepBy<Range<u32>>,
}

impl<D: DiskDevice> Iterator for DirentIter<'_, '_, D> {
    type Item = (Dirent, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let off = self.iter.next()?;
        let dirent = self.fs.read_dirent(self.guard, off).expect("DirentIter");
        Some((dirent, off))
    }
}

impl<D: DiskDevice> Xv6fs<D> {
    pub(super) fn iter_dirents<'s, 't>(
        &'s self,
        guard: &'s mut InodeGuard<'t, Self>,
    ) -> DirentIter<'s, 't, D> {
        let iter = (0..guard.deref_inner().size).step_by(DIRENT_SIZE);
        DirentIter {
            fs: self,
            guard,
            iter,
        }
    }

    pub(super) fn read_dirent(
        &self,
        ip: &mut InodeGuard<'_, Self>,
        off: u32,
    ) -> Result<Dirent, ()> {
        let mut bytes = [0; DIRENT_SIZE];
        if self.read(ip, &mut bytes, off)? != DIRENT_SIZE {
            return Err(());
        }
        Dirent::read_from(&bytes[..]).ok_or(())
    }

    pub(super) fn addrs<'a>(ip: &'a InodeGuard<'_, Self>) -> &'a DiskAddrs {
        ip.deref_inner().private.as_ref().expect("xv6fs: not materialized")
    }

    pub(super) fn addrs_mut<'a>(ip: &'a mut InodeGuard<'_, Self>) -> &'a mut DiskAddrs {
        ip.deref_inner_mut()
            .private
            .as_mut()
            .expect("xv6fs: not materialized")
    }

    pub(super) fn bmap(&self, ip: &mut InodeGuard<'_, Self>, bn: usize) -> Option<u32> {
        self.bmap_internal(ip, bn, false)
    }

    pub(super) fn bmap_or_alloc(&self, ip: &mut InodeGuard<'_, Self>, bn: usize) -> Option<u32> {
        self.bmap_internal(ip, bn, true)
    }

    /// Returns the disk address of the `bn`-th logical block of the inode.
    /// With `alloc`, missing blocks (and the indirect block itself) are
    /// allocated on the way; without it, a missing block yields `None`.
    /// Addressing past the direct plus indirect range is fatal.
    fn bmap_internal(&self, ip: &mut InodeGuard<'_, Self>, bn: usize, alloc: bool) -> Option<u32> {
        let dev = ip.dev;

        if bn < NDIRECT {
            let mut addr = Self::addrs(ip).direct[bn];
            if addr == 0 {
                if !alloc {
                    return None;
                }
                addr = self.balloc(dev)?;
                Self::addrs_mut(ip).direct[bn] = addr;
            }
            Some(addr)
        } else {
            let bn = bn - NDIRECT;
            assert!(bn < NINDIRECT, "bmap: out of range");

            let mut indirect = Self::addrs(ip).indirect;
            if indirect == 0 {
                if !alloc {
                    return None;
                }
                indirect = self.balloc(dev)?;
                Self::addrs_mut(ip).indirect = indirect;
            }

            let mut bp = self.bcache().read(dev, indirect);
            let mut entries = LayoutVerified::<&mut [u8], [u32]>::new_slice(&mut bp.data_mut()[..])
                .expect("bmap: indirect view");
            let mut addr = entries[bn];
            if addr == 0 {
                if !alloc {
                    return None;
                }
                addr = self.balloc(dev)?;
                entries[bn] = addr;
                drop(entries);
                self.bcache().write(&bp);
            }
            Some(addr)
        }
    }
}
