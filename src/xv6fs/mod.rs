//! The xv6-style concrete filesystem.
//!
//! Four layers over the buffer cache:
//!   + Blocks: allocator for raw disk blocks (a bitmap scan).
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inodes with special contents (a list of other inodes).
//!   + The [`Filesystem`] operations the generic layer dispatches through.
//!
//! The higher-level system-call implementations live with the generic
//! layer, in `sysfile.rs`.

use core::cmp;
use core::sync::atomic::AtomicU32;

use spin::Once;
use zerocopy::{AsBytes, LayoutVerified};

use crate::bio::{Bcache, DiskDevice};
use crate::fcntl::FcntlFlags;
use crate::file::{FileType, RcFile};
use crate::fs::{
    Dentry, FileName, Filesystem, Inode, InodeGuard, InodeInner, InodeType, RcDentry, RcInode, Vfs,
};
use crate::param::{BSIZE, NDEV};

mod inode;
pub mod mkfs;
mod superblock;

pub use inode::{Dinode, Dirent, DiskAddrs, DIRENT_SIZE, MAXFILE, NDIRECT, NINDIRECT};
pub use superblock::{Superblock, BPB, FSMAGIC, IPB};

/// Root i-number.
pub const ROOTINO: u32 = 1;

pub struct Xv6fs<D: DiskDevice> {
    /// Read once by `init`. There should be one superblock per disk device,
    /// but we run with only one device.
    superblock: Once<Superblock>,

    bcache: Bcache<D>,
}

impl<D: DiskDevice> Xv6fs<D> {
    pub fn new(disk: D) -> Self {
        Self {
            superblock: Once::new(),
            bcache: Bcache::new(disk),
        }
    }

    pub fn bcache(&self) -> &Bcache<D> {
        &self.bcache
    }

    fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("xv6fs: not initialized")
    }

    /// Zeroes a block.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut bp = self.bcache.read(dev, bno);
        bp.data_mut().fill(0);
        self.bcache.write(&bp);
    }

    /// Allocates a zeroed disk block, or `None` when the disk is full.
    fn balloc(&self, dev: u32) -> Option<u32> {
        let sb = self.superblock();
        for b in num_iter::range_step(0, sb.size, BPB as u32) {
            let mut bp = self.bcache.read(dev, sb.bblock(b));
            for bi in 0..cmp::min(BPB as u32, sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    // The block is free: mark it in use.
                    bp.data_mut()[(bi / 8) as usize] |= m;
                    self.bcache.write(&bp);
                    drop(bp);
                    self.bzero(dev, b + bi);
                    return Some(b + bi);
                }
            }
        }
        None
    }

    /// Frees a disk block. Freeing a free block is fatal.
    fn bfree(&self, dev: u32, b: u32) {
        let sb = self.superblock();
        let mut bp = self.bcache.read(dev, sb.bblock(b));
        let bi = b as usize % BPB;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data()[bi / 8] & m, 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        self.bcache.write(&bp);
    }
}

impl<D: DiskDevice> Filesystem for Xv6fs<D> {
    type Private = DiskAddrs;

    fn init(&self, dev: u32) {
        if self.superblock.get().is_none() {
            let bp = self.bcache.read(dev, 1);
            let _ = self.superblock.call_once(|| Superblock::new(&bp));
        }
    }

    fn mount(&self, vfs: &'static Vfs<Self>, dev: u32) -> crate::fs::SuperBlock<Self> {
        crate::fs::SuperBlock::new(dev, self.geti(vfs, dev, ROOTINO))
    }

    /// Scans the on-disk inode run for a free slot (type 0), marks it
    /// allocated with `typ`, and returns the in-memory handle.
    fn alloc_inode(
        &self,
        vfs: &'static Vfs<Self>,
        dev: u32,
        typ: InodeType,
    ) -> Option<RcInode<Self>> {
        let sb = self.superblock();
        for inum in 1..sb.ninodes {
            let mut bp = self.bcache.read(dev, sb.iblock(inum));
            let mut dinodes = LayoutVerified::<&mut [u8], [Dinode]>::new_slice(
                &mut bp.data_mut()[..],
            )
            .expect("ialloc: dinode view");
            let dip = &mut dinodes[inum as usize % IPB];
            if dip.typ == 0 {
                // A free inode: mark it allocated on the disk.
                *dip = Dinode::default();
                dip.set_itype(typ);
                drop(dinodes);
                self.bcache.write(&bp);
                drop(bp);
                return Some(self.geti(vfs, dev, inum));
            }
        }
        None
    }

    fn update_lock(&self, ip: &Inode<Self>, inner: &mut InodeInner<Self>) {
        let sb = self.superblock();
        let bp = self.bcache.read(ip.dev, sb.iblock(ip.inum));
        let dinodes = LayoutVerified::<&[u8], [Dinode]>::new_slice(&bp.data()[..])
            .expect("ilock: dinode view");
        let dip = &dinodes[ip.inum as usize % IPB];
        inner.typ = dip.to_itype();
        inner.nlink = dip.nlink;
        inner.size = dip.size;
        inner.private = Some(DiskAddrs {
            direct: dip.addr_direct,
            indirect: dip.addr_indirect,
        });
    }

    fn write_inode(&self, ip: &mut InodeGuard<'_, Self>) {
        let (typ, nlink, size, addrs) = {
            let inner = ip.deref_inner();
            (
                inner.typ,
                inner.nlink,
                inner.size,
                *inner.private.as_ref().expect("iupdate: not materialized"),
            )
        };
        let sb = self.superblock();
        let mut bp = self.bcache.read(ip.dev, sb.iblock(ip.inum));
        let mut dinodes = LayoutVerified::<&mut [u8], [Dinode]>::new_slice(&mut bp.data_mut()[..])
            .expect("iupdate: dinode view");
        let dip = &mut dinodes[ip.inum as usize % IPB];
        dip.set_itype(typ);
        dip.nlink = nlink;
        dip.size = size;
        dip.addr_direct = addrs.direct;
        dip.addr_indirect = addrs.indirect;
        drop(dinodes);
        self.bcache.write(&bp);
    }

    fn release_inode(&self, ip: &mut InodeGuard<'_, Self>) {
        // Drop the in-memory mirror; the next lock re-materializes it.
        let inner = ip.deref_inner_mut();
        inner.private = None;
        inner.typ = InodeType::None;
    }

    fn free_inode(&self, ip: &mut InodeGuard<'_, Self>) {
        // The on-disk slot was freed by writing back the zeroed type; only
        // the in-memory mirror is left to drop.
        ip.deref_inner_mut().private = None;
    }

    fn trunc(&self, ip: &mut InodeGuard<'_, Self>) {
        let dev = ip.dev;
        for i in 0..NDIRECT {
            let addr = Self::addrs(ip).direct[i];
            if addr != 0 {
                self.bfree(dev, addr);
                Self::addrs_mut(ip).direct[i] = 0;
            }
        }

        let indirect = Self::addrs(ip).indirect;
        if indirect != 0 {
            {
                let bp = self.bcache.read(dev, indirect);
                let entries = LayoutVerified::<&[u8], [u32]>::new_slice(&bp.data()[..])
                    .expect("itrunc: indirect view");
                for a in entries.iter() {
                    if *a != 0 {
                        self.bfree(dev, *a);
                    }
                }
            }
            self.bfree(dev, indirect);
            Self::addrs_mut(ip).indirect = 0;
        }

        ip.deref_inner_mut().size = 0;
        self.write_inode(ip);
    }

    fn open(&self, ip: RcInode<Self>, omode: FcntlFlags) -> Result<RcFile<Self>, ()> {
        let vfs = ip.vfs();
        let typ = {
            let guard = ip.lock();
            let typ = guard.deref_inner().typ;
            drop(guard);
            typ
        };

        if let InodeType::Device { major, .. } = typ {
            if major as usize >= NDEV {
                return Err(());
            }
        }

        let readable = !omode.intersects(FcntlFlags::O_WRONLY);
        let writable = omode.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR);
        let f = match typ {
            InodeType::Device { major, .. } => {
                vfs.alloc_file(FileType::Device { ip, major }, readable, writable)?
            }
            _ => vfs.alloc_file(
                FileType::Inode {
                    ip,
                    off: AtomicU32::new(0),
                },
                readable,
                writable,
            )?,
        };

        if omode.contains(FcntlFlags::O_TRUNC) && typ == InodeType::File {
            match &f.typ {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                    let mut guard = ip.lock();
                    self.trunc(&mut guard);
                }
                _ => panic!("xv6fs: open"),
            }
        }
        Ok(f)
    }

    fn read(&self, ip: &mut InodeGuard<'_, Self>, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        let size = ip.deref_inner().size;
        let mut n = dst.len() as u32;
        if off > size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot: u32 = 0;
        let mut off = off;
        while tot < n {
            let addr = some_or!(self.bmap(ip, off as usize / BSIZE), break);
            let bp = self.bcache.read(ip.dev, addr);
            let m = cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            dst[tot as usize..(tot + m) as usize]
                .copy_from_slice(&bp.data()[begin..begin + m as usize]);
            drop(bp);
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    fn write(&self, ip: &mut InodeGuard<'_, Self>, src: &[u8], off: u32) -> Result<usize, ()> {
        let n = src.len() as u32;
        if off > ip.deref_inner().size {
            return Err(());
        }
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot: u32 = 0;
        let mut off_cur = off;
        while tot < n {
            let addr = some_or!(self.bmap_or_alloc(ip, off_cur as usize / BSIZE), break);
            let mut bp = self.bcache.read(ip.dev, addr);
            let m = cmp::min(n - tot, BSIZE as u32 - off_cur % BSIZE as u32);
            let begin = (off_cur % BSIZE as u32) as usize;
            bp.data_mut()[begin..begin + m as usize]
                .copy_from_slice(&src[tot as usize..(tot + m) as usize]);
            self.bcache.write(&bp);
            drop(bp);
            tot += m;
            off_cur += m;
        }

        if off_cur > ip.deref_inner().size {
            ip.deref_inner_mut().size = off_cur;
        }

        // Write the inode back even when the size is unchanged: the loop
        // above may have added fresh blocks to the address list.
        self.write_inode(ip);
        Ok(tot as usize)
    }

    fn create(
        &self,
        _dir: &mut InodeGuard<'_, Self>,
        ip: &mut InodeGuard<'_, Self>,
        _target: &Dentry<Self>,
        typ: InodeType,
    ) -> Result<(), ()> {
        // Persist the final type, and with it the device numbers, of the
        // freshly linked child.
        ip.deref_inner_mut().typ = typ;
        self.write_inode(ip);
        Ok(())
    }

    fn link(&self, dir: &mut InodeGuard<'_, Self>, target: &Dentry<Self>) -> Result<(), ()> {
        let name = target.name();

        // The name must not be present yet.
        if let Ok(de) = self.dirlookup(dir, name) {
            drop(de);
            return Err(());
        }

        // Look for an empty dirent; append when there is none.
        let size = dir.deref_inner().size;
        let (mut de, off) = self
            .iter_dirents(dir)
            .find(|(de, _)| de.inum == 0)
            .unwrap_or((Dirent::default(), size));
        de.inum = target.inode().inum as u16;
        de.set_name(name);
        if self.write(dir, de.as_bytes(), off)? != DIRENT_SIZE {
            return Err(());
        }
        Ok(())
    }

    fn unlink(&self, dir: &mut InodeGuard<'_, Self>, target: &Dentry<Self>) -> Result<(), ()> {
        let name = target.name();
        let size = dir.deref_inner().size;
        let mut off = 0;
        while off < size {
            let de = self.read_dirent(dir, off).expect("unlink: read");
            if de.inum != 0 && de.get_name() == name {
                let zero = Dirent::default();
                let n = self.write(dir, zero.as_bytes(), off);
                assert_eq!(n, Ok(DIRENT_SIZE), "unlink: writei");
            }
            off += DIRENT_SIZE as u32;
        }
        Ok(())
    }

    fn dirlookup(
        &self,
        dir: &mut InodeGuard<'_, Self>,
        name: &FileName,
    ) -> Result<RcDentry<Self>, ()> {
        assert_eq!(dir.deref_inner().typ, InodeType::Dir, "dirlookup not DIR");
        let vfs = dir.vfs();
        let dev = dir.dev;
        let dinum = dir.inum;

        let (de, _off) = some_or!(
            self.iter_dirents(dir)
                .find(|(de, _)| de.inum != 0 && de.get_name() == name),
            return Err(())
        );

        let parent = self.geti(vfs, dev, dinum);
        let child = self.geti(vfs, dev, de.inum as u32);
        vfs.dtable().alloc_dentry(parent, child, name)
    }

    fn isdirempty(&self, dir: &mut InodeGuard<'_, Self>) -> bool {
        let size = dir.deref_inner().size;
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < size {
            let de = self.read_dirent(dir, off).expect("isdirempty: read");
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}
