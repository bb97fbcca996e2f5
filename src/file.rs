//! Support functions for system calls that involve file descriptors.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::fs::{Filesystem, RcInode, Stat};
use crate::lock::SpinLock;
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::RcPipe;

/// A per-open-handle file object. Created on open, shared across `dup`
/// (handle clones), retired when the last handle drops.
pub struct File<FS: Filesystem> {
    pub typ: FileType<FS>,
    readable: bool,
    writable: bool,
}

pub enum FileType<FS: Filesystem> {
    None,
    Pipe { pipe: RcPipe },
    Inode { ip: RcInode<FS>, off: AtomicU32 },
    Device { ip: RcInode<FS>, major: u16 },
}

impl<FS: Filesystem> Default for FileType<FS> {
    fn default() -> Self {
        Self::None
    }
}

/// The system-wide open-file table.
pub type FTable<FS> = SpinLock<ArrayArena<File<FS>, NFILE>>;

/// A reference-counted handle to an open file. Cloning is `dup`; dropping
/// the last handle closes the file.
pub type RcFile<FS> = Rc<FTable<FS>>;

/// Maps a major device number to device functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(&mut [u8]) -> i32>,
    pub write: Option<fn(&[u8]) -> i32>,
}

impl Devsw {
    pub const fn new() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

impl Default for Devsw {
    fn default() -> Self {
        Self::new()
    }
}

impl<FS: Filesystem> File<FS> {
    pub const fn new(typ: FileType<FS>, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Copies metadata about the file into `st`. The caller forwards the
    /// struct to user memory.
    pub fn stat(&self, st: &mut Stat) -> Result<(), ()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let guard = ip.lock();
                *st = guard.stat();
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Reads from the file into `dst`, advancing the file offset by the
    /// number of bytes read.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(dst),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock();
                let cur = off.load(Ordering::Relaxed);
                let r = guard.read_bytes(dst, cur)?;
                // Sharers of one open file advance the offset from the
                // value each observed.
                off.store(cur + r as u32, Ordering::Relaxed);
                drop(guard);
                Ok(r)
            }
            FileType::Device { ip, major } => {
                let dev = ip.vfs().devsw(*major)?;
                let f = dev.read.ok_or(())?;
                let r = f(dst);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as usize)
                }
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Writes `src` to the file, advancing the offset. Inode-backed writes
    /// go a few blocks at a time to bound the buffer-cache working set of
    /// one operation; a short backend write aborts with an error.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(src),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to keep one operation's
                // buffer-cache working set bounded: i-node, indirect block,
                // allocation blocks, and two blocks of slop for unaligned
                // writes.
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                for chunk in src.chunks(max) {
                    let mut guard = ip.lock();
                    let cur = off.load(Ordering::Relaxed);
                    let r = guard.write_bytes(chunk, cur)?;
                    off.store(cur + r as u32, Ordering::Relaxed);
                    drop(guard);
                    if r != chunk.len() {
                        // The disk filled up mid-write.
                        return Err(());
                    }
                }
                Ok(src.len())
            }
            FileType::Device { ip, major } => {
                let dev = ip.vfs().devsw(*major)?;
                let f = dev.write.ok_or(())?;
                let r = f(src);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as usize)
                }
            }
            FileType::None => panic!("File::write"),
        }
    }
}

impl<FS: Filesystem> Default for File<FS> {
    fn default() -> Self {
        Self::new(FileType::None, false, false)
    }
}

impl<FS: Filesystem> ArenaObject for File<FS> {
    /// Closes the file on last release: drops the inode reference (which
    /// may write the inode back or free it) or closes the pipe end.
    fn finalize<A: Arena<Data = Self>>(&mut self, guard: &mut A::Guard<'_>) {
        let typ = mem::take(&mut self.typ);
        let writable = self.writable;
        self.readable = false;
        self.writable = false;

        // Closing touches other tables and possibly the disk; release the
        // file-table lock meanwhile.
        A::reacquire_after(guard, move || match typ {
            FileType::Pipe { pipe } => {
                pipe.close(writable);
                drop(pipe);
            }
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => drop(ip),
            FileType::None => (),
        });
    }
}
