//! File-system system calls.
//!
//! Mostly semantic checking: arguments arrive already marshalled (paths as
//! validated strings, user buffers bridged to borrowed slices), and the
//! calls land in the generic layer and the backend operations.

use scopeguard::ScopeGuard;

use crate::fcntl::FcntlFlags;
use crate::file::{FileType, RcFile};
use crate::fs::{FileName, Filesystem, InodeGuard, InodeType, Path, RcInode, Stat, Vfs};
use crate::proc::Proc;

fn fname(bytes: &'static [u8]) -> &'static FileName {
    // SAFETY: the dot names contain no NUL characters.
    unsafe { FileName::from_bytes(bytes) }
}

impl<FS: Filesystem> Vfs<FS> {
    /// Creates an inode at `path` with the given type and links it into its
    /// parent directory; the shared skeleton behind `open(O_CREATE)`,
    /// `mkdir`, and `mknod`. Runs `f` on the locked fresh inode (or, for
    /// `O_CREATE` finding an existing file or device, the found one) and
    /// returns the unlocked handle.
    fn create<F, T>(
        &'static self,
        proc: &Proc<FS>,
        path: &Path,
        typ: InodeType,
        f: F,
    ) -> Result<(RcInode<FS>, T), ()>
    where
        F: FnOnce(&mut InodeGuard<'_, FS>) -> T,
    {
        let (dpp, name) = self.nameiparent(path, proc)?;
        let mut dp = dpp.lock();

        if let Ok(de) = self.fs().dirlookup(&mut dp, name) {
            // The name already exists. Opening an existing file or device
            // with O_CREATE succeeds; everything else fails.
            let ptr2 = de.inode().clone();
            drop(de);
            drop(dp);
            if typ != InodeType::File {
                return Err(());
            }
            let mut ip = ptr2.lock();
            match ip.deref_inner().typ {
                InodeType::File | InodeType::Device { .. } => {}
                _ => return Err(()),
            }
            let ret = f(&mut ip);
            drop(ip);
            return Ok((ptr2, ret));
        }

        let ptr2 = some_or!(self.fs().alloc_inode(self, dp.dev, typ), return Err(()));
        let ip = ptr2.lock();
        let mut ip = scopeguard::guard(ip, |mut ip| {
            // Unwind a half-made inode: with the link count zeroed and
            // written back, the final release frees it on disk.
            ip.deref_inner_mut().nlink = 0;
            ip.update();
        });
        ip.deref_inner_mut().nlink = 1;
        ip.update();

        if typ == InodeType::Dir {
            // "." and "..". No nlink++ for ".": avoid a cyclic count.
            let de = self
                .dtable()
                .alloc_dentry(ptr2.clone(), ptr2.clone(), fname(b"."))?;
            self.fs().link(&mut *ip, &de)?;
            drop(de);

            let de = self
                .dtable()
                .alloc_dentry(ptr2.clone(), dpp.clone(), fname(b".."))?;
            self.fs().link(&mut *ip, &de)?;
            drop(de);
        }

        let de = self.dtable().alloc_dentry(dpp.clone(), ptr2.clone(), name)?;
        self.fs().link(&mut dp, &de)?;
        self.fs().create(&mut dp, &mut *ip, &de, typ)?;
        drop(de);

        if typ == InodeType::Dir {
            // Now that success is guaranteed, count the child's "..".
            dp.deref_inner_mut().nlink += 1;
            dp.update();
        }

        drop(dp);
        drop(dpp);

        let mut ip = ScopeGuard::into_inner(ip);
        let ret = f(&mut ip);
        drop(ip);
        Ok((ptr2, ret))
    }

    /// Returns a new file descriptor referring to the same file as `fd`.
    pub fn sys_dup(&self, proc: &mut Proc<FS>, fd: usize) -> Result<usize, ()> {
        let f = proc.argfd(fd)?.clone();
        proc.fdalloc(f)
    }

    /// Reads from `fd` into `buf`. Returns the number of bytes read.
    pub fn sys_read(&self, proc: &Proc<FS>, fd: usize, buf: &mut [u8]) -> Result<usize, ()> {
        let f = proc.argfd(fd)?;
        f.read(buf)
    }

    /// Writes `buf` to `fd`. Returns the number of bytes written; anything
    /// short of `buf.len()` is reported as an error by the file layer.
    pub fn sys_write(&self, proc: &Proc<FS>, fd: usize, buf: &[u8]) -> Result<usize, ()> {
        let f = proc.argfd(fd)?;
        f.write(buf)
    }

    /// Releases open file `fd`.
    pub fn sys_close(&self, proc: &mut Proc<FS>, fd: usize) -> Result<usize, ()> {
        let _ = proc.argfd(fd)?;
        proc.ofile[fd] = None;
        Ok(0)
    }

    /// Places info about an open file into `st`; the caller copies it out
    /// to user memory.
    pub fn sys_fstat(&self, proc: &Proc<FS>, fd: usize, st: &mut Stat) -> Result<usize, ()> {
        let f = proc.argfd(fd)?;
        f.stat(st)?;
        Ok(0)
    }

    /// Opens (and with O_CREATE, creates) `path`; returns the new file
    /// descriptor.
    pub fn sys_open(
        &'static self,
        proc: &mut Proc<FS>,
        path: &Path,
        omode: FcntlFlags,
    ) -> Result<usize, ()> {
        let ip = if omode.contains(FcntlFlags::O_CREATE) {
            let (ip, _) = self.create(proc, path, InodeType::File, |_| ())?;
            ip
        } else {
            let ip = self.namei(path, proc)?;
            let guard = ip.lock();
            if guard.deref_inner().typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
                return Err(());
            }
            drop(guard);
            ip
        };

        let f = self.fs().open(ip, omode)?;
        proc.fdalloc(f)
    }

    /// Creates a new directory.
    pub fn sys_mkdir(&'static self, proc: &Proc<FS>, path: &Path) -> Result<usize, ()> {
        let (ip, _) = self.create(proc, path, InodeType::Dir, |_| ())?;
        drop(ip);
        Ok(0)
    }

    /// Creates a new device file.
    pub fn sys_mknod(
        &'static self,
        proc: &Proc<FS>,
        path: &Path,
        major: u16,
        minor: u16,
    ) -> Result<usize, ()> {
        let (ip, _) = self.create(proc, path, InodeType::Device { major, minor }, |_| ())?;
        drop(ip);
        Ok(0)
    }

    /// Changes the process's working directory.
    pub fn sys_chdir(&'static self, proc: &mut Proc<FS>, path: &Path) -> Result<usize, ()> {
        let ip = self.namei(path, proc)?;
        {
            let guard = ip.lock();
            if guard.deref_inner().typ != InodeType::Dir {
                return Err(());
            }
        }
        proc.chdir(ip);
        Ok(0)
    }

    /// Creates `new` as a link to the same inode as `old`.
    pub fn sys_link(&'static self, proc: &Proc<FS>, old: &Path, new: &Path) -> Result<usize, ()> {
        let ip = self.namei(old, proc)?;

        {
            let mut guard = ip.lock();
            if guard.deref_inner().typ == InodeType::Dir {
                // Hard links to directories would let the tree cycle.
                return Err(());
            }
            guard.deref_inner_mut().nlink += 1;
            guard.update();
        }

        let res = (|| {
            let (dpp, name) = self.nameiparent(new, proc)?;
            let mut dp = dpp.lock();
            // Source and target must live on the same device.
            if dp.dev != ip.dev {
                return Err(());
            }
            let de = self.dtable().alloc_dentry(dpp.clone(), ip.clone(), name)?;
            self.fs().link(&mut dp, &de)
        })();

        if res.is_err() {
            let mut guard = ip.lock();
            guard.deref_inner_mut().nlink -= 1;
            guard.update();
        }
        drop(ip);
        res.map(|_| 0)
    }

    /// Removes `path` from its directory.
    pub fn sys_unlink(&'static self, proc: &Proc<FS>, path: &Path) -> Result<usize, ()> {
        let (dpp, name) = self.nameiparent(path, proc)?;
        let mut dp = dpp.lock();

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(());
        }

        let de = self.fs().dirlookup(&mut dp, name)?;
        let ipp = de.inode().clone();
        drop(de);

        // Directories form a tree, so parent-then-child locking cannot
        // deadlock.
        let mut ip = ipp.lock();
        assert!(ip.deref_inner().nlink >= 1, "unlink: nlink < 1");

        if ip.deref_inner().typ == InodeType::Dir && !ip.is_dir_empty() {
            return Err(());
        }

        let de = self.dtable().alloc_dentry(dpp.clone(), ipp.clone(), name)?;
        self.fs().unlink(&mut dp, &de)?;
        drop(de);

        if ip.deref_inner().typ == InodeType::Dir {
            dp.deref_inner_mut().nlink -= 1;
            dp.update();
        }
        drop(dp);
        drop(dpp);

        ip.deref_inner_mut().nlink -= 1;
        ip.update();
        drop(ip);
        drop(ipp);
        Ok(0)
    }

    /// Allocates a pipe pair: (read end, write end).
    pub fn pipealloc(&self) -> Result<(RcFile<FS>, RcFile<FS>), ()> {
        let pipe = self.pipes().alloc_pipe()?;
        let rf = self.alloc_file(FileType::Pipe { pipe: pipe.clone() }, true, false)?;
        let wf = ok_or!(self.alloc_file(FileType::Pipe { pipe }, false, true), {
            // Dropping the read end closes its side and frees the pipe.
            drop(rf);
            return Err(());
        });
        Ok((rf, wf))
    }

    /// Creates a pipe and installs both ends as file descriptors, returning
    /// (read fd, write fd); the caller copies them out to user memory.
    pub fn sys_pipe(&self, proc: &mut Proc<FS>) -> Result<(usize, usize), ()> {
        let (rf, wf) = self.pipealloc()?;
        let fd0 = proc.fdalloc(rf)?;
        let fd1 = ok_or!(proc.fdalloc(wf), {
            proc.ofile[fd0] = None;
            return Err(());
        });
        Ok((fd0, fd1))
    }

    /// Resolves `path` for execution and hands the locked image inode to
    /// `loader`; program loading itself belongs to the host kernel. Returns
    /// the loader's result.
    pub fn sys_exec<T, F>(&'static self, proc: &Proc<FS>, path: &Path, loader: F) -> Result<T, ()>
    where
        F: FnOnce(&mut InodeGuard<'_, FS>) -> Result<T, ()>,
    {
        let ip = self.namei(path, proc)?;
        let mut guard = ip.lock();
        if guard.deref_inner().typ != InodeType::File {
            return Err(());
        }
        let res = loader(&mut guard);
        drop(guard);
        drop(ip);
        res
    }
}
