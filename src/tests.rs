//! End-to-end tests over an in-memory disk.
//!
//! Unit tests live beside their modules; everything here goes through the
//! system-call surface the way a host kernel would, with a fresh formatted
//! RAM disk per test.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::bio::{BufData, DiskDevice};
use crate::fcntl::FcntlFlags;
use crate::file::Devsw;
use crate::fs::{InodeGuard, Path, Stat, Vfs, T_DEVICE, T_DIR, T_FILE};
use crate::param::{BSIZE, ROOTDEV};
use crate::proc::Proc;
use crate::xv6fs::{mkfs, Xv6fs, BPB, IPB, MAXFILE};

const FSSIZE: u32 = 2000;
const NINODES: u32 = 200;

#[derive(Clone)]
struct RamDisk {
    blocks: Arc<Mutex<Vec<u8>>>,
}

impl RamDisk {
    fn new(nblocks: u32) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(vec![0; nblocks as usize * BSIZE])),
        }
    }

    /// Raw bytes of one block, straight from the disk image.
    fn raw(&self, blockno: u32) -> Vec<u8> {
        let blocks = self.blocks.lock().unwrap();
        blocks[blockno as usize * BSIZE..(blockno as usize + 1) * BSIZE].to_vec()
    }
}

impl DiskDevice for RamDisk {
    fn read(&self, _dev: u32, blockno: u32, data: &mut BufData) {
        let blocks = self.blocks.lock().unwrap();
        let base = blockno as usize * BSIZE;
        let dst: &mut [u8; BSIZE] = data;
        dst.copy_from_slice(&blocks[base..base + BSIZE]);
    }

    fn write(&self, _dev: u32, blockno: u32, data: &BufData) {
        let mut blocks = self.blocks.lock().unwrap();
        let base = blockno as usize * BSIZE;
        let src: &[u8; BSIZE] = data;
        blocks[base..base + BSIZE].copy_from_slice(src);
    }
}

type TestFs = Xv6fs<RamDisk>;

fn mount_over(disk: RamDisk) -> &'static Vfs<TestFs> {
    let vfs: &'static Vfs<TestFs> = Box::leak(Box::new(Vfs::new(Xv6fs::new(disk))));
    vfs.mount(ROOTDEV);
    vfs
}

fn fresh() -> (&'static Vfs<TestFs>, Proc<TestFs>, RamDisk) {
    let disk = RamDisk::new(FSSIZE);
    mkfs::mkfs(&disk, ROOTDEV, FSSIZE, NINODES);
    let vfs = mount_over(disk.clone());
    let proc = Proc::new(vfs.root());
    (vfs, proc, disk)
}

fn p(s: &str) -> &Path {
    Path::new(s)
}

fn fstat(vfs: &'static Vfs<TestFs>, proc: &Proc<TestFs>, fd: usize) -> Stat {
    let mut st = Stat {
        dev: 0,
        ino: 0,
        typ: 0,
        nlink: 0,
        size: 0,
    };
    vfs.sys_fstat(proc, fd, &mut st).unwrap();
    st
}

/// Number of set bits in the (single) free-map block.
fn bitmap_ones(disk: &RamDisk) -> u32 {
    let ninodeblocks = NINODES / IPB as u32 + 1;
    assert!(FSSIZE < BPB as u32);
    let bmapstart = 2 + ninodeblocks;
    disk.raw(bmapstart).iter().map(|b| b.count_ones()).sum()
}

const RDONLY: FcntlFlags = FcntlFlags::O_RDONLY;

#[test]
fn create_write_read_roundtrip() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/a"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"hello"), Ok(5));
    vfs.sys_close(&mut proc, fd).unwrap();

    let fd = vfs.sys_open(&mut proc, p("/a"), RDONLY).unwrap();
    let mut buf = [0; 5];
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Ok(5));
    assert_eq!(&buf, b"hello");
    // The offset advanced past the end: further reads return 0 bytes.
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Ok(0));
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn unlink_refuses_nonempty_directories() {
    let (vfs, mut proc, _disk) = fresh();

    assert_eq!(vfs.sys_mkdir(&proc, p("/d")), Ok(0));
    let fd = vfs
        .sys_open(&mut proc, p("/d/f"), FcntlFlags::O_CREATE)
        .unwrap();
    vfs.sys_close(&mut proc, fd).unwrap();

    assert_eq!(vfs.sys_unlink(&proc, p("/d")), Err(()));
    assert_eq!(vfs.sys_unlink(&proc, p("/d/f")), Ok(0));
    assert_eq!(vfs.sys_unlink(&proc, p("/d")), Ok(0));
    assert_eq!(vfs.sys_open(&mut proc, p("/d"), RDONLY), Err(()));
}

#[test]
fn unlink_refuses_dot_names() {
    let (vfs, proc, _disk) = fresh();
    assert_eq!(vfs.sys_mkdir(&proc, p("/d")), Ok(0));
    assert_eq!(vfs.sys_unlink(&proc, p("/d/.")), Err(()));
    assert_eq!(vfs.sys_unlink(&proc, p("/d/..")), Err(()));
}

#[test]
fn link_shares_the_inode() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/x"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"shared"), Ok(6));
    vfs.sys_close(&mut proc, fd).unwrap();

    assert_eq!(vfs.sys_link(&proc, p("/x"), p("/y")), Ok(0));

    let fd = vfs.sys_open(&mut proc, p("/y"), RDONLY).unwrap();
    assert_eq!(fstat(vfs, &proc, fd).nlink, 2);
    vfs.sys_close(&mut proc, fd).unwrap();

    assert_eq!(vfs.sys_unlink(&proc, p("/x")), Ok(0));
    assert_eq!(vfs.sys_open(&mut proc, p("/x"), RDONLY), Err(()));

    let fd = vfs.sys_open(&mut proc, p("/y"), RDONLY).unwrap();
    let st = fstat(vfs, &proc, fd);
    assert_eq!(st.nlink, 1);
    let mut buf = [0; 6];
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Ok(6));
    assert_eq!(&buf, b"shared");
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn linking_directories_fails() {
    let (vfs, proc, _disk) = fresh();
    assert_eq!(vfs.sys_mkdir(&proc, p("/d")), Ok(0));
    assert_eq!(vfs.sys_link(&proc, p("/d"), p("/e")), Err(()));
    // The failed link must not leak a link count.
    let mut proc = proc;
    let fd = vfs.sys_open(&mut proc, p("/d"), RDONLY).unwrap();
    assert_eq!(fstat(vfs, &proc, fd).typ, T_DIR);
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn truncate_returns_every_data_block() {
    let (vfs, mut proc, disk) = fresh();
    let baseline = bitmap_ones(&disk);

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/z"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    let zeros = vec![0u8; 12_288];
    assert_eq!(vfs.sys_write(&proc, fd, &zeros), Ok(12_288));
    assert_eq!(fstat(vfs, &proc, fd).size, 12_288);
    vfs.sys_close(&mut proc, fd).unwrap();
    assert!(bitmap_ones(&disk) > baseline);

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/z"),
            FcntlFlags::O_WRONLY | FcntlFlags::O_TRUNC,
        )
        .unwrap();
    assert_eq!(fstat(vfs, &proc, fd).size, 0);
    vfs.sys_close(&mut proc, fd).unwrap();

    // No data blocks remain allocated to the inode.
    assert_eq!(bitmap_ones(&disk), baseline);
}

#[test]
fn indirect_blocks_persist_across_mounts() {
    let (vfs, mut proc, disk) = fresh();
    let baseline = bitmap_ones(&disk);

    // Thirteen blocks: one past the direct range.
    let mut data = vec![0u8; 13 * BSIZE];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let fd = vfs
        .sys_open(
            &mut proc,
            p("/big"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, &data), Ok(13 * BSIZE));
    assert_eq!(fstat(vfs, &proc, fd).size, 13 * BSIZE);
    vfs.sys_close(&mut proc, fd).unwrap();

    // A second mount over the same image sees the same bytes, so the
    // indirect block was both allocated and persisted.
    let vfs2 = mount_over(disk.clone());
    let mut proc2 = Proc::new(vfs2.root());
    let fd = vfs2.sys_open(&mut proc2, p("/big"), RDONLY).unwrap();
    let mut back = vec![0u8; 13 * BSIZE];
    assert_eq!(vfs2.sys_read(&proc2, fd, &mut back), Ok(13 * BSIZE));
    assert_eq!(back, data);
    vfs2.sys_close(&mut proc2, fd).unwrap();

    assert_eq!(vfs2.sys_unlink(&proc2, p("/big")), Ok(0));
    assert_eq!(bitmap_ones(&disk), baseline);
}

#[test]
fn chdir_makes_relative_paths_resolve() {
    let (vfs, mut proc, _disk) = fresh();

    assert_eq!(vfs.sys_mkdir(&proc, p("/d")), Ok(0));
    assert_eq!(vfs.sys_chdir(&mut proc, p("/d")), Ok(0));

    let fd = vfs.sys_open(&mut proc, p("f"), FcntlFlags::O_CREATE).unwrap();
    let st_rel = fstat(vfs, &proc, fd);
    vfs.sys_close(&mut proc, fd).unwrap();

    let fd = vfs.sys_open(&mut proc, p("/d/f"), RDONLY).unwrap();
    let st_abs = fstat(vfs, &proc, fd);
    vfs.sys_close(&mut proc, fd).unwrap();

    assert_eq!((st_rel.dev, st_rel.ino), (st_abs.dev, st_abs.ino));

    // Walking back up restores the old working directory exactly.
    assert_eq!(vfs.sys_chdir(&mut proc, p("..")), Ok(0));
    let fd = vfs.sys_open(&mut proc, p("."), RDONLY).unwrap();
    let st_cwd = fstat(vfs, &proc, fd);
    vfs.sys_close(&mut proc, fd).unwrap();

    let fd = vfs.sys_open(&mut proc, p("/"), RDONLY).unwrap();
    let st_root = fstat(vfs, &proc, fd);
    vfs.sys_close(&mut proc, fd).unwrap();
    assert_eq!((st_cwd.dev, st_cwd.ino), (st_root.dev, st_root.ino));
}

#[test]
fn pipe_carries_bytes_between_descriptors() {
    let (vfs, mut proc, _disk) = fresh();
    let files_before = vfs.ftable().lock().live();

    let (fd0, fd1) = vfs.sys_pipe(&mut proc).unwrap();
    assert_eq!(vfs.sys_write(&proc, fd1, b"x"), Ok(1));
    let mut buf = [0; 1];
    assert_eq!(vfs.sys_read(&proc, fd0, &mut buf), Ok(1));
    assert_eq!(&buf, b"x");

    // Close the write end: the reader sees end of file.
    vfs.sys_close(&mut proc, fd1).unwrap();
    assert_eq!(vfs.sys_read(&proc, fd0, &mut buf), Ok(0));
    vfs.sys_close(&mut proc, fd0).unwrap();

    // Both file objects went back to the table.
    assert_eq!(vfs.ftable().lock().live(), files_before);
}

#[test]
fn pipe_write_blocks_until_read() {
    let (vfs, _proc, _disk) = fresh();
    let (rf, wf) = vfs.pipealloc().unwrap();

    let writer = thread::spawn(move || {
        // Four buffers' worth: must wait for the reader to drain.
        let data = [7u8; 2048];
        assert_eq!(wf.write(&data), Ok(2048));
    });

    let mut total = 0;
    let mut buf = [0u8; 256];
    while total < 2048 {
        let r = rf.read(&mut buf).unwrap();
        assert!(r > 0);
        assert!(buf[..r].iter().all(|b| *b == 7));
        total += r;
    }
    writer.join().unwrap();
}

#[test]
fn open_close_leaves_reference_counts_unchanged() {
    let (vfs, mut proc, _disk) = fresh();
    let fd = vfs.sys_open(&mut proc, p("/a"), FcntlFlags::O_CREATE).unwrap();
    vfs.sys_close(&mut proc, fd).unwrap();

    let inodes_before = vfs.itable().lock().live();
    let files_before = vfs.ftable().lock().live();

    let fd = vfs.sys_open(&mut proc, p("/a"), RDONLY).unwrap();
    assert_eq!(vfs.itable().lock().live(), inodes_before + 1);
    vfs.sys_close(&mut proc, fd).unwrap();

    assert_eq!(vfs.itable().lock().live(), inodes_before);
    assert_eq!(vfs.ftable().lock().live(), files_before);
}

#[test]
fn create_then_unlink_restores_the_disk() {
    let (vfs, mut proc, disk) = fresh();
    let ninodeblocks = NINODES / IPB as u32 + 1;
    let baseline_ones = bitmap_ones(&disk);

    let cycle = |proc: &mut Proc<TestFs>| {
        let fd = vfs
            .sys_open(proc, p("/t"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
            .unwrap();
        assert_eq!(vfs.sys_write(proc, fd, b"transient"), Ok(9));
        vfs.sys_close(proc, fd).unwrap();
        assert_eq!(vfs.sys_unlink(proc, p("/t")), Ok(0));
    };

    // The first cycle may grow the root directory by one record; after
    // that, create/unlink must be a perfect round trip on disk.
    cycle(&mut proc);
    assert_eq!(bitmap_ones(&disk), baseline_ones);
    let steady: Vec<Vec<u8>> = (2..2 + ninodeblocks + 1).map(|b| disk.raw(b)).collect();

    cycle(&mut proc);
    assert_eq!(bitmap_ones(&disk), baseline_ones);
    let again: Vec<Vec<u8>> = (2..2 + ninodeblocks + 1).map(|b| disk.raw(b)).collect();

    // Inode blocks and the free map are bit-exact across the round trip.
    assert_eq!(steady, again);
}

#[test]
fn fourteen_byte_names_resolve_and_longer_ones_truncate() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(&mut proc, p("/abcdefghijklmn"), FcntlFlags::O_CREATE)
        .unwrap();
    let st = fstat(vfs, &proc, fd);
    vfs.sys_close(&mut proc, fd).unwrap();

    // A fifteen-byte component is truncated to fourteen bytes and thus
    // names the same entry.
    let fd = vfs.sys_open(&mut proc, p("/abcdefghijklmno"), RDONLY).unwrap();
    assert_eq!(fstat(vfs, &proc, fd).ino, st.ino);
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn writes_stop_at_the_maximum_file_size() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/max"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    let data = vec![1u8; MAXFILE * BSIZE];
    assert_eq!(vfs.sys_write(&proc, fd, &data), Ok(MAXFILE * BSIZE));
    assert_eq!(fstat(vfs, &proc, fd).size, MAXFILE * BSIZE);

    // One byte past the limit is rejected and changes nothing.
    assert_eq!(vfs.sys_write(&proc, fd, b"!"), Err(()));
    assert_eq!(fstat(vfs, &proc, fd).size, MAXFILE * BSIZE);
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn directories_only_open_read_only() {
    let (vfs, mut proc, _disk) = fresh();
    assert_eq!(vfs.sys_open(&mut proc, p("/"), FcntlFlags::O_WRONLY), Err(()));
    assert_eq!(vfs.sys_open(&mut proc, p("/"), FcntlFlags::O_RDWR), Err(()));

    let fd = vfs.sys_open(&mut proc, p("/"), RDONLY).unwrap();
    assert_eq!(fstat(vfs, &proc, fd).typ, T_DIR);
    vfs.sys_close(&mut proc, fd).unwrap();
}

#[test]
fn modes_gate_reads_and_writes() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/m"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    let mut buf = [0; 4];
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Err(()));
    vfs.sys_close(&mut proc, fd).unwrap();

    let fd = vfs.sys_open(&mut proc, p("/m"), RDONLY).unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"nope"), Err(()));
    vfs.sys_close(&mut proc, fd).unwrap();
}

fn console_read(buf: &mut [u8]) -> i32 {
    for b in buf.iter_mut() {
        *b = b'c';
    }
    buf.len() as i32
}

fn console_write(buf: &[u8]) -> i32 {
    buf.len() as i32
}

#[test]
fn device_nodes_dispatch_through_the_device_table() {
    let (vfs, mut proc, _disk) = fresh();
    vfs.set_devsw(
        1,
        Devsw {
            read: Some(console_read),
            write: Some(console_write),
        },
    )
    .unwrap();

    assert_eq!(vfs.sys_mknod(&proc, p("/console"), 1, 0), Ok(0));
    let fd = vfs.sys_open(&mut proc, p("/console"), FcntlFlags::O_RDWR).unwrap();
    assert_eq!(fstat(vfs, &proc, fd).typ, T_DEVICE);

    let mut buf = [0; 8];
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Ok(8));
    assert_eq!(&buf, b"cccccccc");
    assert_eq!(vfs.sys_write(&proc, fd, b"ignored"), Ok(7));
    vfs.sys_close(&mut proc, fd).unwrap();

    // Out-of-range major numbers are rejected at open time.
    assert_eq!(vfs.sys_mknod(&proc, p("/bogus"), 99, 0), Ok(0));
    assert_eq!(vfs.sys_open(&mut proc, p("/bogus"), RDONLY), Err(()));
}

#[test]
fn dup_shares_one_offset() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/o"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"abcdef"), Ok(6));
    vfs.sys_close(&mut proc, fd).unwrap();

    let fd = vfs.sys_open(&mut proc, p("/o"), RDONLY).unwrap();
    let fd2 = vfs.sys_dup(&mut proc, fd).unwrap();

    let mut buf = [0; 3];
    assert_eq!(vfs.sys_read(&proc, fd, &mut buf), Ok(3));
    assert_eq!(&buf, b"abc");
    assert_eq!(vfs.sys_read(&proc, fd2, &mut buf), Ok(3));
    assert_eq!(&buf, b"def");

    vfs.sys_close(&mut proc, fd).unwrap();
    vfs.sys_close(&mut proc, fd2).unwrap();
}

#[test]
fn unlinked_open_files_live_until_close() {
    let (vfs, mut proc, disk) = fresh();
    let baseline = bitmap_ones(&disk);

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/ghost"),
            FcntlFlags::O_CREATE | FcntlFlags::O_RDWR,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"boo"), Ok(3));
    assert_eq!(vfs.sys_unlink(&proc, p("/ghost")), Ok(0));

    // The name is gone but the open file still reads.
    assert_eq!(vfs.sys_open(&mut proc, p("/ghost"), RDONLY), Err(()));
    let st = fstat(vfs, &proc, fd);
    assert_eq!(st.nlink, 0);
    assert_eq!(st.size, 3);

    // The last close frees the inode and its blocks.
    vfs.sys_close(&mut proc, fd).unwrap();
    assert_eq!(bitmap_ones(&disk), baseline);
}

#[test]
fn exec_hands_the_image_to_the_loader() {
    let (vfs, mut proc, _disk) = fresh();

    let fd = vfs
        .sys_open(
            &mut proc,
            p("/prog"),
            FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
        )
        .unwrap();
    assert_eq!(vfs.sys_write(&proc, fd, b"\x7fELF"), Ok(4));
    vfs.sys_close(&mut proc, fd).unwrap();

    let magic = vfs
        .sys_exec(&proc, p("/prog"), |ip: &mut InodeGuard<'_, TestFs>| {
            let mut magic = [0u8; 4];
            if ip.read_bytes(&mut magic, 0)? != 4 {
                return Err(());
            }
            Ok(magic)
        })
        .unwrap();
    assert_eq!(&magic, b"\x7fELF");

    // Directories are not executable images.
    assert!(vfs
        .sys_exec(&proc, p("/"), |_: &mut InodeGuard<'_, TestFs>| Ok(()))
        .is_err());
}

#[test]
fn concurrent_lifecycles_do_not_interfere() {
    let (vfs, _proc, _disk) = fresh();

    let mut workers = Vec::new();
    for t in 0..4u8 {
        workers.push(thread::spawn(move || {
            let mut proc = Proc::new(vfs.root());
            let name = format!("/w{}", t);
            let mut data = vec![0u8; 3000];
            for b in data.iter_mut() {
                *b = t;
            }
            for _round in 0..5 {
                let fd = vfs
                    .sys_open(
                        &mut proc,
                        Path::new(&name),
                        FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
                    )
                    .unwrap();
                assert_eq!(vfs.sys_write(&proc, fd, &data), Ok(3000));
                vfs.sys_close(&mut proc, fd).unwrap();

                let fd = vfs.sys_open(&mut proc, Path::new(&name), RDONLY).unwrap();
                let mut back = vec![0u8; 3000];
                assert_eq!(vfs.sys_read(&proc, fd, &mut back), Ok(3000));
                assert_eq!(back, data);
                vfs.sys_close(&mut proc, fd).unwrap();

                assert_eq!(vfs.sys_unlink(&proc, Path::new(&name)), Ok(0));
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn stat_reports_regular_files() {
    let (vfs, mut proc, _disk) = fresh();
    let fd = vfs.sys_open(&mut proc, p("/s"), FcntlFlags::O_CREATE).unwrap();
    let st = fstat(vfs, &proc, fd);
    assert_eq!(st.typ, T_FILE);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.size, 0);
    assert_eq!(st.dev, ROOTDEV);
    vfs.sys_close(&mut proc, fd).unwrap();
}
