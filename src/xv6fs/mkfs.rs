//! Builds a fresh, empty filesystem image on a [`DiskDevice`].
//!
//! The writes go to the device directly, bypassing the buffer cache, so an
//! image must be formatted before the filesystem is mounted over it.

use core::mem;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, LayoutVerified};

use crate::bio::{BufData, DiskDevice};
use crate::fs::{FileName, InodeType};
use crate::param::BSIZE;

use super::{Dinode, Dirent, Superblock, BPB, DIRENT_SIZE, IPB, ROOTINO};

fn name(bytes: &[u8]) -> &FileName {
    // SAFETY: mkfs names contain no NUL characters.
    unsafe { FileName::from_bytes(bytes) }
}

/// Formats `dev` on `disk` as an empty filesystem of `size` blocks with
/// `ninodes` inode slots: boot block, superblock, an (empty) log run,
/// inode blocks, the free bitmap, then data blocks. The root directory
/// holds "." and "..".
pub fn mkfs<D: DiskDevice>(disk: &D, dev: u32, size: u32, ninodes: u32) {
    let nbitmap = size / BPB as u32 + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nlog = 0;

    // 1 boot block, 1 superblock, the log run, inode blocks, bitmap.
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta < size, "mkfs: image too small");
    // The root data block must fall inside the first bitmap block's reach.
    assert!((nmeta as usize) < BPB, "mkfs: metadata beyond first map block");

    let sb = Superblock::format(
        size,
        size - nmeta,
        ninodes,
        2 + nlog,
        2 + nlog + ninodeblocks,
        2,
    );

    // Zero the whole device.
    let zero = BufData::zeroed();
    for b in 0..size {
        disk.write(dev, b, &zero);
    }

    // Superblock.
    let mut buf = BufData::zeroed();
    {
        let data: &mut [u8; BSIZE] = &mut buf;
        data[..mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    }
    disk.write(dev, 1, &buf);

    // Root directory: "." and ".." both name the root itself.
    let mut entries = ArrayVec::<Dirent, 2>::new();
    entries.push(Dirent::new(ROOTINO as u16, name(b".")));
    entries.push(Dirent::new(ROOTINO as u16, name(b"..")));

    let root_data = nmeta;
    let mut buf = BufData::zeroed();
    {
        let data: &mut [u8; BSIZE] = &mut buf;
        for (i, de) in entries.iter().enumerate() {
            data[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE].copy_from_slice(de.as_bytes());
        }
    }
    disk.write(dev, root_data, &buf);

    let mut din = Dinode::default();
    din.set_itype(InodeType::Dir);
    din.nlink = 1;
    din.size = (entries.len() * DIRENT_SIZE) as u32;
    din.addr_direct[0] = root_data;

    let mut buf = BufData::zeroed();
    {
        let data: &mut [u8; BSIZE] = &mut buf;
        let mut dinodes = LayoutVerified::<&mut [u8], [Dinode]>::new_slice(&mut data[..])
            .expect("mkfs: dinode view");
        dinodes[ROOTINO as usize % IPB] = din;
    }
    disk.write(dev, sb.iblock(ROOTINO), &buf);

    // Free map: metadata plus the root data block are in use.
    let used = nmeta as usize + 1;
    let mut buf = BufData::zeroed();
    {
        let data: &mut [u8; BSIZE] = &mut buf;
        for b in 0..used {
            data[b / 8] |= 1 << (b % 8);
        }
    }
    disk.write(dev, sb.bmapstart, &buf);
}
