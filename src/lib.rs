//! rv6-fs: a virtual file system core with an xv6-style disk backend.
//!
//! The crate is split the same way the kernel it was carved out of is:
//!
//! * `fs`: the generic layer with inode table, dentry table, path resolution,
//!   and the [`fs::Filesystem`] operations trait every backend implements.
//! * `xv6fs`: the concrete backend with superblock, bitmap block allocator,
//!   packed on-disk inodes, and flat directories.
//! * `file`: per-open-handle file objects and the device switch table.
//! * `pipe`: anonymous pipes surfaced through file objects.
//! * `bio`: the block buffer cache over a [`bio::DiskDevice`].
//! * `sysfile` (methods on [`fs::Vfs`]): the system-call surface.
//!
//! The host kernel supplies the collaborators: a block device, a process
//! context ([`proc::Proc`]) holding the working directory and the open-file
//! table, and already-marshalled system-call arguments.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

#[macro_use]
mod utils;

pub mod arena;
pub mod bio;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod lock;
pub mod param;
pub mod pipe;
pub mod proc;
mod sysfile;
pub mod xv6fs;

#[cfg(test)]
mod tests;

pub use crate::fcntl::FcntlFlags;
pub use crate::fs::{Filesystem, Path, Stat, Vfs};
pub use crate::proc::Proc;
