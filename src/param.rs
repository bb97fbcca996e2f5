//! Build-time capacities and device constants.

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Dentry descriptors available to lookups and directory mutations.
pub const NDENTRY: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Pipes available to the system.
pub const NPIPE: usize = 16;

/// Block size.
pub const BSIZE: usize = 1024;

/// Max # of blocks any FS op writes.
/// Caps the buffer-cache working set of a single write chunk.
pub const MAXOPBLOCKS: usize = 10;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;
