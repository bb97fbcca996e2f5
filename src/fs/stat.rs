//! File status, as copied out to callers.

/// Directory.
pub const T_DIR: i16 = 1;
/// Regular file.
pub const T_FILE: i16 = 2;
/// Device node.
pub const T_DEVICE: i16 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    /// File system's disk device.
    pub dev: u32,

    /// Inode number.
    pub ino: u32,

    /// Type of file.
    pub typ: i16,

    /// Number of links to file.
    pub nlink: i16,

    /// Size of file in bytes.
    pub size: usize,
}
