//! Single-level block file system.
//!
//! Fixed on-disk layout over 512-byte blocks: block 0 holds the packed
//! inode table, block 1 the free-block bitmap (one ASCII `'0'`/`'1'` per
//! block), blocks 2 onward hold file data, one block per file.

pub mod file;
pub mod file_system;
pub mod inode;

pub use file::File;
pub use file_system::{FileSystem, FsError};
pub use inode::{Inode, MAX_INODES};
