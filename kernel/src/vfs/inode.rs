//! On-disk inode records.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::hardware::storage::BLOCK_SIZE;

/// Inodes that fit in block 0.
pub const MAX_INODES: usize = BLOCK_SIZE / core::mem::size_of::<Inode>();

/// One file's metadata, packed for block 0.
///
/// `valid` is nonzero for a live file. A file owns exactly one data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Inode {
    pub id: u32,
    pub block_num: u32,
    pub file_length: u32,
    valid: u32,
}

impl Inode {
    /// An unused table slot.
    pub const INVALID: Inode = Inode {
        id: 0,
        block_num: 0,
        file_length: 0,
        valid: 0,
    };

    /// A fresh, empty file occupying `block_num`.
    pub(crate) fn for_file(id: u32, block_num: u32) -> Inode {
        Inode {
            id,
            block_num,
            file_length: 0,
            valid: 1,
        }
    }

    /// Whether this slot holds a live file.
    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = 0;
    }
}
