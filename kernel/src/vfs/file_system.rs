//! File-system mount state and metadata operations.

use alloc::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use super::inode::{Inode, MAX_INODES};
use crate::hardware::storage::{BlockingDisk, DiskError, BLOCK_SIZE};

const INODE_TABLE_BLOCK: usize = 0;
const BITMAP_BLOCK: usize = 1;

/// Blocks tracked by the bitmap (one ASCII cell per block).
const TRACKED_BLOCKS: usize = BLOCK_SIZE;

const BLOCK_FREE: u8 = b'0';
const BLOCK_USED: u8 = b'1';

/// File-system errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The underlying disk rejected an access.
    Disk(DiskError),
    /// No live file carries the requested id.
    NotFound,
}

impl From<DiskError> for FsError {
    fn from(err: DiskError) -> FsError {
        FsError::Disk(err)
    }
}

/// A mounted file system.
///
/// Mounting pulls the inode table and the free-block bitmap into memory;
/// every metadata operation works on the in-memory copies, and dropping
/// the file system (unmounting) writes both blocks back.
pub struct FileSystem {
    disk: Arc<BlockingDisk>,
    inodes: [Inode; MAX_INODES],
    free_blocks: [u8; TRACKED_BLOCKS],
}

impl FileSystem {
    /// Write an empty file system to `disk`: a table of invalid inodes
    /// and a bitmap with only the two metadata blocks in use.
    pub fn format(disk: &BlockingDisk, _size: usize) -> Result<(), FsError> {
        log::info!("formatting disk");
        let inodes = [Inode::INVALID; MAX_INODES];
        let mut table = [0u8; BLOCK_SIZE];
        table.copy_from_slice(inodes.as_bytes());
        disk.write(INODE_TABLE_BLOCK, &table)?;

        let mut bitmap = [BLOCK_FREE; TRACKED_BLOCKS];
        bitmap[INODE_TABLE_BLOCK] = BLOCK_USED;
        bitmap[BITMAP_BLOCK] = BLOCK_USED;
        disk.write(BITMAP_BLOCK, &bitmap)?;
        Ok(())
    }

    /// Mount the file system on `disk`, reading the metadata blocks.
    pub fn mount(disk: Arc<BlockingDisk>) -> Result<FileSystem, FsError> {
        log::info!("mounting file system");
        let mut table = [0u8; BLOCK_SIZE];
        disk.read(INODE_TABLE_BLOCK, &mut table)?;
        let inodes =
            <[Inode; MAX_INODES]>::read_from(&table[..]).expect("inode table fills block 0");

        let mut free_blocks = [0u8; TRACKED_BLOCKS];
        disk.read(BITMAP_BLOCK, &mut free_blocks)?;

        Ok(FileSystem {
            disk,
            inodes,
            free_blocks,
        })
    }

    /// The disk this file system lives on.
    pub fn disk(&self) -> &Arc<BlockingDisk> {
        &self.disk
    }

    pub(crate) fn find_inode(&self, id: u32) -> Option<usize> {
        self.inodes
            .iter()
            .position(|inode| inode.is_valid() && inode.id == id)
    }

    pub(crate) fn inode_at(&self, index: usize) -> &Inode {
        &self.inodes[index]
    }

    pub(crate) fn set_file_length(&mut self, index: usize, length: u32) {
        self.inodes[index].file_length = length;
    }

    /// The live inode with the given id.
    pub fn lookup_file(&self, id: u32) -> Option<&Inode> {
        self.find_inode(id).map(|index| &self.inodes[index])
    }

    /// Create an empty file named `id`. False when the id is taken, the
    /// inode table is full, or no data block is free; a file either comes
    /// into existence whole or not at all.
    pub fn create_file(&mut self, id: u32) -> bool {
        if self.find_inode(id).is_some() {
            log::debug!("create_file({}): id already in use", id);
            return false;
        }
        let slot = match self.inodes.iter().position(|inode| !inode.is_valid()) {
            Some(slot) => slot,
            None => {
                log::debug!("create_file({}): inode table full", id);
                return false;
            }
        };
        let block = match self
            .free_blocks
            .iter()
            .position(|state| *state == BLOCK_FREE)
        {
            Some(block) => block,
            None => {
                log::debug!("create_file({}): no free block", id);
                return false;
            }
        };
        self.free_blocks[block] = BLOCK_USED;
        self.inodes[slot] = Inode::for_file(id, block as u32);
        log::debug!("create_file({}): block {}", id, block);
        true
    }

    /// Delete the file named `id`, returning its block to the free pool.
    /// False when no such file exists.
    pub fn delete_file(&mut self, id: u32) -> bool {
        let index = match self.find_inode(id) {
            Some(index) => index,
            None => return false,
        };
        let block = self.inodes[index].block_num as usize;
        self.free_blocks[block] = BLOCK_FREE;
        self.inodes[index].invalidate();
        log::debug!("delete_file({}): block {} freed", id, block);
        true
    }

    /// Count of data blocks currently free.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks
            .iter()
            .filter(|state| **state == BLOCK_FREE)
            .count()
    }

    fn flush_metadata(&self) -> Result<(), FsError> {
        let mut table = [0u8; BLOCK_SIZE];
        table.copy_from_slice(self.inodes.as_bytes());
        self.disk.write(INODE_TABLE_BLOCK, &table)?;
        self.disk.write(BITMAP_BLOCK, &self.free_blocks)?;
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        log::info!("unmounting file system");
        if self.flush_metadata().is_err() {
            log::error!("unmount: metadata write-back failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::storage::DriveId;
    use crate::process::Scheduler;
    use crate::sim;

    fn fresh_fs() -> FileSystem {
        let disk = Arc::new(BlockingDisk::new(
            DriveId::Master,
            512,
            Arc::new(Scheduler::new()),
        ));
        FileSystem::format(&disk, 512 * BLOCK_SIZE).unwrap();
        FileSystem::mount(disk).unwrap()
    }

    #[test]
    fn a_fresh_file_system_has_all_data_blocks_free() {
        let _m = sim::machine();
        let fs = fresh_fs();
        assert_eq!(fs.free_block_count(), 512 - 2);
        assert!(fs.lookup_file(1).is_none());
    }

    #[test]
    fn create_consumes_the_first_data_block() {
        let _m = sim::machine();
        let mut fs = fresh_fs();
        assert!(fs.create_file(7));
        let inode = fs.lookup_file(7).expect("created");
        assert_eq!(inode.block_num, 2);
        assert_eq!(inode.file_length, 0);
        assert_eq!(fs.free_block_count(), 512 - 3);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let _m = sim::machine();
        let mut fs = fresh_fs();
        assert!(fs.create_file(7));
        assert!(!fs.create_file(7));
        assert_eq!(fs.free_block_count(), 512 - 3);
    }

    #[test]
    fn delete_frees_the_block_and_the_inode() {
        let _m = sim::machine();
        let mut fs = fresh_fs();
        assert!(fs.create_file(7));
        assert!(fs.delete_file(7));
        assert!(fs.lookup_file(7).is_none());
        assert_eq!(fs.free_block_count(), 512 - 2);
        assert!(!fs.delete_file(7));
        // The freed block is handed out again.
        assert!(fs.create_file(9));
        assert_eq!(fs.lookup_file(9).unwrap().block_num, 2);
    }

    #[test]
    fn inode_table_exhaustion_fails_cleanly() {
        let _m = sim::machine();
        let mut fs = fresh_fs();
        for id in 0..MAX_INODES as u32 {
            assert!(fs.create_file(id));
        }
        let free_before = fs.free_block_count();
        assert!(!fs.create_file(1000));
        assert_eq!(fs.free_block_count(), free_before);
    }

    #[test]
    fn metadata_survives_unmount_and_remount() {
        let _m = sim::machine();
        let disk = Arc::new(BlockingDisk::new(
            DriveId::Master,
            512,
            Arc::new(Scheduler::new()),
        ));
        FileSystem::format(&disk, 512 * BLOCK_SIZE).unwrap();

        let mut fs = FileSystem::mount(disk.clone()).unwrap();
        assert!(fs.create_file(42));
        fs.set_file_length(fs.find_inode(42).unwrap(), 17);
        drop(fs);

        let fs = FileSystem::mount(disk).unwrap();
        let inode = fs.lookup_file(42).expect("persisted");
        assert_eq!(inode.block_num, 2);
        assert_eq!(inode.file_length, 17);
        assert_eq!(fs.free_block_count(), 512 - 3);
    }
}
