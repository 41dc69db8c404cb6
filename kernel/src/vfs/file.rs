//! Open file handles.
//!
//! A file is at most one block long, and an open handle keeps that block
//! in a single in-memory copy. Reads and writes move the cursor through
//! the copy; closing the handle (dropping it) flushes the copy back to
//! the file's block.

use alloc::sync::Arc;

use spin::Mutex;

use super::file_system::{FileSystem, FsError};
use crate::hardware::storage::{BlockingDisk, BLOCK_SIZE};

/// An open file with sequential read/write access.
pub struct File {
    fs: Arc<Mutex<FileSystem>>,
    disk: Arc<BlockingDisk>,
    inode_index: usize,
    block_num: u32,
    cache: [u8; BLOCK_SIZE],
    cursor: usize,
}

impl File {
    /// Open the file named `id`, pulling its block into the cache and
    /// placing the cursor at the start.
    pub fn open(fs: &Arc<Mutex<FileSystem>>, id: u32) -> Result<File, FsError> {
        let guard = fs.lock();
        let inode_index = guard.find_inode(id).ok_or(FsError::NotFound)?;
        let block_num = guard.inode_at(inode_index).block_num;
        let disk = guard.disk().clone();
        drop(guard);

        let mut cache = [0u8; BLOCK_SIZE];
        disk.read(block_num as usize, &mut cache)?;
        log::debug!("opened file {} (block {})", id, block_num);
        Ok(File {
            fs: fs.clone(),
            disk,
            inode_index,
            block_num,
            cache,
            cursor: 0,
        })
    }

    fn file_length(&self) -> usize {
        self.fs.lock().inode_at(self.inode_index).file_length as usize
    }

    /// Copy bytes from the cursor into `buf` until `buf` is full or the
    /// end of the file is reached. Returns the number of bytes copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let length = self.file_length();
        let mut copied = 0;
        while copied < buf.len() && self.cursor < length {
            buf[copied] = self.cache[self.cursor];
            copied += 1;
            self.cursor += 1;
        }
        copied
    }

    /// Copy bytes from `buf` at the cursor until `buf` is drained or the
    /// block is full, growing the file when the cursor moves past its old
    /// end. Returns the number of bytes copied.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() && self.cursor < BLOCK_SIZE {
            self.cache[self.cursor] = buf[copied];
            copied += 1;
            self.cursor += 1;
        }
        let mut fs = self.fs.lock();
        if self.cursor > fs.inode_at(self.inode_index).file_length as usize {
            fs.set_file_length(self.inode_index, self.cursor as u32);
        }
        copied
    }

    /// Move the cursor back to the start of the file.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Whether the cursor sits at the end of the file.
    pub fn eof(&self) -> bool {
        self.cursor == self.file_length()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.disk.write(self.block_num as usize, &self.cache).is_err() {
            log::error!("file close: block {} write-back failed", self.block_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::storage::DriveId;
    use crate::process::Scheduler;
    use crate::sim;

    fn fs_with_file(id: u32) -> Arc<Mutex<FileSystem>> {
        let disk = Arc::new(BlockingDisk::new(
            DriveId::Master,
            512,
            Arc::new(Scheduler::new()),
        ));
        FileSystem::format(&disk, 512 * BLOCK_SIZE).unwrap();
        let mut fs = FileSystem::mount(disk).unwrap();
        assert!(fs.create_file(id));
        Arc::new(Mutex::new(fs))
    }

    #[test]
    fn write_reset_read_round_trips() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        let mut file = File::open(&fs, 7).unwrap();

        assert_eq!(file.write(b"hello"), 5);
        file.reset();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert!(file.eof());
    }

    #[test]
    fn reads_stop_at_the_end_of_file() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        let mut file = File::open(&fs, 7).unwrap();
        file.write(b"abc");
        file.reset();

        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn writes_stop_at_the_block_boundary() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        let mut file = File::open(&fs, 7).unwrap();

        let big = [0x11u8; BLOCK_SIZE + 100];
        assert_eq!(file.write(&big), BLOCK_SIZE);
        assert_eq!(file.write(b"more"), 0);
        assert_eq!(fs.lock().lookup_file(7).unwrap().file_length as usize, BLOCK_SIZE);
    }

    #[test]
    fn overwriting_does_not_shrink_the_file() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        let mut file = File::open(&fs, 7).unwrap();
        file.write(b"a longer run of text");
        file.reset();
        file.write(b"short");
        assert_eq!(fs.lock().lookup_file(7).unwrap().file_length, 20);
        assert!(!file.eof());
    }

    #[test]
    fn close_flushes_and_reopen_sees_the_data() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        {
            let mut file = File::open(&fs, 7).unwrap();
            file.write(b"persist me");
        }
        let mut file = File::open(&fs, 7).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read(&mut buf), 10);
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn opening_a_missing_file_fails() {
        let _m = sim::machine();
        let fs = fs_with_file(7);
        assert!(matches!(File::open(&fs, 8), Err(FsError::NotFound)));
    }
}
