//! Polled ATA disk that blocks the calling thread.
//!
//! Programmed I/O over the legacy primary channel: the block number and
//! sector count go out through ports `0x1F1..0x1F6`, the command through
//! `0x1F7`, and data moves as 256 little-endian words through `0x1F0`.
//!
//! There is no interrupt line. After issuing an operation the driver
//! checks DRQ once; if the drive is still busy the calling thread parks
//! itself on the scheduler's I/O wait queue and yields. The scheduler only
//! moves it back when a status poll shows the drive ready, so by the time
//! the thread resumes, the transfer can run.

use alloc::sync::Arc;

use crate::arch;
use crate::process::{current_thread, Scheduler};

/// Bytes per disk block (one ATA sector).
pub const BLOCK_SIZE: usize = 512;

const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 2;

const ATA_REG_NULL: u16 = 0x1F1;
const ATA_REG_SECCOUNT: u16 = 0x1F2;
const ATA_REG_LBA_LOW: u16 = 0x1F3;
const ATA_REG_LBA_MID: u16 = 0x1F4;
const ATA_REG_LBA_HIGH: u16 = 0x1F5;
const ATA_REG_DEVICE: u16 = 0x1F6;
const ATA_REG_COMMAND: u16 = 0x1F7;
const ATA_REG_STATUS: u16 = 0x1F7;
const ATA_REG_DATA: u16 = 0x1F0;

const ATA_SR_DRQ: u8 = 0x08;

const ATA_CMD_READ: u8 = 0x20;
const ATA_CMD_WRITE: u8 = 0x30;

/// Which drive on the primary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveId {
    Master,
    Slave,
}

/// Disk access errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Block number beyond the size the drive was set up with.
    OutOfRange,
}

#[derive(Clone, Copy)]
enum DiskOp {
    Read,
    Write,
}

/// A polled ATA drive whose callers block while it is busy.
pub struct BlockingDisk {
    drive: DriveId,
    nblocks: usize,
    scheduler: Arc<Scheduler>,
}

impl BlockingDisk {
    /// Set up a drive holding `nblocks` blocks. Threads that hit a busy
    /// drive are parked on `scheduler`'s I/O wait queue.
    pub fn new(drive: DriveId, nblocks: usize, scheduler: Arc<Scheduler>) -> BlockingDisk {
        log::info!("disk: {:?} drive, {} blocks", drive, nblocks);
        BlockingDisk {
            drive,
            nblocks,
            scheduler,
        }
    }

    /// Number of blocks on the drive.
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// Whether the drive reports DRQ, i.e. is ready to move data.
    pub fn is_ready(&self) -> bool {
        // SAFETY: status reads from the primary ATA channel are harmless.
        unsafe { arch::inb(ATA_REG_STATUS) & ATA_SR_DRQ != 0 }
    }

    fn issue_operation(&self, op: DiskOp, block: u32) {
        let drive_sel: u8 = match self.drive {
            DriveId::Master => 0,
            DriveId::Slave => 1,
        };
        // SAFETY: this is the documented register protocol of the primary
        // ATA channel, and the disk discipline is serial — no other
        // operation is in flight.
        unsafe {
            arch::outb(ATA_REG_NULL, 0x00);
            arch::outb(ATA_REG_SECCOUNT, 0x01);
            arch::outb(ATA_REG_LBA_LOW, block as u8);
            arch::outb(ATA_REG_LBA_MID, (block >> 8) as u8);
            arch::outb(ATA_REG_LBA_HIGH, (block >> 16) as u8);
            arch::outb(
                ATA_REG_DEVICE,
                ((block >> 24) as u8 & 0x0F) | 0xE0 | (drive_sel << 4),
            );
            arch::outb(
                ATA_REG_COMMAND,
                match op {
                    DiskOp::Read => ATA_CMD_READ,
                    DiskOp::Write => ATA_CMD_WRITE,
                },
            );
        }
    }

    /// Park the calling thread until the drive is ready. Without a
    /// current thread (boot path) there is nobody to block and the
    /// transfer loop simply runs against a ready drive.
    fn block_until_ready(&self) {
        if !self.is_ready() {
            if let Some(thread) = current_thread() {
                log::debug!("thread {} waiting for the disk", thread.id());
                self.scheduler.add_to_ioqueue(thread);
            }
        }
    }

    /// Read `block` into `buf`, blocking the calling thread while the
    /// drive is busy.
    pub fn read(&self, block: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DiskError> {
        if block >= self.nblocks {
            return Err(DiskError::OutOfRange);
        }
        self.issue_operation(DiskOp::Read, block as u32);
        self.block_until_ready();

        for i in 0..WORDS_PER_BLOCK {
            // SAFETY: the drive raised DRQ; 256 data-port reads complete
            // the transfer it announced.
            let word = unsafe { arch::inw(ATA_REG_DATA) };
            buf[2 * i] = word as u8;
            buf[2 * i + 1] = (word >> 8) as u8;
        }
        Ok(())
    }

    /// Write `buf` to `block`, blocking the calling thread while the
    /// drive is busy.
    pub fn write(&self, block: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), DiskError> {
        if block >= self.nblocks {
            return Err(DiskError::OutOfRange);
        }
        self.issue_operation(DiskOp::Write, block as u32);
        self.block_until_ready();

        for i in 0..WORDS_PER_BLOCK {
            let word = buf[2 * i] as u16 | (buf[2 * i + 1] as u16) << 8;
            // SAFETY: as in `read`, with the transfer direction reversed.
            unsafe { arch::outw(ATA_REG_DATA, word) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim;
    use crate::process::Thread;
    use crate::sim as harness;

    fn disk() -> BlockingDisk {
        BlockingDisk::new(DriveId::Master, 512, Arc::new(Scheduler::new()))
    }

    #[test]
    fn write_then_read_round_trips() {
        let _m = harness::machine();
        let disk = disk();

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xDE;
        block[1] = 0xAD;
        block[511] = 0x42;
        disk.write(7, &block).unwrap();

        let mut readback = [0u8; BLOCK_SIZE];
        disk.read(7, &mut readback).unwrap();
        assert_eq!(readback, block);
    }

    #[test]
    fn unwritten_blocks_read_as_zeros() {
        let _m = harness::machine();
        let disk = disk();
        let mut buf = [0xAAu8; BLOCK_SIZE];
        disk.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_blocks_are_rejected() {
        let _m = harness::machine();
        let disk = disk();
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read(512, &mut buf), Err(DiskError::OutOfRange));
        assert_eq!(disk.write(512, &buf), Err(DiskError::OutOfRange));
    }

    #[test]
    fn slave_select_does_not_disturb_the_block_number() {
        let _m = harness::machine();
        let scheduler = Arc::new(Scheduler::new());
        let slave = BlockingDisk::new(DriveId::Slave, 64, scheduler);
        let block = [0x5Au8; BLOCK_SIZE];
        slave.write(1, &block).unwrap();
        // Only the low nibble of the device register feeds the block
        // number; the 0xE0 | slave bits must not leak into it.
        let device = sim::ata_device().lock();
        assert_eq!(device.sector_contents(1), block);
    }

    #[test]
    fn busy_drive_parks_the_calling_thread() {
        let _m = harness::machine();
        let scheduler = Arc::new(Scheduler::new());
        let disk = BlockingDisk::new(DriveId::Master, 512, scheduler.clone());

        let caller = Thread::new();
        crate::process::thread::adopt_current(caller.clone());
        sim::ata_device().lock().set_busy_polls(1);

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(0, &mut buf).unwrap();
        // The first status poll saw a busy drive, so the caller took a
        // trip through the I/O wait queue.
        assert_eq!(scheduler.io_ids(), alloc::vec![caller.id()]);
    }
}
