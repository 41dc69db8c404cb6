//! Hosted machine model.
//!
//! Stands in for the real machine when the kernel is built for anything
//! other than bare-metal x86. Control registers are plain atomics, the
//! port bus routes the ATA register block (`0x1F0..=0x1F7`) to an in-memory
//! drive model, console output lands in a buffer, and the CPU hand-off is
//! recorded in a dispatch log instead of switching stacks. The `sim`
//! module at the crate root builds its reset/inspection harness on top of
//! this.

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

const SECTOR_SIZE: usize = 512;
const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 2;

const ATA_IO_BASE: u16 = 0x1F0;
const ATA_REG_STATUS: u16 = 0x1F7;

const ATA_SR_DRDY: u8 = 0x40;
const ATA_SR_DRQ: u8 = 0x08;

const ATA_CMD_READ: u8 = 0x20;
const ATA_CMD_WRITE: u8 = 0x30;

static CR0: AtomicUsize = AtomicUsize::new(0);
static CR2: AtomicUsize = AtomicUsize::new(0);
static CR3: AtomicUsize = AtomicUsize::new(0);

static CONSOLE: Mutex<String> = Mutex::new(String::new());
static DISPATCH_LOG: Mutex<Vec<u64>> = Mutex::new(Vec::new());

/// Direction of an in-flight ATA data transfer.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Idle,
    Read,
    Write,
}

/// In-memory model of a polled ATA drive.
///
/// Tracks the register file the kernel programs through ports
/// `0x1F1..0x1F6`, raises DRQ while a 256-word transfer is in flight, and
/// keeps sector contents in a sparse map (absent sectors read as zeros).
pub struct AtaDevice {
    sector_count: u8,
    lba: [u8; 3],
    drive_head: u8,
    transfer: Transfer,
    buf: [u16; WORDS_PER_SECTOR],
    pos: usize,
    busy_polls: u32,
    sectors: BTreeMap<u32, [u8; SECTOR_SIZE]>,
}

impl AtaDevice {
    const fn new() -> Self {
        AtaDevice {
            sector_count: 0,
            lba: [0; 3],
            drive_head: 0,
            transfer: Transfer::Idle,
            buf: [0; WORDS_PER_SECTOR],
            pos: 0,
            busy_polls: 0,
            sectors: BTreeMap::new(),
        }
    }

    fn selected_sector(&self) -> u32 {
        (self.lba[0] as u32)
            | (self.lba[1] as u32) << 8
            | (self.lba[2] as u32) << 16
            | ((self.drive_head & 0x0F) as u32) << 24
    }

    fn command(&mut self, cmd: u8) {
        log::trace!(
            "ata: command {:#x}, {} sector(s) at {}",
            cmd,
            self.sector_count,
            self.selected_sector()
        );
        match cmd {
            ATA_CMD_READ => {
                let sector = self.sector_contents(self.selected_sector());
                for (i, word) in self.buf.iter_mut().enumerate() {
                    *word = sector[2 * i] as u16 | (sector[2 * i + 1] as u16) << 8;
                }
                self.pos = 0;
                self.transfer = Transfer::Read;
            }
            ATA_CMD_WRITE => {
                self.buf = [0; WORDS_PER_SECTOR];
                self.pos = 0;
                self.transfer = Transfer::Write;
            }
            _ => {}
        }
    }

    fn status(&mut self) -> u8 {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return ATA_SR_DRDY;
        }
        match self.transfer {
            Transfer::Idle => ATA_SR_DRDY,
            _ => ATA_SR_DRDY | ATA_SR_DRQ,
        }
    }

    fn read_data(&mut self) -> u16 {
        if self.transfer != Transfer::Read {
            return 0;
        }
        let word = self.buf[self.pos];
        self.pos += 1;
        if self.pos == WORDS_PER_SECTOR {
            self.transfer = Transfer::Idle;
        }
        word
    }

    fn write_data(&mut self, word: u16) {
        if self.transfer != Transfer::Write {
            return;
        }
        self.buf[self.pos] = word;
        self.pos += 1;
        if self.pos == WORDS_PER_SECTOR {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, word) in self.buf.iter().enumerate() {
                sector[2 * i] = *word as u8;
                sector[2 * i + 1] = (*word >> 8) as u8;
            }
            self.sectors.insert(self.selected_sector(), sector);
            self.transfer = Transfer::Idle;
        }
    }

    /// Contents of a sector as the drive would return them.
    pub fn sector_contents(&self, sector: u32) -> [u8; SECTOR_SIZE] {
        self.sectors.get(&sector).copied().unwrap_or([0; SECTOR_SIZE])
    }

    /// Preload a sector, as if written by an earlier run.
    pub fn load_sector(&mut self, sector: u32, contents: [u8; SECTOR_SIZE]) {
        self.sectors.insert(sector, contents);
    }

    /// Hold DRQ low for the next `polls` status reads, so code under test
    /// sees a drive that is not yet ready.
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }
}

static ATA: Mutex<AtaDevice> = Mutex::new(AtaDevice::new());

/// The model behind ports `0x1F0..=0x1F7`.
pub fn ata_device() -> &'static Mutex<AtaDevice> {
    &ATA
}

/// Read a byte from the simulated port bus.
///
/// # Safety
/// Matches the bare-metal signature; the hosted bus is always safe.
pub unsafe fn inb(port: u16) -> u8 {
    match port {
        ATA_REG_STATUS => ATA.lock().status(),
        _ => 0,
    }
}

/// Read a word from the simulated port bus.
///
/// # Safety
/// Matches the bare-metal signature; the hosted bus is always safe.
pub unsafe fn inw(port: u16) -> u16 {
    match port {
        ATA_IO_BASE => ATA.lock().read_data(),
        _ => 0,
    }
}

/// Write a byte to the simulated port bus.
///
/// # Safety
/// Matches the bare-metal signature; the hosted bus is always safe.
pub unsafe fn outb(port: u16, value: u8) {
    let mut ata = ATA.lock();
    match port {
        0x1F1 => {}
        0x1F2 => ata.sector_count = value,
        0x1F3 => ata.lba[0] = value,
        0x1F4 => ata.lba[1] = value,
        0x1F5 => ata.lba[2] = value,
        0x1F6 => ata.drive_head = value,
        ATA_REG_STATUS => ata.command(value),
        _ => {}
    }
}

/// Write a word to the simulated port bus.
///
/// # Safety
/// Matches the bare-metal signature; the hosted bus is always safe.
pub unsafe fn outw(port: u16, value: u16) {
    if port == ATA_IO_BASE {
        ATA.lock().write_data(value);
    }
}

/// Read the simulated CR0.
pub fn read_cr0() -> usize {
    CR0.load(Ordering::Relaxed)
}

/// Write the simulated CR0.
pub fn write_cr0(value: usize) {
    CR0.store(value, Ordering::Relaxed);
}

/// Read the simulated page-fault address register.
pub fn read_cr2() -> usize {
    CR2.load(Ordering::Relaxed)
}

/// Load the fault address, as the MMU would before raising a page fault.
pub fn set_cr2(value: usize) {
    CR2.store(value, Ordering::Relaxed);
}

/// Read the simulated paging base register.
pub fn read_cr3() -> usize {
    CR3.load(Ordering::Relaxed)
}

/// Write the simulated paging base register.
pub fn write_cr3(value: usize) {
    CR3.store(value, Ordering::Relaxed);
}

/// Append console output to the capture buffer.
pub fn console_write(s: &str) {
    CONSOLE.lock().push_str(s);
}

/// Drain and return everything written to the console so far.
pub fn console_take() -> String {
    core::mem::take(&mut *CONSOLE.lock())
}

/// Record a CPU hand-off instead of switching stacks.
pub fn switch_to(_next: *const core::ffi::c_void, id: u64) {
    DISPATCH_LOG.lock().push(id);
}

/// Thread ids handed the CPU since the last reset, oldest first.
pub fn dispatch_log() -> Vec<u64> {
    DISPATCH_LOG.lock().clone()
}

/// Restore the machine model to power-on state.
pub fn reset() {
    CR0.store(0, Ordering::Relaxed);
    CR2.store(0, Ordering::Relaxed);
    CR3.store(0, Ordering::Relaxed);
    *ATA.lock() = AtaDevice::new();
    CONSOLE.lock().clear();
    DISPATCH_LOG.lock().clear();
}
