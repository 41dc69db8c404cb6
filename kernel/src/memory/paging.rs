//! Two-level page tables with a recursive self-map and demand paging.
//!
//! A page directory holds 1024 entries; each present entry points at a
//! page table of 1024 entries. The last directory entry points back at the
//! directory itself, which exposes every directory and table entry at a
//! fixed virtual address once paging is on — editing the structures never
//! needs a temporary mapping. Until paging is enabled (and always in the
//! hosted model) entries are reached through the direct map instead; both
//! paths write the same memory.
//!
//! Pages are not mapped when a virtual region is reserved. The first touch
//! faults, and `page_fault` maps a fresh frame from the process pool —
//! allocating the intermediate page table as well if the directory slot is
//! empty.

use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{frame_pool, phys_to_virt, vm_pool, FramePool, FRAME_SIZE, PAGE_SIZE};
use crate::arch;

/// Entries per page directory or page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Directory slot reserved for the recursive self-map.
const RECURSIVE_SLOT: usize = 1023;

/// CR0 bit that turns on address translation.
const CR0_PAGING: usize = 1 << 31;

bitflags! {
    /// Low bits of a directory or table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// The page-fault error code pushed by the machine: bit 0 = page was
/// present (protection fault), bit 1 = write access, bit 2 = user mode.
pub struct TrapFrame {
    pub err_code: u32,
}

struct PagingConfig {
    kernel_pool: usize,
    process_pool: usize,
    shared_size: usize,
}

static CONFIG: Mutex<Option<PagingConfig>> = Mutex::new(None);

/// Physical address of the directory loaded in the paging base register
/// (zero before the first `load`).
static CURRENT_DIRECTORY: AtomicUsize = AtomicUsize::new(0);

static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Virtual ranges registered by VM pools, consulted by the fault handler.
#[derive(Clone, Copy)]
struct VmRange {
    base: usize,
    size: usize,
}

static VM_POOLS: Mutex<Vec<VmRange>> = Mutex::new(Vec::new());

/// Record the frame pools paging will draw from. `shared_size` is the
/// direct-mapped region every address space shares.
pub fn init_paging(kernel_pool: &FramePool, process_pool: &FramePool, shared_size: usize) {
    let config = PagingConfig {
        kernel_pool: kernel_pool.base_frame(),
        process_pool: process_pool.base_frame(),
        shared_size,
    };
    log::info!(
        "paging: kernel pool @ frame {}, process pool @ frame {}, {} MiB shared",
        config.kernel_pool,
        config.process_pool,
        config.shared_size >> 20
    );
    *CONFIG.lock() = Some(config);
}

fn process_pool() -> Option<usize> {
    CONFIG.lock().as_ref().map(|c| c.process_pool)
}

/// Directory index of a virtual address.
#[inline]
fn pde_index(vaddr: usize) -> usize {
    (vaddr >> 22) & 0x3FF
}

/// Table index of a virtual address.
#[inline]
fn pte_index(vaddr: usize) -> usize {
    (vaddr >> 12) & 0x3FF
}

/// Virtual address of the directory entry for `vaddr`, via the recursive
/// self-map. Valid only while paging is on.
pub fn pde_vaddr(vaddr: usize) -> usize {
    (RECURSIVE_SLOT << 22) | (RECURSIVE_SLOT << 12) | (pde_index(vaddr) << 2)
}

/// Virtual address of the table entry for `vaddr`, via the recursive
/// self-map. Valid only while paging is on.
pub fn pte_vaddr(vaddr: usize) -> usize {
    (RECURSIVE_SLOT << 22) | (pde_index(vaddr) << 12) | (pte_index(vaddr) << 2)
}

/// A per-address-space two-level page table, identified by the physical
/// address of its directory frame.
#[derive(Clone, Copy)]
pub struct PageTable {
    directory: usize,
}

impl PageTable {
    /// Build an address space: one directory frame and one initial table
    /// frame from the process pool, the first 4 MiB direct-mapped, the
    /// recursive self-map installed, and every other directory slot marked
    /// not-present (writable, so a later fault fills it in).
    pub fn new() -> Option<PageTable> {
        let pool = process_pool()?;
        let directory = frame_pool::alloc_from(pool, 1)? * FRAME_SIZE;
        let table = frame_pool::alloc_from(pool, 1)? * FRAME_SIZE;

        // SAFETY: both frames were just allocated and are exclusively ours.
        unsafe {
            let table_ptr = phys_to_virt(table) as *mut u32;
            for i in 0..TABLE_ENTRIES {
                let entry = (i * PAGE_SIZE) as u32 | EntryFlags::PRESENT.bits()
                    | EntryFlags::WRITABLE.bits();
                table_ptr.add(i).write(entry);
            }

            let dir_ptr = phys_to_virt(directory) as *mut u32;
            dir_ptr.write(table as u32 | EntryFlags::PRESENT.bits() | EntryFlags::WRITABLE.bits());
            for i in 1..RECURSIVE_SLOT {
                dir_ptr.add(i).write(EntryFlags::WRITABLE.bits());
            }
            dir_ptr
                .add(RECURSIVE_SLOT)
                .write(directory as u32 | EntryFlags::PRESENT.bits() | EntryFlags::WRITABLE.bits());
        }

        log::info!("page table: directory @ {:#x}", directory);
        Some(PageTable { directory })
    }

    /// Physical address of the directory frame.
    pub fn directory_addr(&self) -> usize {
        self.directory
    }

    /// Load this table into the paging base register, making it current.
    pub fn load(&self) {
        arch::write_cr3(self.directory);
        CURRENT_DIRECTORY.store(self.directory, Ordering::Relaxed);
    }

    /// Turn on address translation (bit 31 of the paging control
    /// register). Process-wide; a table must have been loaded first.
    pub fn enable_paging() {
        arch::write_cr0(arch::read_cr0() | CR0_PAGING);
        PAGING_ENABLED.store(true, Ordering::Relaxed);
    }

    /// Whether translation has been turned on.
    pub fn paging_enabled() -> bool {
        PAGING_ENABLED.load(Ordering::Relaxed)
    }

    /// The table currently loaded, if any.
    pub fn current() -> Option<PageTable> {
        match CURRENT_DIRECTORY.load(Ordering::Relaxed) {
            0 => None,
            directory => Some(PageTable { directory }),
        }
    }

    fn is_current(&self) -> bool {
        CURRENT_DIRECTORY.load(Ordering::Relaxed) == self.directory
    }

    /// Pointer to the directory entry covering `vaddr`: through the
    /// recursive map when this table is live, through the direct map
    /// otherwise.
    fn pde_ptr(&self, vaddr: usize) -> *mut u32 {
        if Self::paging_enabled() && self.is_current() {
            pde_vaddr(vaddr) as *mut u32
        } else {
            phys_to_virt(self.directory + pde_index(vaddr) * 4) as *mut u32
        }
    }

    /// Pointer to the table entry covering `vaddr`, or `None` while the
    /// directory slot is not present.
    fn pte_ptr(&self, vaddr: usize) -> Option<*mut u32> {
        // SAFETY: the directory frame is owned by this table.
        let pde = unsafe { self.pde_ptr(vaddr).read() };
        if !EntryFlags::from_bits_truncate(pde).contains(EntryFlags::PRESENT) {
            return None;
        }
        let ptr = if Self::paging_enabled() && self.is_current() {
            pte_vaddr(vaddr) as *mut u32
        } else {
            let table = (pde & !0xFFF) as usize;
            phys_to_virt(table + pte_index(vaddr) * 4) as *mut u32
        };
        Some(ptr)
    }

    /// Physical address `vaddr` maps to, or `None` if unmapped.
    pub fn translate(&self, vaddr: usize) -> Option<usize> {
        let pte_ptr = self.pte_ptr(vaddr)?;
        // SAFETY: pte_ptr points into a live page table.
        let pte = unsafe { pte_ptr.read() };
        if !EntryFlags::from_bits_truncate(pte).contains(EntryFlags::PRESENT) {
            return None;
        }
        Some((pte & !0xFFF) as usize | (vaddr & 0xFFF))
    }

    /// Service a page fault against the current table.
    ///
    /// The faulting address comes from the fault-address register. An
    /// address no registered VM pool covers is ignored — nothing is
    /// mapped, the access stays illegal. A protection fault (the page was
    /// present) is not handled here either. For a not-present fault the
    /// handler installs a page table if the directory slot is empty, then
    /// maps a fresh frame from the process pool, user-accessible when the
    /// fault came from user mode.
    pub fn page_fault(trap: &TrapFrame) {
        let fault_addr = arch::read_cr2();
        let flags = EntryFlags::from_bits_truncate(trap.err_code);

        if !address_is_legitimate(fault_addr) {
            log::debug!("page fault at {:#x}: outside every vm pool", fault_addr);
            return;
        }
        if flags.contains(EntryFlags::PRESENT) {
            log::warn!("protection fault at {:#x}: not handled", fault_addr);
            return;
        }
        let table = match Self::current() {
            Some(table) => table,
            None => return,
        };
        let pool = match process_pool() {
            Some(pool) => pool,
            None => return,
        };

        // SAFETY: entry pointers come from this table's own frames; new
        // frames come from the process pool and are exclusively ours.
        unsafe {
            let pde_ptr = table.pde_ptr(fault_addr);
            let pde = EntryFlags::from_bits_truncate(pde_ptr.read());
            if !pde.contains(EntryFlags::PRESENT) {
                let table_frame = match frame_pool::alloc_from(pool, 1) {
                    Some(frame) => frame,
                    None => {
                        log::error!("page fault at {:#x}: process pool exhausted", fault_addr);
                        return;
                    }
                };
                pde_ptr.write(
                    (table_frame * FRAME_SIZE) as u32
                        | (EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER).bits(),
                );
                // A recycled frame carries stale entries; scrub them before
                // the table is consulted. The first page of the 4 MiB
                // region locates entry 0 of the new table.
                let table_base = table
                    .pte_ptr(fault_addr & !0x3F_FFFF)
                    .expect("directory slot just installed");
                core::ptr::write_bytes(table_base, 0, TABLE_ENTRIES);
            }

            let data_frame = match frame_pool::alloc_from(pool, 1) {
                Some(frame) => frame,
                None => {
                    log::error!("page fault at {:#x}: process pool exhausted", fault_addr);
                    return;
                }
            };
            let mut entry_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
            if flags.contains(EntryFlags::USER) {
                entry_flags |= EntryFlags::USER;
            }
            let pte_ptr = table.pte_ptr(fault_addr).expect("directory slot present");
            pte_ptr.write((data_frame * FRAME_SIZE) as u32 | entry_flags.bits());
        }
        log::debug!("page fault at {:#x}: mapped", fault_addr);
    }

    /// Unmap virtual page `page_no` and give its frame back to the process
    /// pool. Reloads the paging base register to drop the stale TLB entry.
    pub fn free_page(&self, page_no: usize) {
        let vaddr = page_no * PAGE_SIZE;
        let pte_ptr = match self.pte_ptr(vaddr) {
            Some(ptr) => ptr,
            None => return,
        };
        // SAFETY: pte_ptr points into this table's frames.
        unsafe {
            let pte = pte_ptr.read();
            if !EntryFlags::from_bits_truncate(pte).contains(EntryFlags::PRESENT) {
                return;
            }
            frame_pool::release_frames((pte & !0xFFF) as usize / FRAME_SIZE);
            pte_ptr.write(pte & !EntryFlags::PRESENT.bits());
        }
        self.load();
    }
}

/// Register a VM pool's range so the fault handler can vet addresses.
pub(crate) fn register_pool(base: usize, size: usize) {
    VM_POOLS.lock().push(VmRange { base, size });
    log::debug!("vm pool registered: [{:#x}, {:#x})", base, base + size);
}

fn address_is_legitimate(addr: usize) -> bool {
    let ranges: Vec<VmRange> = VM_POOLS.lock().clone();
    ranges
        .iter()
        .any(|r| vm_pool::covers(r.base, r.size, addr))
}

/// Resolve `vaddr` to a dereferenceable pointer, faulting the page in on
/// first touch the way the hardware would.
#[cfg(not(target_arch = "x86"))]
pub(crate) fn vm_ptr(vaddr: usize, write: bool, user: bool) -> Option<*mut u8> {
    let table = PageTable::current()?;
    if let Some(phys) = table.translate(vaddr) {
        return Some(phys_to_virt(phys) as *mut u8);
    }
    arch::sim::set_cr2(vaddr);
    let mut err_code = 0;
    if write {
        err_code |= EntryFlags::WRITABLE.bits();
    }
    if user {
        err_code |= EntryFlags::USER.bits();
    }
    PageTable::page_fault(&TrapFrame { err_code });
    table
        .translate(vaddr)
        .map(|phys| phys_to_virt(phys) as *mut u8)
}

/// On bare metal plain accesses fault and get serviced by the hardware
/// path; the pointer is the virtual address itself.
#[cfg(target_arch = "x86")]
pub(crate) fn vm_ptr(vaddr: usize, _write: bool, _user: bool) -> Option<*mut u8> {
    Some(vaddr as *mut u8)
}

/// Forget pools, configuration and the loaded table. Hosted-harness
/// teardown only.
#[cfg(not(target_arch = "x86"))]
pub(crate) fn reset_paging() {
    *CONFIG.lock() = None;
    CURRENT_DIRECTORY.store(0, Ordering::Relaxed);
    PAGING_ENABLED.store(false, Ordering::Relaxed);
    VM_POOLS.lock().clear();
}
