//! Memory management: contiguous frame pools, two-level page tables,
//! virtual-memory pools.

pub mod frame_pool;
pub mod paging;
pub mod vm_pool;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Size of a physical frame and of a virtual page.
pub const FRAME_SIZE: usize = 4096;
/// Alias kept for code that talks about virtual memory.
pub const PAGE_SIZE: usize = FRAME_SIZE;

/// Direct-map offset added to every physical address before it is
/// dereferenced. Zero on bare metal, where low memory is identity-mapped;
/// the hosted harness points it at its physical-memory arena.
static DIRECT_MAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Set the direct-map offset (call once, before any frame is touched).
pub fn set_direct_map_offset(offset: usize) {
    DIRECT_MAP_OFFSET.store(offset, Ordering::Relaxed);
}

/// Convert a physical address to a dereferenceable virtual address.
#[inline]
pub fn phys_to_virt(phys: usize) -> usize {
    phys.wrapping_add(DIRECT_MAP_OFFSET.load(Ordering::Relaxed))
}

pub use frame_pool::{release_frames, FramePool};
pub use paging::{PageTable, TrapFrame};
pub use vm_pool::VmPool;
