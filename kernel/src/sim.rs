//! Hosted-run harness.
//!
//! The kernel's state is process-wide by nature: one pool registry, one
//! set of control registers, one drive, one current thread. Hosted runs —
//! and the multi-threaded test runner in particular — therefore take the
//! machine exclusively: `machine()` hands out a guard that serializes
//! everything, re-zeros the physical-memory arena, and resets every
//! subsystem to power-on state.
//!
//! The arena is a 4096-aligned allocation standing in for physical
//! memory; the direct-map offset makes physical address 0 land at its
//! first byte, so frame numbers used by boot code work unchanged.

use core::alloc::Layout;

use spin::{Mutex, MutexGuard, Once};

use crate::{arch, logger, memory, process};

/// Frames in the simulated physical address space (36 MiB).
pub const ARENA_FRAMES: usize = 9216;

static MACHINE_LOCK: Mutex<()> = Mutex::new(());
static ARENA_BASE: Once<usize> = Once::new();

/// Exclusive hold on the simulated machine.
pub struct Machine {
    _exclusive: MutexGuard<'static, ()>,
}

/// Take the machine: everything is reset, physical memory reads as
/// zeros, no pools, no current thread, a blank drive.
pub fn machine() -> Machine {
    let exclusive = MACHINE_LOCK.lock();
    logger::init();

    let base = *ARENA_BASE.call_once(|| {
        let layout = Layout::from_size_align(
            ARENA_FRAMES * memory::FRAME_SIZE,
            memory::FRAME_SIZE,
        )
        .expect("arena layout");
        // SAFETY: the layout has nonzero size.
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "physical-memory arena allocation failed");
        ptr as usize
    });
    // SAFETY: the arena belongs to this harness, and the machine lock is
    // held — nobody else is touching it.
    unsafe {
        core::ptr::write_bytes(base as *mut u8, 0, ARENA_FRAMES * memory::FRAME_SIZE);
    }

    memory::set_direct_map_offset(base);
    memory::frame_pool::reset_registry();
    memory::paging::reset_paging();
    process::thread::reset_current();
    arch::sim::reset();

    Machine {
        _exclusive: exclusive,
    }
}
