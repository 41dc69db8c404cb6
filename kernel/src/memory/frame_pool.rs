//! Contiguous physical-frame pools.
//!
//! A pool manages a contiguous range of 4 KiB frames and hands out
//! variable-length contiguous runs. Per-frame state is kept in 2-bit cells
//! in an out-of-band info region: FREE, USED, or head-of-sequence (the
//! first frame of a live run). Exactly one head cell exists per run, so a
//! run can be released given nothing but its first frame number.
//!
//! All live pools are tracked in a process-wide registry keyed by frame
//! range. `release_frames` is a free function: at release time only the
//! frame number is known, and the registry finds the owning pool. The
//! registry also owns each pool's free-frame counter, so a released run is
//! credited to the right pool no matter who triggers the release.

use alloc::vec::Vec;

use spin::Mutex;

use super::{phys_to_virt, FRAME_SIZE};

/// Frames described by one info-region byte (2 bits per frame).
const FRAMES_PER_INFO_BYTE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    Used,
    HeadOfSequence,
}

impl FrameState {
    fn from_bits(bits: u8) -> FrameState {
        match bits & 0x3 {
            0x0 => FrameState::Free,
            0x1 => FrameState::Used,
            _ => FrameState::HeadOfSequence,
        }
    }

    fn bits(self) -> u8 {
        match self {
            FrameState::Free => 0x0,
            FrameState::Used => 0x1,
            FrameState::HeadOfSequence => 0x2,
        }
    }
}

/// Registry record for one live pool.
struct PoolEntry {
    base_frame: usize,
    nframes: usize,
    /// Physical address of the info region.
    info_addr: usize,
    free_frames: usize,
}

impl PoolEntry {
    fn contains(&self, frame: usize) -> bool {
        frame >= self.base_frame && frame < self.base_frame + self.nframes
    }

    /// State cell for `frame`, which must lie inside the pool.
    fn state(&self, frame: usize) -> FrameState {
        let cell = frame - self.base_frame;
        let byte_addr = self.info_addr + cell / FRAMES_PER_INFO_BYTE;
        let shift = (cell % FRAMES_PER_INFO_BYTE) * 2;
        // SAFETY: the info region was sized for `nframes` cells at
        // construction and `frame` is in range.
        let byte = unsafe { *(phys_to_virt(byte_addr) as *const u8) };
        FrameState::from_bits(byte >> shift)
    }

    fn set_state(&self, frame: usize, state: FrameState) {
        let cell = frame - self.base_frame;
        let byte_addr = self.info_addr + cell / FRAMES_PER_INFO_BYTE;
        let shift = (cell % FRAMES_PER_INFO_BYTE) * 2;
        // SAFETY: as in `state`; the registry lock serializes writers.
        unsafe {
            let ptr = phys_to_virt(byte_addr) as *mut u8;
            *ptr = (*ptr & !(0x3 << shift)) | (state.bits() << shift);
        }
    }
}

/// Process-wide pool registry. Mutated at pool construction and teardown,
/// consulted on every allocation and release.
static POOLS: Mutex<Vec<PoolEntry>> = Mutex::new(Vec::new());

/// A contiguous frame pool over `[base_frame, base_frame + nframes)`.
pub struct FramePool {
    base_frame: usize,
    nframes: usize,
}

impl FramePool {
    /// Set up a pool over `nframes` frames starting at `base_frame`.
    ///
    /// With `info_frame = None` the info region occupies the first frames
    /// of the managed range itself: the first is marked head-of-sequence,
    /// the rest of the info run USED, and the free counter is debited, so
    /// the info region is an ordinary releasable run. With
    /// `Some(frame)` the info region lives in a caller-provided frame
    /// (typically allocated from another pool, which already accounts for
    /// it) and every managed frame starts FREE.
    pub fn new(base_frame: usize, nframes: usize, info_frame: Option<usize>) -> FramePool {
        let info_addr = info_frame.unwrap_or(base_frame) * FRAME_SIZE;
        let entry = PoolEntry {
            base_frame,
            nframes,
            info_addr,
            free_frames: nframes,
        };

        let info_bytes = (nframes + FRAMES_PER_INFO_BYTE - 1) / FRAMES_PER_INFO_BYTE;
        // SAFETY: the caller hands this range of physical memory (and the
        // info frame, if external) to the pool exclusively.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(info_addr) as *mut u8, 0, info_bytes);
        }

        let mut pools = POOLS.lock();
        pools.push(entry);
        let entry = pools.last_mut().expect("entry just pushed");

        let info_frames = Self::needed_info_frames(nframes);
        if info_frame.is_none() && info_frames > 0 {
            entry.set_state(base_frame, FrameState::HeadOfSequence);
            for frame in base_frame + 1..base_frame + info_frames {
                entry.set_state(frame, FrameState::Used);
            }
            entry.free_frames -= info_frames;
        }
        let free = entry.free_frames;
        drop(pools);

        log::info!(
            "frame pool: frames [{}, {}), {} free",
            base_frame,
            base_frame + nframes,
            free
        );
        FramePool {
            base_frame,
            nframes,
        }
    }

    /// First frame of the managed range.
    pub fn base_frame(&self) -> usize {
        self.base_frame
    }

    /// Number of managed frames.
    pub fn nframes(&self) -> usize {
        self.nframes
    }

    /// Allocate `n` contiguous frames, first fit. Returns the first frame
    /// number of the run, or `None` when no free run of that length
    /// exists. `None` is the only failure sentinel; every successful
    /// return is a valid frame number.
    pub fn get_frames(&self, n: usize) -> Option<usize> {
        alloc_from(self.base_frame, n)
    }

    /// Mark `n` frames starting at `first_frame` as allocated without
    /// searching, carving a hardware hole (e.g. memory-mapped I/O) out of
    /// the pool. Frames outside the managed range are ignored.
    pub fn mark_inaccessible(&self, first_frame: usize, n: usize) {
        let mut pools = POOLS.lock();
        let entry = match pools.iter_mut().find(|e| e.base_frame == self.base_frame) {
            Some(entry) => entry,
            None => return,
        };
        for frame in first_frame..first_frame + n {
            if !entry.contains(frame) {
                continue;
            }
            let state = if frame == first_frame {
                FrameState::HeadOfSequence
            } else {
                FrameState::Used
            };
            entry.set_state(frame, state);
            entry.free_frames = entry.free_frames.saturating_sub(1);
        }
    }

    /// Number of frames currently FREE.
    pub fn free_frames(&self) -> usize {
        POOLS
            .lock()
            .iter()
            .find(|e| e.base_frame == self.base_frame)
            .map(|e| e.free_frames)
            .unwrap_or(0)
    }

    /// Info frames needed to describe `n` frames: one byte covers four
    /// frames, one info frame covers `FRAME_SIZE * 4` of them.
    pub fn needed_info_frames(n: usize) -> usize {
        (n + FRAME_SIZE * FRAMES_PER_INFO_BYTE - 1) / (FRAME_SIZE * FRAMES_PER_INFO_BYTE)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        POOLS.lock().retain(|e| e.base_frame != self.base_frame);
    }
}

/// First-fit allocation inside the pool whose range starts at `base_key`.
pub(crate) fn alloc_from(base_key: usize, n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    let mut pools = POOLS.lock();
    let entry = pools.iter_mut().find(|e| e.base_frame == base_key)?;
    if entry.free_frames < n {
        return None;
    }

    let mut run_start = entry.base_frame;
    let mut run_len = 0;
    let mut found = false;
    for frame in entry.base_frame..entry.base_frame + entry.nframes {
        if entry.state(frame) == FrameState::Free {
            run_len += 1;
            if run_len == n {
                found = true;
                break;
            }
        } else {
            run_start = frame + 1;
            run_len = 0;
        }
    }
    if !found {
        return None;
    }

    entry.set_state(run_start, FrameState::HeadOfSequence);
    for frame in run_start + 1..run_start + n {
        entry.set_state(frame, FrameState::Used);
    }
    entry.free_frames -= n;
    Some(run_start)
}

/// Release the run whose head-of-sequence frame is `first_frame`.
///
/// The owning pool is located through the registry. An unknown frame, or a
/// frame that is not the head of a run, is silently ignored: at release
/// time there is no caller in a position to handle the error.
pub fn release_frames(first_frame: usize) {
    let mut pools = POOLS.lock();
    let entry = match pools.iter_mut().find(|e| e.contains(first_frame)) {
        Some(entry) => entry,
        None => {
            log::debug!("release_frames({}): no owning pool", first_frame);
            return;
        }
    };
    if entry.state(first_frame) != FrameState::HeadOfSequence {
        log::debug!("release_frames({}): not a sequence head", first_frame);
        return;
    }

    entry.set_state(first_frame, FrameState::Free);
    entry.free_frames += 1;
    let mut frame = first_frame + 1;
    while frame < entry.base_frame + entry.nframes && entry.state(frame) == FrameState::Used {
        entry.set_state(frame, FrameState::Free);
        entry.free_frames += 1;
        frame += 1;
    }
}

/// Drop every registry entry. Hosted-harness teardown only.
#[cfg(not(target_arch = "x86"))]
pub(crate) fn reset_registry() {
    POOLS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    #[test]
    fn in_pool_info_region_is_accounted() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 512, None);
        // One info frame covers 512 frames; it is carved out of the pool.
        assert_eq!(pool.free_frames(), 511);
    }

    #[test]
    fn external_info_region_leaves_pool_untouched() {
        let _m = sim::machine();
        let kernel = FramePool::new(512, 512, None);
        let info = kernel.get_frames(1).expect("info frame");
        let process = FramePool::new(1024, 7168, Some(info));
        assert_eq!(process.free_frames(), 7168);
    }

    #[test]
    fn first_fit_skips_the_info_run() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 512, None);
        assert_eq!(pool.get_frames(10), Some(513));
        assert_eq!(pool.free_frames(), 501);
    }

    #[test]
    fn release_restores_the_exact_run() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 512, None);
        let run = pool.get_frames(10).unwrap();
        let neighbor = pool.get_frames(5).unwrap();
        release_frames(run);
        assert_eq!(pool.free_frames(), 511 - 5);
        // The neighbor run still starts with a head cell: releasing it
        // again frees exactly its own five frames.
        release_frames(neighbor);
        assert_eq!(pool.free_frames(), 511);
    }

    #[test]
    fn release_in_any_order_round_trips() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 512, None);
        let initial = pool.free_frames();
        let a = pool.get_frames(3).unwrap();
        let b = pool.get_frames(7).unwrap();
        let c = pool.get_frames(1).unwrap();
        release_frames(b);
        release_frames(a);
        release_frames(c);
        assert_eq!(pool.free_frames(), initial);
    }

    #[test]
    fn release_of_non_head_frame_is_ignored() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 128, None);
        let run = pool.get_frames(4).unwrap();
        release_frames(run + 1);
        assert_eq!(pool.free_frames(), 127 - 4);
        release_frames(run);
        assert_eq!(pool.free_frames(), 127);
    }

    #[test]
    fn release_of_unowned_frame_is_ignored() {
        let _m = sim::machine();
        let _pool = FramePool::new(512, 128, None);
        release_frames(4096);
    }

    #[test]
    fn exhaustion_returns_none_without_scanning_past_capacity() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 16, None);
        assert_eq!(pool.free_frames(), 15);
        assert_eq!(pool.get_frames(16), None);
        let run = pool.get_frames(15).unwrap();
        assert_eq!(pool.get_frames(1), None);
        release_frames(run);
        assert_eq!(pool.free_frames(), 15);
    }

    #[test]
    fn mark_inaccessible_debits_the_counter() {
        let _m = sim::machine();
        let kernel = FramePool::new(512, 512, None);
        let info = kernel.get_frames(2).expect("info frames");
        let process = FramePool::new(1024, 7168, Some(info));
        process.mark_inaccessible(3840, 256);
        assert_eq!(process.free_frames(), 6912);
        // The hole splits the pool into runs of 2816 and 4096 frames.
        assert_eq!(process.get_frames(4096), Some(4096));
        assert_eq!(process.get_frames(2816), Some(1024));
        assert_eq!(process.free_frames(), 0);
    }

    #[test]
    fn needed_info_frames_rounds_up() {
        assert_eq!(FramePool::needed_info_frames(1), 1);
        assert_eq!(FramePool::needed_info_frames(FRAME_SIZE * 4), 1);
        assert_eq!(FramePool::needed_info_frames(FRAME_SIZE * 4 + 1), 2);
    }

    #[test]
    fn state_cells_pack_four_frames_per_byte() {
        let _m = sim::machine();
        let pool = FramePool::new(512, 64, None);
        // Runs of 1 exercise every cell position within a byte.
        let mut runs = alloc::vec::Vec::new();
        for _ in 0..6 {
            runs.push(pool.get_frames(1).unwrap());
        }
        assert_eq!(runs, alloc::vec![513, 514, 515, 516, 517, 518]);
        for run in runs {
            release_frames(run);
        }
        assert_eq!(pool.free_frames(), 63);
    }
}
