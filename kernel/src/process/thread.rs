//! Thread objects and the CPU hand-off.
//!
//! The core treats threads as opaque: all it needs is an identity and a
//! next-pointer so scheduler queues can be threaded through the thread
//! objects themselves. Stack setup and the register save/restore live
//! outside this crate, behind `arch`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Unique identifier for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedulable thread.
///
/// The `next` link belongs to whichever queue the thread currently sits
/// in; a thread is in at most one queue at a time.
pub struct Thread {
    id: ThreadId,
    next: Mutex<Option<Arc<Thread>>>,
}

impl Thread {
    /// Create a detached thread (in no queue, not running).
    pub fn new() -> Arc<Thread> {
        Arc::new(Thread {
            id: ThreadId::new(),
            next: Mutex::new(None),
        })
    }

    /// This thread's id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Successor in the owning queue.
    pub fn next(&self) -> Option<Arc<Thread>> {
        self.next.lock().clone()
    }

    /// Link `next` behind this thread in the owning queue.
    pub fn set_next(&self, next: Option<Arc<Thread>>) {
        *self.next.lock() = next;
    }
}

/// The thread currently holding the CPU.
static CURRENT: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

/// The running thread, if one has been dispatched.
pub fn current_thread() -> Option<Arc<Thread>> {
    CURRENT.lock().clone()
}

/// Make `thread` current without a hand-off (boot path: the first thread
/// starts running by construction, not by being switched to).
pub fn adopt_current(thread: Arc<Thread>) {
    *CURRENT.lock() = Some(thread);
}

/// Hand the CPU to `next`.
pub fn dispatch_to(next: &Arc<Thread>) {
    *CURRENT.lock() = Some(next.clone());
    crate::arch::switch_to(Arc::as_ptr(next) as *const core::ffi::c_void, next.id.as_u64());
}

/// Forget the current thread. Hosted-harness teardown only.
#[cfg(not(target_arch = "x86"))]
pub(crate) fn reset_current() {
    *CURRENT.lock() = None;
}
