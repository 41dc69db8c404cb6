//! Cooperative FIFO scheduler with an I/O wait queue.
//!
//! Single processor, no preemption: the CPU changes hands only when the
//! running thread calls in here. Two queues, both strictly FIFO and both
//! threaded through the threads' own next-pointers: the ready queue and
//! the I/O wait queue for threads blocked on the disk.
//!
//! There is no interrupt-driven completion path. Instead every `resume` —
//! which is already a scheduling event — peeks at the drive: if a thread
//! is waiting for I/O and the status port reports DRQ, the head of the
//! I/O queue moves back to the ready tail. One completion drains per
//! resume; several completions need several resumes.

use alloc::sync::Arc;

use spin::Mutex;

use super::thread::{dispatch_to, Thread};
use crate::arch;

/// ATA status port, polled for the data-request bit.
const ATA_STATUS_PORT: u16 = 0x1F7;
/// DRQ: the drive is ready to transfer data.
const ATA_SR_DRQ: u8 = 0x08;

/// A FIFO of threads linked through their next-pointers.
struct ThreadQueue {
    head: Option<Arc<Thread>>,
    tail: Option<Arc<Thread>>,
}

impl ThreadQueue {
    const fn new() -> ThreadQueue {
        ThreadQueue {
            head: None,
            tail: None,
        }
    }

    fn push_back(&mut self, thread: Arc<Thread>) {
        thread.set_next(None);
        match &self.tail {
            Some(tail) => tail.set_next(Some(thread.clone())),
            None => self.head = Some(thread.clone()),
        }
        self.tail = Some(thread);
    }

    fn pop_front(&mut self) -> Option<Arc<Thread>> {
        let head = self.head.take()?;
        self.head = head.next();
        head.set_next(None);
        if self.head.is_none() {
            self.tail = None;
        }
        Some(head)
    }

    /// Unlink `thread` wherever it sits. False if it is not queued here.
    fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        let head = match &self.head {
            Some(head) => head.clone(),
            None => return false,
        };
        if Arc::ptr_eq(&head, thread) {
            self.pop_front();
            return true;
        }
        let mut prev = head;
        while let Some(cur) = prev.next() {
            if Arc::ptr_eq(&cur, thread) {
                prev.set_next(cur.next());
                cur.set_next(None);
                if let Some(tail) = &self.tail {
                    if Arc::ptr_eq(tail, thread) {
                        self.tail = Some(prev);
                    }
                }
                return true;
            }
            prev = cur;
        }
        false
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[cfg(not(target_arch = "x86"))]
    fn ids(&self) -> alloc::vec::Vec<super::ThreadId> {
        let mut ids = alloc::vec::Vec::new();
        let mut cur = self.head.clone();
        while let Some(thread) = cur {
            ids.push(thread.id());
            cur = thread.next();
        }
        ids
    }
}

struct Queues {
    ready: ThreadQueue,
    io: ThreadQueue,
}

/// The cooperative scheduler.
pub struct Scheduler {
    queues: Mutex<Queues>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        log::info!("scheduler: ready");
        Scheduler {
            queues: Mutex::new(Queues {
                ready: ThreadQueue::new(),
                io: ThreadQueue::new(),
            }),
        }
    }

    /// Give up the CPU: dequeue the head of the ready queue and switch to
    /// it. The caller is responsible for having queued itself first if it
    /// wants to run again. With nothing ready there is nowhere to switch;
    /// the call is a logged no-op.
    pub fn yield_cpu(&self) {
        let next = self.queues.lock().ready.pop_front();
        match next {
            Some(thread) => dispatch_to(&thread),
            None => log::warn!("yield with an empty ready queue"),
        }
    }

    /// Append `thread` to the ready tail, then drain at most one I/O
    /// completion: if a thread is waiting on the disk and the drive
    /// reports DRQ, the wait-queue head rejoins the ready tail.
    pub fn resume(&self, thread: Arc<Thread>) {
        let mut queues = self.queues.lock();
        queues.ready.push_back(thread);

        if !queues.io.is_empty() {
            // SAFETY: reading the ATA status port has no side effects the
            // kernel cares about here.
            let status = unsafe { arch::inb(ATA_STATUS_PORT) };
            if status & ATA_SR_DRQ != 0 {
                let woken = queues.io.pop_front().expect("io queue is non-empty");
                log::debug!("thread {} finished waiting for the disk", woken.id());
                queues.ready.push_back(woken);
            }
        }
    }

    /// Hand a new thread to the scheduler. Same effect as `resume`.
    pub fn add(&self, thread: Arc<Thread>) {
        self.resume(thread);
    }

    /// Remove `thread` from the ready queue. A thread that is not queued
    /// (running, blocked on I/O, or already gone) is left alone.
    pub fn terminate(&self, thread: &Arc<Thread>) {
        self.queues.lock().ready.remove(thread);
    }

    /// Park `thread` on the I/O wait queue and give up the CPU. The
    /// thread runs again only after some `resume` finds the drive ready
    /// and moves it back; by then the transfer can proceed.
    pub fn add_to_ioqueue(&self, thread: Arc<Thread>) {
        self.queues.lock().io.push_back(thread);
        self.yield_cpu();
    }

    /// Ready-queue contents, head first. Hosted-model inspection.
    #[cfg(not(target_arch = "x86"))]
    pub fn ready_ids(&self) -> alloc::vec::Vec<super::ThreadId> {
        self.queues.lock().ready.ids()
    }

    /// I/O-queue contents, head first. Hosted-model inspection.
    #[cfg(not(target_arch = "x86"))]
    pub fn io_ids(&self) -> alloc::vec::Vec<super::ThreadId> {
        self.queues.lock().io.ids()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim;
    use crate::sim as harness;

    /// Put the drive model in a state with DRQ raised: issue a read and
    /// leave the data untransferred.
    fn raise_drq() {
        unsafe { arch::outb(ATA_STATUS_PORT, 0x20) };
    }

    #[test]
    fn yield_runs_threads_in_fifo_order() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let t1 = Thread::new();
        let t2 = Thread::new();
        let t3 = Thread::new();
        sched.add(t1.clone());
        sched.add(t2.clone());
        sched.add(t3.clone());

        sched.yield_cpu();
        assert_eq!(sim::dispatch_log(), alloc::vec![t1.id().as_u64()]);
        assert_eq!(sched.ready_ids(), alloc::vec![t2.id(), t3.id()]);
        assert!(crate::process::current_thread()
            .map(|t| Arc::ptr_eq(&t, &t1))
            .unwrap_or(false));
    }

    #[test]
    fn terminate_unlinks_head_interior_and_tail() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let t1 = Thread::new();
        let t2 = Thread::new();
        let t3 = Thread::new();
        sched.add(t1.clone());
        sched.add(t2.clone());
        sched.add(t3.clone());

        sched.terminate(&t2);
        assert_eq!(sched.ready_ids(), alloc::vec![t1.id(), t3.id()]);
        sched.terminate(&t3);
        assert_eq!(sched.ready_ids(), alloc::vec![t1.id()]);
        sched.terminate(&t1);
        assert!(sched.ready_ids().is_empty());
        // Terminating an absent thread changes nothing.
        sched.terminate(&t2);
        assert!(sched.ready_ids().is_empty());
    }

    #[test]
    fn resume_then_yield_empties_the_queue() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let t1 = Thread::new();
        sched.resume(t1.clone());
        sched.yield_cpu();
        assert!(sched.ready_ids().is_empty());
        assert_eq!(sim::dispatch_log(), alloc::vec![t1.id().as_u64()]);
    }

    #[test]
    fn io_wait_holds_until_the_drive_is_ready() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let worker = Thread::new();
        let other = Thread::new();

        sched.add_to_ioqueue(worker.clone());
        assert_eq!(sched.io_ids(), alloc::vec![worker.id()]);

        // Drive not ready: resume leaves the waiter alone.
        sched.resume(other.clone());
        assert_eq!(sched.io_ids(), alloc::vec![worker.id()]);
        assert_eq!(sched.ready_ids(), alloc::vec![other.id()]);

        // Drive ready: the next resume moves the waiter to the ready tail.
        sched.yield_cpu();
        raise_drq();
        sched.resume(other.clone());
        assert!(sched.io_ids().is_empty());
        assert_eq!(sched.ready_ids(), alloc::vec![other.id(), worker.id()]);
    }

    #[test]
    fn one_completion_drains_per_resume() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let w1 = Thread::new();
        let w2 = Thread::new();
        let other = Thread::new();

        sched.add_to_ioqueue(w1.clone());
        sched.add_to_ioqueue(w2.clone());
        raise_drq();

        sched.resume(other.clone());
        assert_eq!(sched.io_ids(), alloc::vec![w2.id()]);
        sched.yield_cpu();
        raise_drq();
        sched.resume(other.clone());
        assert!(sched.io_ids().is_empty());
    }

    #[test]
    fn a_thread_is_never_in_both_queues() {
        let _m = harness::machine();
        let sched = Scheduler::new();
        let t = Thread::new();
        sched.add_to_ioqueue(t.clone());
        assert_eq!(sched.io_ids(), alloc::vec![t.id()]);
        assert!(sched.ready_ids().is_empty());

        raise_drq();
        sched.resume(Thread::new());
        let ready = sched.ready_ids();
        let io = sched.io_ids();
        assert!(io.is_empty());
        assert_eq!(ready.iter().filter(|id| **id == t.id()).count(), 1);
    }
}
