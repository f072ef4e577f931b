//! Per-worker scheduler (C5): owns one local run queue, picks the next
//! runnable coroutine, and prunes ones it finds `Done`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::coroutine::{Coroutine, CoroutineState};
use crate::queue::RunQueue;

/// Per-worker scheduling state. `current` stays as the queue's front while
/// `Running` rather than being detached into a separate slot -- this keeps
/// `pick_next` and the preemption handler's rotate step working against the
/// same queue without a second bookkeeping slot.
pub struct Scheduler {
    local_queue: Mutex<RunQueue>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            local_queue: Mutex::new(RunQueue::new()),
        }
    }

    /// Append a coroutine to this worker's local queue; called by the
    /// monitor's drain pass. Thread-safe: callers do not need to hold any
    /// other lock.
    pub fn enqueue_local(&self, coroutine: Arc<Coroutine>) {
        self.local_queue.lock().append(coroutine);
    }

    pub fn local_len(&self) -> usize {
        self.local_queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_queue.lock().is_empty()
    }

    /// Scan the local queue from the front for at most `queue.size`
    /// positions:
    ///   1. `Runnable` front -> return it (left at the front, marked
    ///      `Running` by the caller).
    ///   2. `Done` front -> pop and drop it; continue from the new front.
    ///   3. Otherwise (`Running`/`Syscall`/`Waiting`) -> rotate; continue.
    /// Returns `None` if no runnable coroutine exists after a full scan.
    /// `pick_next` visits each queue element at most once per call.
    ///
    /// Returns a borrowed raw pointer rather than a cloned `Arc`: the queue
    /// node keeps the sole strong reference while the coroutine sits at the
    /// front as `current`, left in place rather than detached into a
    /// separate slot. A caller that `restore`s into the returned coroutine
    /// diverges without
    /// running destructors, so an owned `Arc` handed across that boundary
    /// would never be dropped -- a permanent per-schedule leak. The pointer
    /// stays valid for as long as the coroutine remains the queue's front,
    /// which holds until it is popped as `Done`.
    pub fn pick_next(&self) -> Option<*const Coroutine> {
        let mut queue = self.local_queue.lock();
        let bound = queue.len();
        for _ in 0..bound {
            match queue.front() {
                None => return None,
                Some(front) => match front.state.load() {
                    CoroutineState::Runnable => return Some(Arc::as_ptr(front)),
                    CoroutineState::Done => {
                        queue.pop_front();
                    }
                    CoroutineState::Running
                    | CoroutineState::Syscall
                    | CoroutineState::Waiting => {
                        queue.rotate();
                    }
                    CoroutineState::Created => {
                        // A `Created` coroutine should never be enqueued --
                        // submission transitions to `Runnable` atomically
                        // with enqueue -- but rotating rather than looping
                        // forever keeps a misbehaving producer from
                        // starving this worker.
                        queue.rotate();
                    }
                },
            }
        }
        None
    }

    /// Called under the local queue's lock at the start of the scheduling
    /// phase: if the coroutine that was `current` is still marked `Running`
    /// -- i.e. it was preempted rather than finishing on its own -- demote
    /// it to `Runnable` and rotate it to the tail.
    pub fn requeue_if_still_running(&self) {
        let mut queue = self.local_queue.lock();
        if let Some(front) = queue.front() {
            if front.state.load() == CoroutineState::Running {
                front.state.store(CoroutineState::Runnable);
                queue.rotate();
            }
        }
    }

    /// The preemption handler's queue-side bookkeeping, minus the frame copy
    /// the caller performs once the lock is released: identify the current
    /// (front) coroutine and rotate it to the tail.
    /// Returns a borrowed raw pointer for the same leak-avoidance reason as
    /// `pick_next`; the caller must not retain it past the point the
    /// coroutine could next be popped as `Done`.
    pub fn preempt_current(&self) -> Option<*const Coroutine> {
        let mut queue = self.local_queue.lock();
        let current = queue.front().map(Arc::as_ptr);
        if current.is_some() {
            queue.rotate();
        }
        current
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}
