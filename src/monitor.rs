//! The monitor thread (C8): periodically drains the global queue onto
//! workers, wakes idle workers, and fires the preemption signal at workers
//! that have overrun their quantum.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::coroutine::CoroutineState;
use crate::queue::RunQueue;
use crate::worker::Worker;

/// Maximum wall-clock time a coroutine may run before being preempted.
pub const QUANTUM: Duration = Duration::from_millis(20);

/// Sleep between monitor ticks.
pub const MONITOR_TICK: Duration = Duration::from_micros(500);

/// The global queue, shared between the submission path (C7) and the
/// monitor's drain pass (C8). A plain type alias rather than a newtype --
/// both sides just need a mutex-guarded queue, nothing else.
pub type GlobalQueue = Arc<Mutex<RunQueue>>;

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The monitor's own OS thread driver.
pub struct Monitor {
    global_queue: GlobalQueue,
    workers: Arc<Vec<Arc<Worker>>>,
    shutdown: Arc<AtomicBool>,
    next: std::sync::atomic::AtomicUsize,
    quantum: Duration,
    tick_interval: Duration,
}

impl Monitor {
    /// `quantum` and `tick_interval` default to [`QUANTUM`]/[`MONITOR_TICK`]
    /// but are overridable per [`crate::runtime::RuntimeConfig`].
    pub fn new(
        global_queue: GlobalQueue,
        workers: Arc<Vec<Arc<Worker>>>,
        shutdown: Arc<AtomicBool>,
        quantum: Duration,
        tick_interval: Duration,
    ) -> Monitor {
        Monitor {
            global_queue,
            workers,
            shutdown,
            next: std::sync::atomic::AtomicUsize::new(0),
            quantum,
            tick_interval,
        }
    }

    pub fn spawn_os_thread(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("coro-rt-monitor".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn monitor OS thread")
    }

    fn run(&self) {
        log::debug!("monitor started ({} workers)", self.workers.len());
        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(self.tick_interval);
        }
        log::debug!("monitor observed shutdown, exiting");
    }

    /// One monitor tick: drain the global queue, then perform per-worker
    /// maintenance.
    fn tick(&self) {
        self.drain_global_queue();
        self.maintain_workers();
    }

    /// Drain pass. Bounded to the queue's length at the start of the pass,
    /// mirroring `pick_next`'s "visit each element at most once" discipline
    /// -- anything submitted mid-drain is picked up next tick.
    fn drain_global_queue(&self) {
        let mut queue = self.global_queue.lock();
        let bound = queue.len();
        for _ in 0..bound {
            let Some(front) = queue.front() else {
                break;
            };
            match front.state.load() {
                CoroutineState::Runnable => {
                    let coroutine = queue.pop_front().expect("front just observed present");
                    let worker_count = self.workers.len();
                    if worker_count == 0 {
                        // Zero workers: submission still succeeds and
                        // nothing ever runs. Leave it off any local queue --
                        // there is none to put it on -- and drop it back
                        // onto the global queue so it remains observable
                        // rather than silently vanishing.
                        queue.append(coroutine);
                        break;
                    }
                    let idx = self.next.fetch_add(1, Ordering::SeqCst) % worker_count;
                    log::trace!("dispatching {} to worker {idx}", coroutine.id);
                    self.workers[idx].enqueue_local(coroutine);
                }
                CoroutineState::Done => {
                    queue.pop_front();
                }
                CoroutineState::Created => {
                    log::error!("invariant violation: Created coroutine observed on global queue");
                    std::process::abort();
                }
                CoroutineState::Running | CoroutineState::Syscall | CoroutineState::Waiting => {
                    queue.rotate();
                }
            }
        }
    }

    /// Per-worker maintenance: wake idle workers with pending local work,
    /// and preempt workers that have overrun their quantum.
    fn maintain_workers(&self) {
        let now = now_ns();
        for worker in self.workers.iter() {
            if worker.is_local_queue_empty() {
                continue;
            }
            if worker.is_idle() {
                worker.wake();
            } else if worker.exceeded_quantum(now, self.quantum) {
                log::debug!("worker {} exceeded its quantum, sending preemption signal", worker.id);
                worker.send_preemption_signal();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{ArgBlob, Coroutine};
    use std::sync::atomic::AtomicBool;

    extern "C" fn noop(_: *const u8) -> *mut u8 {
        std::ptr::null_mut()
    }

    #[test]
    fn drain_distributes_runnable_round_robin() {
        let global = Arc::new(Mutex::new(RunQueue::new()));
        for i in 0..4 {
            let co = Arc::new(Coroutine::create(format!("co{i}"), noop, ArgBlob::new()));
            co.state.store(CoroutineState::Runnable);
            global.lock().append(co);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(vec![
            Worker::new(0, shutdown.clone()),
            Worker::new(1, shutdown.clone()),
        ]);
        let monitor = Monitor::new(global.clone(), workers.clone(), shutdown, QUANTUM, MONITOR_TICK);
        monitor.drain_global_queue();

        assert_eq!(global.lock().len(), 0);
        assert_eq!(workers[0].scheduler.local_len(), 2);
        assert_eq!(workers[1].scheduler.local_len(), 2);
    }

    #[test]
    fn drain_prunes_done_and_leaves_running_in_place() {
        let global = Arc::new(Mutex::new(RunQueue::new()));
        let done = Arc::new(Coroutine::create("done", noop, ArgBlob::new()));
        done.state.store(CoroutineState::Done);
        let running = Arc::new(Coroutine::create("running", noop, ArgBlob::new()));
        running.state.store(CoroutineState::Running);
        global.lock().append(done);
        global.lock().append(running.clone());

        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(vec![Worker::new(0, shutdown.clone())]);
        let monitor = Monitor::new(global.clone(), workers, shutdown, QUANTUM, MONITOR_TICK);
        monitor.drain_global_queue();

        // done was pruned, running was rotated but not removed
        assert_eq!(global.lock().len(), 1);
        assert_eq!(global.lock().front().unwrap().id, running.id);
    }
}
