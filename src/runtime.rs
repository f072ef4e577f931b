//! The runtime surface (C7, C9): owns the global queue and the worker/
//! monitor thread pool, and exposes `submit`/`shutdown` to embedders.
//!
//! There is deliberately no process-wide singleton here -- a global
//! scheduler is an anti-pattern for testability, and `snow-rt`'s own
//! `Scheduler` (`snow-rt/src/actor/scheduler.rs`) does the same: construct
//! one, use it, tear it down, construct another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::coroutine::{ArgBlob, Coroutine, CoroutineState, EntryFn};
use crate::error::RuntimeError;
use crate::monitor::{Monitor, MONITOR_TICK, QUANTUM};
use crate::queue::RunQueue;
use crate::stack::DEFAULT_STACK_SIZE;
use crate::worker::Worker;

/// Default worker pool size when a caller doesn't override it.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// How long [`Runtime::shutdown`] polls for workers to finish before giving
/// up and detaching their threads. See the "Shutdown" note in DESIGN.md:
/// Rust has no sound forced-kill, so this is a deadline on cooperative exit,
/// not a guarantee every thread has stopped when it elapses.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

const SHUTDOWN_POLL: Duration = Duration::from_millis(1);

/// Construction-time configuration for a [`Runtime`].
///
/// Every field defaults to this crate's compile-time constant; the builder
/// methods exist so an embedder can tune them per `Runtime::init` call
/// instead of only at compile time.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of OS worker threads to start. Zero is valid: per the
    /// boundary case, submission still succeeds and nothing ever runs.
    pub worker_count: usize,
    /// Stack size, in bytes, allocated for each submitted coroutine.
    pub stack_size: usize,
    /// Wall-clock time a coroutine may run before the monitor preempts it.
    pub quantum: Duration,
    /// Sleep between the monitor's drain/maintenance ticks.
    pub monitor_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_count: DEFAULT_WORKER_COUNT,
            stack_size: DEFAULT_STACK_SIZE,
            quantum: QUANTUM,
            monitor_tick: MONITOR_TICK,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig::default()
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn with_monitor_tick(mut self, monitor_tick: Duration) -> Self {
        self.monitor_tick = monitor_tick;
        self
    }
}

/// A running coroutine runtime: a global submission queue, a fixed worker
/// pool, and the monitor thread that feeds and preempts them.
pub struct Runtime {
    global_queue: Arc<Mutex<RunQueue>>,
    workers: Arc<Vec<Arc<Worker>>>,
    worker_threads: Vec<JoinHandle<()>>,
    monitor_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stack_size: usize,
}

impl Runtime {
    /// Bring up the worker pool and monitor thread.
    pub fn init(config: RuntimeConfig) -> Runtime {
        let shutdown = Arc::new(AtomicBool::new(false));
        let global_queue = Arc::new(Mutex::new(RunQueue::new()));

        let workers: Vec<Arc<Worker>> = (0..config.worker_count)
            .map(|id| Worker::new(id, shutdown.clone()))
            .collect();
        let worker_threads = workers
            .iter()
            .cloned()
            .map(Worker::spawn_os_thread)
            .collect();
        let workers = Arc::new(workers);

        let monitor = Arc::new(Monitor::new(
            global_queue.clone(),
            workers.clone(),
            shutdown.clone(),
            config.quantum,
            config.monitor_tick,
        ));
        let monitor_thread = Some(Monitor::spawn_os_thread(monitor));

        log::debug!("runtime started with {} worker(s)", workers.len());

        Runtime {
            global_queue,
            workers,
            worker_threads,
            monitor_thread,
            shutdown,
            stack_size: config.stack_size,
        }
    }

    /// Submit a new coroutine: build its argument blob, construct the
    /// coroutine, transition it to `Runnable`, and append it to the global
    /// queue for the monitor to pick up on its next drain.
    ///
    /// `args` is a list of `(value, size)` pairs, `size` one of `{1, 2, 4,
    /// 8}` bytes; `UnsupportedArgSize` is the only error this can return.
    pub fn submit(
        &self,
        location: impl Into<String>,
        entry: EntryFn,
        args: &[(u64, usize)],
    ) -> Result<CoroutineHandle, RuntimeError> {
        let mut blob = ArgBlob::new();
        for &(value, size) in args {
            blob.push(value, size)?;
        }

        let coroutine = Arc::new(Coroutine::create_with_stack_size(
            location,
            entry,
            blob,
            self.stack_size,
        ));
        let id = coroutine.id;
        coroutine.state.store(CoroutineState::Runnable);
        log::debug!("submitted {id} ({})", coroutine.location());
        self.global_queue.lock().append(coroutine);

        Ok(CoroutineHandle { id })
    }

    /// Current length of the global queue (diagnostics/tests).
    pub fn pending(&self) -> usize {
        self.global_queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Request shutdown and wait for workers to notice, up to
    /// [`SHUTDOWN_DEADLINE`]. Returns `true` if every worker observably
    /// stopped within the deadline, `false` if the deadline elapsed first.
    ///
    /// Worker OS threads never return through an ordinary call frame (see
    /// the note on the shutdown branch in `worker.rs`), so this polls each
    /// worker's own `Dead` state rather than joining their `JoinHandle`s --
    /// joining would simply block forever. The monitor thread is a plain
    /// function that returns normally once it observes shutdown, so it is
    /// joined the ordinary way.
    pub fn shutdown(mut self) -> bool {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.iter() {
            worker.wake();
        }

        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        let clean = loop {
            if self.workers.iter().all(|w| w.is_dead()) {
                break true;
            }
            if Instant::now() >= deadline {
                log::error!("shutdown deadline elapsed with workers still running");
                break false;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        };

        if let Some(handle) = self.monitor_thread.take() {
            let _ = handle.join();
        }
        // Worker threads have already run `pthread_exit` (or are still
        // mid-coroutine past the deadline); either way there is nothing
        // left to join through the ordinary std mechanism. Dropping the
        // handles detaches them rather than blocking.
        self.worker_threads.clear();

        clean
    }
}

/// A handle to a submitted coroutine. Presently identity-only: the public
/// surface has no join/result mechanism, so this exists to give callers
/// something to log or compare rather than to await.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoroutineHandle {
    pub id: crate::coroutine::CoroutineId,
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_: *const u8) -> *mut u8 {
        std::ptr::null_mut()
    }

    #[test]
    fn submit_with_zero_workers_succeeds_and_nothing_runs() {
        let rt = Runtime::init(RuntimeConfig::new().with_worker_count(0));
        let handle = rt.submit("test:noop", noop, &[]).unwrap();
        assert_eq!(rt.worker_count(), 0);
        let _ = handle;
        assert!(rt.shutdown());
    }

    #[test]
    fn submit_rejects_unsupported_arg_size() {
        let rt = Runtime::init(RuntimeConfig::new().with_worker_count(0));
        let err = rt.submit("test:bad-arg", noop, &[(1, 3)]).unwrap_err();
        assert_eq!(err, RuntimeError::UnsupportedArgSize { index: 0, size: 3 });
        assert!(rt.shutdown());
    }

    #[test]
    fn shutdown_with_running_workers_completes_within_deadline() {
        let rt = Runtime::init(RuntimeConfig::new().with_worker_count(2));
        assert!(rt.submit("test:noop", noop, &[]).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(rt.shutdown());
    }

    #[test]
    fn config_builder_overrides_every_default() {
        let config = RuntimeConfig::new()
            .with_worker_count(3)
            .with_stack_size(32 * 1024)
            .with_quantum(Duration::from_millis(5))
            .with_monitor_tick(Duration::from_micros(100));
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.stack_size, 32 * 1024);
        assert_eq!(config.quantum, Duration::from_millis(5));
        assert_eq!(config.monitor_tick, Duration::from_micros(100));
    }

    #[test]
    fn submitted_coroutine_stack_honors_configured_size() {
        let rt = Runtime::init(RuntimeConfig::new().with_worker_count(0).with_stack_size(64 * 1024));
        assert_eq!(rt.stack_size, 64 * 1024);
        assert!(rt.submit("test:custom-stack", noop, &[]).is_ok());
        assert!(rt.shutdown());
    }
}
