//! The worker thread (C6): the OS thread hosting one scheduler, its
//! scheduler coroutine, and the preemption signal machinery.
//!
//! The "scheduler coroutine" is an ordinary [`Coroutine`] whose entry point
//! is [`scheduling_loop_entry`] -- the idle ⇄ scheduling cycle lives
//! entirely inside that one function, running on its own dedicated stack.
//! The worker's native OS thread does setup once and then makes exactly one
//! `restore` call into it; every subsequent re-entry (normal idle-wake, or
//! post-preemption) happens by `restore`ing into the *same fixed frame*
//! again -- `restore` is never symmetrically paired with a save. Loop-local
//! state is therefore never relied upon across a restart -- everything that
//! must survive lives in [`Scheduler`] or this struct's atomics.

use std::cell::{Cell, UnsafeCell};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Once};

use crate::coroutine::{
    set_current_coroutine, set_scheduler_return_frame, ArgBlob, Coroutine, CoroutineState,
};
use crate::frame::restore;
use crate::scheduler::Scheduler;
use crate::stack::Stack;

/// The signal used to deliver preemption. Chosen for the same reason most
/// userspace preemptive schedulers pick it: POSIX reserves it for
/// application use and the default libc disposition is harmless if this
/// runtime is ever linked alongside code that doesn't expect it.
pub const PREEMPT_SIGNAL: c_int = libc::SIGUSR1;

const ALT_STACK_SIZE: usize = libc::SIGSTKSZ;

/// How long the idle wait blocks before re-checking the shutdown flag.
/// Cooperative shutdown (see DESIGN.md) needs an idle worker to notice a
/// shutdown request even though nothing will ever post its semaphore again.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// A POSIX unnamed semaphore, boxed so its address is stable for the
/// lifetime of the `Worker` that owns it (required by `sem_init`/`sem_wait`
/// on at least some platforms even though glibc itself tolerates moves).
struct Semaphore(Box<UnsafeCell<libc::sem_t>>);

// The underlying sem_t is only ever touched through libc's own
// synchronization; sharing the handle across threads is its entire purpose.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn new() -> Semaphore {
        let mut sem = std::mem::MaybeUninit::<libc::sem_t>::uninit();
        let rc = unsafe { libc::sem_init(sem.as_mut_ptr(), 0, 0) };
        if rc != 0 {
            log::error!("sem_init failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
        Semaphore(Box::new(UnsafeCell::new(unsafe { sem.assume_init() })))
    }

    fn post(&self) {
        unsafe {
            libc::sem_post(self.0.get());
        }
    }

    /// Block until posted or `IDLE_POLL` elapses, whichever first. Returns
    /// `true` if posted, `false` on timeout.
    fn wait_timeout(&self) -> bool {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        ts.tv_nsec += IDLE_POLL.subsec_nanos() as i64;
        ts.tv_sec += IDLE_POLL.as_secs() as i64 + ts.tv_nsec / 1_000_000_000;
        ts.tv_nsec %= 1_000_000_000;
        let rc = unsafe { libc::sem_timedwait(self.0.get(), &ts) };
        rc == 0
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.0.get());
        }
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// `Created -> Idle <-> Scheduling -> Running -> (Scheduling | Idle)`, plus
/// terminal `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Idle = 1,
    Scheduling = 2,
    Running = 3,
    Dead = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Idle,
            2 => WorkerState::Scheduling,
            3 => WorkerState::Running,
            4 => WorkerState::Dead,
            _ => unreachable!("invalid worker state byte {v}"),
        }
    }
}

#[derive(Debug)]
struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    fn new(initial: WorkerState) -> Self {
        AtomicWorkerState(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One OS worker thread's state (C6).
pub struct Worker {
    pub id: usize,
    pub scheduler: Scheduler,
    scheduler_coroutine: Coroutine,
    idle_semaphore: Semaphore,
    state: AtomicWorkerState,
    time_slice_start_ns: AtomicU64,
    /// Set once the OS thread has started and called `pthread_self`; read
    /// by the monitor to deliver the preemption signal.
    pthread_handle: parking_lot::Mutex<Option<libc::pthread_t>>,
    _alt_stack: Stack,
    shutdown: Arc<AtomicBool>,
}

// `scheduler_coroutine`'s frame and `_alt_stack` are touched only by this
// worker's own OS thread (and, for the frame, the signal handler running on
// that same thread's alt stack) -- never concurrently from elsewhere.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(std::ptr::null()) };
}

impl Worker {
    /// Construct a worker. The scheduler coroutine's argument register is
    /// patched to point at the worker itself once it is behind an `Arc`
    /// (the coroutine can't borrow `self` during construction).
    pub fn new(id: usize, shutdown: Arc<AtomicBool>) -> Arc<Worker> {
        let scheduler_coroutine = Coroutine::create(
            format!("worker-{id}:scheduler-loop"),
            scheduling_loop_entry,
            ArgBlob::new(),
        );
        let worker = Arc::new(Worker {
            id,
            scheduler: Scheduler::new(),
            scheduler_coroutine,
            idle_semaphore: Semaphore::new(),
            state: AtomicWorkerState::new(WorkerState::Created),
            time_slice_start_ns: AtomicU64::new(0),
            pthread_handle: parking_lot::Mutex::new(None),
            _alt_stack: Stack::new(ALT_STACK_SIZE),
            shutdown,
        });
        unsafe {
            (*worker.scheduler_coroutine.frame_ptr()).rdi = Arc::as_ptr(&worker) as u64;
        }
        worker
    }

    pub fn enqueue_local(&self, coroutine: Arc<Coroutine>) {
        self.scheduler.enqueue_local(coroutine);
    }

    pub fn is_idle(&self) -> bool {
        self.state.load() == WorkerState::Idle
    }

    pub fn is_dead(&self) -> bool {
        self.state.load() == WorkerState::Dead
    }

    pub fn is_local_queue_empty(&self) -> bool {
        self.scheduler.is_empty()
    }

    pub fn wake(&self) {
        self.idle_semaphore.post();
    }

    /// Whether this worker has been `Running` continuously for more than
    /// `quantum`. Used by the monitor to decide whether to fire the
    /// preemption signal.
    pub fn exceeded_quantum(&self, now_ns: u64, quantum: std::time::Duration) -> bool {
        if self.state.load() != WorkerState::Running {
            return false;
        }
        let start = self.time_slice_start_ns.load(Ordering::SeqCst);
        now_ns.saturating_sub(start) > quantum.as_nanos() as u64
    }

    /// Send the preemption signal to this worker's OS thread, if it has
    /// started. No-op (not an error) if the thread hasn't recorded its
    /// pthread handle yet -- the monitor will simply try again next tick.
    pub fn send_preemption_signal(&self) {
        if let Some(handle) = *self.pthread_handle.lock() {
            unsafe {
                libc::pthread_kill(handle, PREEMPT_SIGNAL);
            }
        }
    }

    /// Spawn the OS thread that runs this worker forever (until shutdown).
    ///
    /// The OS thread's own call frame is abandoned, not unwound, the moment
    /// it `restore`s into the scheduler coroutine (see the module doc
    /// comment) -- a plain `Arc<Worker>` moved into the closure would sit
    /// in that frame forever with no drop glue ever reached. Converting it
    /// to a raw pointer here hands the thread the one strong reference
    /// `Worker::new`'s caller already accounted for; [`scheduling_loop_entry`]
    /// reclaims and drops it on the shutdown path, where ordinary Rust code
    /// still runs before the thread actually exits.
    pub fn spawn_os_thread(worker: Arc<Worker>) -> std::thread::JoinHandle<()> {
        let id = worker.id;
        let raw = SendPtr(Arc::into_raw(worker));
        std::thread::Builder::new()
            .name(format!("coro-rt-worker-{id}"))
            .spawn(move || worker_thread_main(raw.0))
            .expect("failed to spawn worker OS thread")
    }
}

/// A raw `*const Worker` is not `Send` on its own merits, but handing one
/// across the `spawn` boundary here is sound: the pointee is the data half
/// of an `Arc<Worker>` whose strong count this module manages explicitly
/// (see [`Worker::spawn_os_thread`] and the shutdown branch of
/// [`scheduling_loop_entry`]), and `Worker` itself is `Send + Sync`.
struct SendPtr(*const Worker);
unsafe impl Send for SendPtr {}

/// The worker OS thread's bootstrap: one-time setup, then a single,
/// never-returning `restore` into the scheduler coroutine.
///
/// `worker_ptr` carries the strong reference `spawn_os_thread` converted out
/// of its `Arc<Worker>` via `Arc::into_raw` -- this function never
/// reconstructs that `Arc`, so nothing here can drop it early.
fn worker_thread_main(worker_ptr: *const Worker) -> ! {
    let worker = unsafe { &*worker_ptr };
    CURRENT_WORKER.with(|cell| cell.set(worker_ptr));

    install_preemption_handler();
    install_alt_signal_stack(&worker._alt_stack);
    mask_preempt_signal();

    *worker.pthread_handle.lock() = Some(unsafe { libc::pthread_self() });

    log::debug!("worker {} started", worker.id);
    worker.state.store(WorkerState::Idle);

    unsafe { restore(worker.scheduler_coroutine.frame_ptr()) }
}

static HANDLER_INSTALLED: Once = Once::new();

fn install_preemption_handler() {
    HANDLER_INSTALLED.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = preemption_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(PREEMPT_SIGNAL, &action, std::ptr::null_mut()) != 0 {
            log::error!(
                "sigaction install failed: {}",
                std::io::Error::last_os_error()
            );
            std::process::abort();
        }
    });
}

fn install_alt_signal_stack(stack: &Stack) {
    let ss = libc::stack_t {
        ss_sp: stack.base() as *mut std::ffi::c_void,
        ss_flags: 0,
        ss_size: stack.len(),
    };
    if unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) } != 0 {
        log::error!(
            "sigaltstack install failed: {}",
            std::io::Error::last_os_error()
        );
        std::process::abort();
    }
}

fn signal_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PREEMPT_SIGNAL);
        set
    }
}

/// Block the preemption signal on the calling (worker) thread -- used while
/// the scheduling phase touches shared state that the signal handler would
/// otherwise also touch.
pub fn mask_preempt_signal() {
    let set = signal_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Unblock the preemption signal -- called only in the narrow window where
/// a selected user coroutine is about to run.
pub fn unmask_preempt_signal() {
    let set = signal_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// Total number of times the preemption signal handler has run, process-wide.
/// This is the "sidechannel incremented from the signal handler" the source
/// describes for observing preemption counts in tests -- not a tunable, just
/// a diagnostic counter with nothing else reading it.
static PREEMPTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Read [`PREEMPTION_COUNT`]. Process-wide, not per-runtime -- fine for
/// diagnostics and tests, misleading if two `Runtime`s run concurrently in
/// the same process and both expect an isolated count.
pub fn preemption_count() -> u64 {
    PREEMPTION_COUNT.load(Ordering::SeqCst)
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The preemption signal handler. Runs on the alt signal stack, on the
/// interrupted worker's own OS thread.
extern "C" fn preemption_handler(
    _sig: c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut std::ffi::c_void,
) {
    let worker_ptr = CURRENT_WORKER.with(|cell| cell.get());
    if worker_ptr.is_null() {
        return;
    }
    let worker = unsafe { &*worker_ptr };

    PREEMPTION_COUNT.fetch_add(1, Ordering::SeqCst);
    worker.state.store(WorkerState::Scheduling);

    let ucontext = ctx as *mut libc::ucontext_t;
    let gregs = unsafe { &(*ucontext).uc_mcontext.gregs };

    if let Some(current) = worker.scheduler.preempt_current() {
        unsafe {
            let frame = &mut *(*current).frame_ptr();
            frame.r15 = gregs[libc::REG_R15 as usize] as u64;
            frame.r14 = gregs[libc::REG_R14 as usize] as u64;
            frame.r13 = gregs[libc::REG_R13 as usize] as u64;
            frame.r12 = gregs[libc::REG_R12 as usize] as u64;
            frame.r11 = gregs[libc::REG_R11 as usize] as u64;
            frame.r10 = gregs[libc::REG_R10 as usize] as u64;
            frame.r9 = gregs[libc::REG_R9 as usize] as u64;
            frame.r8 = gregs[libc::REG_R8 as usize] as u64;
            frame.rbp = gregs[libc::REG_RBP as usize] as u64;
            frame.rdi = gregs[libc::REG_RDI as usize] as u64;
            frame.rsi = gregs[libc::REG_RSI as usize] as u64;
            frame.rdx = gregs[libc::REG_RDX as usize] as u64;
            frame.rcx = gregs[libc::REG_RCX as usize] as u64;
            frame.rbx = gregs[libc::REG_RBX as usize] as u64;
            frame.rax = gregs[libc::REG_RAX as usize] as u64;
            frame.rflags = gregs[libc::REG_EFL as usize] as u64;
            frame.rsp = gregs[libc::REG_RSP as usize] as u64;
            frame.rip = gregs[libc::REG_RIP as usize] as u64;
            (*current).state.store(CoroutineState::Runnable);
        }
    }

    unsafe { restore(worker.scheduler_coroutine.frame_ptr()) }
}

/// The scheduler coroutine's entry point: the idle ⇄ scheduling cycle,
/// looping internally for as long as this invocation lasts (see the module
/// doc comment for why "invocation" may be reset by a preemption without
/// losing correctness).
extern "C" fn scheduling_loop_entry(arg: *const u8) -> *mut u8 {
    let worker = unsafe { &*(arg as *const Worker) };

    loop {
        if worker.shutdown.load(Ordering::SeqCst) {
            worker.state.store(WorkerState::Dead);
            log::debug!("worker {} observed shutdown, exiting", worker.id);
            mask_preempt_signal();
            // Balance the `Arc::into_raw` in `Worker::spawn_os_thread`. This
            // is ordinary Rust code running before the thread actually
            // terminates, so the drop runs for real -- unlike the
            // `pthread_exit` below, which abandons this stack without
            // unwinding it. Dropping here frees this strong reference; the
            // `Runtime`'s own `Arc<Worker>` keeps the struct (and its
            // `Scheduler`, semaphore, and alt stack) alive until `Runtime`
            // itself is dropped.
            let reclaimed: *const Worker = worker;
            drop(unsafe { Arc::from_raw(reclaimed) });
            // This function runs on the scheduler coroutine's own stack,
            // reached only through `restore`'s `jmp` -- there is no ordinary
            // call frame underneath to return into. An ordinary `return`
            // would instead pop the exit-trampoline address `Coroutine::create`
            // installed on this stack and run straight into the bookkeeping
            // that finishes a *user* coroutine, which doesn't apply here:
            // this coroutine has no scheduler of its own to hand control
            // back to. Ending the OS thread directly is the correct analog.
            unsafe { libc::pthread_exit(std::ptr::null_mut()) }
        }

        // Idle phase.
        worker.state.store(WorkerState::Idle);
        mask_preempt_signal();
        if !worker.idle_semaphore.wait_timeout() {
            continue; // timed out re-checking shutdown; no work posted
        }

        // Scheduling phase.
        worker.state.store(WorkerState::Scheduling);
        mask_preempt_signal();

        worker.scheduler.requeue_if_still_running();

        let selected = match worker.scheduler.pick_next() {
            Some(co) => co,
            None => {
                worker.state.store(WorkerState::Idle);
                continue;
            }
        };

        unsafe {
            (*selected).state.store(CoroutineState::Running);
        }
        worker.state.store(WorkerState::Running);
        worker
            .time_slice_start_ns
            .store(now_ns(), Ordering::SeqCst);

        unsafe {
            set_scheduler_return_frame(worker.scheduler_coroutine.frame_ptr());
            set_current_coroutine(selected);
        }

        unmask_preempt_signal();
        unsafe { restore((*selected).frame_ptr()) }
    }
}
