//! An M:N user-space coroutine runtime with preemptive, signal-driven
//! scheduling for x86-64 Linux.
//!
//! An unbounded number of stackful coroutines are multiplexed over a fixed
//! pool of OS worker threads. Coroutines are cooperative only in the sense
//! that they never need to yield explicitly: a dedicated monitor thread
//! enforces a wall-clock quantum per running coroutine and preempts any
//! worker that overruns it by delivering a POSIX signal and resuming from
//! the register state the kernel hands the signal handler. There is no work
//! stealing -- a coroutine runs on whichever worker the monitor last placed
//! it on, via a single shared global submission queue.
//!
//! ```no_run
//! use coro_rt::{Runtime, RuntimeConfig};
//!
//! extern "C" fn hello(_: *const u8) -> *mut u8 {
//!     println!("hello from a coroutine");
//!     std::ptr::null_mut()
//! }
//!
//! let rt = Runtime::init(RuntimeConfig::new().with_worker_count(2));
//! rt.submit("hello", hello, &[]).unwrap();
//! std::thread::sleep(std::time::Duration::from_millis(10));
//! rt.shutdown();
//! ```

mod coroutine;
mod error;
mod frame;
mod monitor;
mod queue;
mod runtime;
mod scheduler;
mod stack;
mod worker;

pub use coroutine::{ArgBlob, CoroutineId, CoroutineState, EntryFn, MAX_ARGS};
pub use error::RuntimeError;
pub use frame::REGISTERS_COUNT;
pub use monitor::{MONITOR_TICK, QUANTUM};
pub use runtime::{CoroutineHandle, Runtime, RuntimeConfig, DEFAULT_WORKER_COUNT, SHUTDOWN_DEADLINE};
pub use stack::{stack_drop_count, DEFAULT_STACK_SIZE};
pub use worker::{preemption_count, PREEMPT_SIGNAL};
