//! The coroutine handle: stack, register frame, entry point, arguments, and
//! atomic state (C3), plus the exit trampoline that makes a returning
//! coroutine safe.

use std::alloc::{self, Layout};
use std::arch::asm;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::RuntimeError;
use crate::frame::{restore, RegisterFrame};
use crate::stack::Stack;

/// Entry-point signature for a coroutine body.
///
/// A single pointer in, a single pointer out: a raw function pointer that
/// reads its arguments back out of a typed blob rather than out of hand-
/// packed registers. [`ArgBlob`] is that blob; user code never reads raw
/// registers.
pub type EntryFn = extern "C" fn(*const u8) -> *mut u8;

/// Unique, process-wide identity for a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(u64);

impl CoroutineId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        CoroutineId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "co#{}", self.0)
    }
}

/// The maximum number of argument fields a coroutine may be created with.
pub const MAX_ARGS: usize = 8;

/// Packs up to [`MAX_ARGS`] integer fields (1/2/4/8 bytes each) into the byte
/// layout a coroutine entry point reads back out.
///
/// Construction is the only place that deals in raw widths; a malformed
/// width is rejected here rather than corrupting a register at resume time.
#[derive(Debug, Default, Clone)]
pub struct ArgBlob {
    bytes: Vec<u8>,
    count: usize,
}

impl ArgBlob {
    pub fn new() -> Self {
        ArgBlob::default()
    }

    /// Append one field. `size` must be one of `{1, 2, 4, 8}`; `value` is
    /// truncated to the low `size` bytes (callers pass already-narrowed
    /// values -- this never sign- or zero-extends on the way in, only on
    /// the way out).
    pub fn push(&mut self, value: u64, size: usize) -> Result<(), RuntimeError> {
        if self.count >= MAX_ARGS {
            return Err(RuntimeError::TooManyArgs { max: MAX_ARGS });
        }
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(RuntimeError::UnsupportedArgSize {
                index: self.count,
                size,
            });
        }
        self.bytes.extend_from_slice(&value.to_ne_bytes()[..size]);
        self.count += 1;
        Ok(())
    }

    pub fn field_count(&self) -> usize {
        self.count
    }

    fn into_boxed(self) -> Box<[u8]> {
        self.bytes.into_boxed_slice()
    }
}

/// The execution state of a coroutine.
///
/// `Syscall` and `Waiting` are carried as declared variants with no producer
/// in this core -- the selector and monitor treat them identically to
/// `Running`: skip, leave in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineState {
    Created = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Syscall = 4,
    Done = 5,
}

impl CoroutineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CoroutineState::Created,
            1 => CoroutineState::Runnable,
            2 => CoroutineState::Running,
            3 => CoroutineState::Waiting,
            4 => CoroutineState::Syscall,
            5 => CoroutineState::Done,
            _ => unreachable!("invalid coroutine state byte {v}"),
        }
    }
}

/// An atomically-readable [`CoroutineState`] cell.
///
/// `state` is the only coroutine field any observer may read without
/// holding a queue mutex -- the selector scan and the monitor's drain both
/// rely on this.
#[derive(Debug)]
pub struct AtomicCoroutineState(AtomicU8);

impl AtomicCoroutineState {
    fn new(initial: CoroutineState) -> Self {
        AtomicCoroutineState(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> CoroutineState {
        CoroutineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: CoroutineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically move from `current` to `new`, returning whether it took.
    pub fn compare_exchange(&self, current: CoroutineState, new: CoroutineState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

thread_local! {
    /// The register frame a worker's scheduler coroutine resumes into when
    /// the currently-running coroutine on this thread finishes on its own
    /// (as opposed to being preempted, which resumes it directly from the
    /// signal handler). Set by the worker immediately before `restore`-ing
    /// into a user coroutine; read only by [`exit_trampoline`].
    static SCHEDULER_RETURN_FRAME: Cell<*const RegisterFrame> = const { Cell::new(std::ptr::null()) };

    /// The coroutine presently executing on this worker thread, so the exit
    /// trampoline can mark it `Done` without the worker passing it through
    /// registers across the `restore` it is about to perform.
    static CURRENT_COROUTINE: Cell<*const Coroutine> = const { Cell::new(std::ptr::null()) };
}

/// Install the frame the exit trampoline resumes into once the coroutine
/// about to be `restore`d finishes. Called by the worker main loop
/// immediately before `restore(selected.frame)`.
///
/// # Safety
/// `scheduler_frame` must remain valid and addressable for as long as any
/// coroutine resumed on this thread might still return through the
/// trampoline -- in practice, for the lifetime of the worker.
pub unsafe fn set_scheduler_return_frame(scheduler_frame: *const RegisterFrame) {
    SCHEDULER_RETURN_FRAME.with(|cell| cell.set(scheduler_frame));
}

/// Record which coroutine is about to be resumed on this thread, so the
/// trampoline can find it again on return.
///
/// # Safety
/// `coroutine` must outlive the resumed execution (it does: it is only
/// freed once observed `Done` on a queue, which happens strictly after the
/// trampoline runs).
pub unsafe fn set_current_coroutine(coroutine: *const Coroutine) {
    CURRENT_COROUTINE.with(|cell| cell.set(coroutine));
}

/// The exit trampoline: required, not optional, for memory safety.
/// Installed as the return address in every coroutine's initial frame (see
/// [`Coroutine::create_with_stack_size`]); a user entry function that
/// returns normally lands here instead of in undefined stack memory below
/// its initial `rsp`.
///
/// The entry function's return value arrives in `rax` per the platform
/// calling convention; this moves it into the first argument register
/// before handing off to [`finish_current_coroutine`] so the rest of the
/// trampoline can be ordinary (if unsafe) Rust.
#[inline(never)]
#[no_mangle]
unsafe extern "C" fn exit_trampoline() -> ! {
    unsafe {
        asm!(
            "mov rdi, rax",
            "call {finish}",
            finish = sym finish_current_coroutine,
            options(noreturn),
        )
    }
}

/// # Safety
/// Must only ever be reached via [`exit_trampoline`], on a worker thread
/// that has called [`set_scheduler_return_frame`] and
/// [`set_current_coroutine`] for the coroutine that just returned.
unsafe extern "C" fn finish_current_coroutine(_retval: *mut u8) -> ! {
    let coroutine = CURRENT_COROUTINE.with(|cell| cell.get());
    let scheduler_frame = SCHEDULER_RETURN_FRAME.with(|cell| cell.get());
    debug_assert!(!coroutine.is_null(), "exit trampoline with no current coroutine");
    debug_assert!(!scheduler_frame.is_null(), "exit trampoline with no scheduler frame");
    unsafe {
        log::debug!("{} ({}) finished", (*coroutine).id, (*coroutine).location());
        (*coroutine).state.store(CoroutineState::Done);
        restore(scheduler_frame)
    }
}

/// A coroutine: an owned stack, a register frame pointing into it, an
/// atomic state, and (kept alive for the coroutine's lifetime) the argument
/// bytes its initial frame points `rdi` at.
pub struct Coroutine {
    pub id: CoroutineId,
    /// Only [`restore`] and the preemption signal handler may read or write
    /// individual fields; everywhere else this is opaque. `UnsafeCell`
    /// because both the worker (via `restore`) and the signal handler (on
    /// preemption) must be able to write through a shared `&Coroutine`.
    frame: std::cell::UnsafeCell<RegisterFrame>,
    stack: Stack,
    args: Box<[u8]>,
    entry: EntryFn,
    location: String,
    pub state: AtomicCoroutineState,
}

// The raw pointers inside (stack, frame contents) are only ever touched by
// the worker thread that currently owns this coroutine -- the queue
// discipline in `Scheduler`/`RunQueue` hands a coroutine to exactly one
// worker at a time.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Construct a coroutine with the default stack size.
    pub fn create(location: impl Into<String>, entry: EntryFn, args: ArgBlob) -> Coroutine {
        Coroutine::create_with_stack_size(location, entry, args, crate::stack::DEFAULT_STACK_SIZE)
    }

    /// Allocate a stack of `stack_size` bytes, point the frame at `entry`
    /// with `args` as its argument blob, install the exit trampoline as the
    /// initial return address, and set state to `Created`.
    /// [`Coroutine::create`] is the common case; this is the path
    /// [`crate::runtime::RuntimeConfig::with_stack_size`] threads through.
    pub fn create_with_stack_size(
        location: impl Into<String>,
        entry: EntryFn,
        args: ArgBlob,
        stack_size: usize,
    ) -> Coroutine {
        let stack = Stack::new(stack_size);
        let args = args.into_boxed();

        // Reserve 8 bytes at the top of the stack for the trampoline return
        // address, mirroring what a `call` instruction would have pushed;
        // `entry` is reached via `jmp`, not `call`, so nothing does this for
        // free. The resulting rsp is 8-mod-16, matching a real call-entry.
        let ret_slot = unsafe { stack.top().cast::<u64>().sub(1) };
        unsafe { ret_slot.write(exit_trampoline as usize as u64) };

        let arg_ptr = if args.is_empty() {
            std::ptr::null()
        } else {
            args.as_ptr()
        };
        let frame = RegisterFrame::new_entry(entry, ret_slot.cast::<u8>(), arg_ptr as u64);

        Coroutine {
            id: CoroutineId::next(),
            frame: std::cell::UnsafeCell::new(frame),
            stack,
            args,
            entry,
            location: location.into(),
            state: AtomicCoroutineState::new(CoroutineState::Created),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn entry(&self) -> EntryFn {
        self.entry
    }

    /// Raw pointer to the coroutine's register frame. Valid only while this
    /// `Coroutine` is alive; used by `restore` and the preemption handler.
    pub fn frame_ptr(&self) -> *mut RegisterFrame {
        self.frame.get()
    }

    /// Number of bytes backing this coroutine's argument blob (diagnostics).
    pub fn arg_bytes(&self) -> usize {
        self.args.len()
    }

    pub fn stack_top(&self) -> *mut u8 {
        self.stack.top()
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state.load())
            .field("arg_bytes", &self.args.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_blob_rejects_unsupported_size() {
        let mut blob = ArgBlob::new();
        assert!(blob.push(1, 1).is_ok());
        let err = blob.push(2, 3).unwrap_err();
        assert_eq!(err, RuntimeError::UnsupportedArgSize { index: 1, size: 3 });
    }

    #[test]
    fn arg_blob_rejects_a_ninth_field() {
        let mut blob = ArgBlob::new();
        for _ in 0..MAX_ARGS {
            blob.push(1, 1).unwrap();
        }
        let err = blob.push(1, 1).unwrap_err();
        assert_eq!(err, RuntimeError::TooManyArgs { max: MAX_ARGS });
        assert_eq!(blob.field_count(), MAX_ARGS);
    }

    #[test]
    fn arg_blob_packs_fields_in_order() {
        let mut blob = ArgBlob::new();
        blob.push(0x11, 1).unwrap();
        blob.push(0x2222, 2).unwrap();
        blob.push(0x33333333, 4).unwrap();
        blob.push(0x4444444444444444, 8).unwrap();
        assert_eq!(blob.field_count(), 4);
        let bytes = blob.into_boxed();
        assert_eq!(bytes.len(), 1 + 2 + 4 + 8);
        assert_eq!(bytes[0], 0x11);
    }

    #[test]
    fn state_transitions_are_observable() {
        let state = AtomicCoroutineState::new(CoroutineState::Created);
        assert_eq!(state.load(), CoroutineState::Created);
        assert!(state.compare_exchange(CoroutineState::Created, CoroutineState::Runnable));
        assert_eq!(state.load(), CoroutineState::Runnable);
        assert!(!state.compare_exchange(CoroutineState::Created, CoroutineState::Running));
    }

    extern "C" fn immediately_returns(_: *const u8) -> *mut u8 {
        std::ptr::null_mut()
    }

    #[test]
    fn create_sets_created_state_and_entry_frame() {
        let blob = ArgBlob::new();
        let co = Coroutine::create("test:create", immediately_returns, blob);
        assert_eq!(co.state.load(), CoroutineState::Created);
        unsafe {
            let frame = &*co.frame_ptr();
            assert_eq!(frame.rip, immediately_returns as usize as u64);
            assert_eq!(frame.rdi, 0);
        }
    }

    #[test]
    fn create_installs_exit_trampoline_as_return_address() {
        let blob = ArgBlob::new();
        let co = Coroutine::create("test:trampoline", immediately_returns, blob);
        unsafe {
            let frame = &*co.frame_ptr();
            let ret_addr = *(frame.rsp as *const u64);
            assert_eq!(ret_addr, exit_trampoline as usize as u64);
        }
    }
}
