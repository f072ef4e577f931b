//! Register frame and the `restore` context-switch primitive (C1).
//!
//! This is the one part of the runtime that is genuinely architecture-specific.
//! Only x86-64 (System V ABI, Linux) is implemented. The frame's field layout
//! is byte-stable: `restore` reads it by offset from raw assembly, so fields
//! must not be reordered without updating the offsets below.

use std::arch::asm;

/// Number of entries in the x86-64 architectural general-purpose register
/// file that this runtime's frame format is sized against -- not the field
/// count of [`RegisterFrame`] itself, which only carries the subset a
/// context switch actually needs to save/restore.
pub const REGISTERS_COUNT: usize = 31;

/// A fixed-layout snapshot of CPU state: general-purpose registers, the
/// stack pointer, the program counter, and the flags register.
///
/// No component other than [`restore`] and the preemption signal handler may
/// read or write individual fields -- everywhere else this is an opaque
/// handle.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl RegisterFrame {
    /// Build a frame for a freshly created coroutine: `rip` is the entry
    /// point, `rsp` the (already 16-byte-aligned, high-address) top of its
    /// stack, and `rdi` (the first integer argument register per the System V
    /// ABI) a pointer to the coroutine's [`crate::coroutine::ArgBlob`] bytes.
    /// A single pointer is the only register this runtime ever hand-packs;
    /// the entry function reads its typed fields back out of the blob
    /// instead of out of `rsi`/`rdx`/`rcx`/`r8`/`r9`.
    pub fn new_entry(entry: extern "C" fn(*const u8) -> *mut u8, stack_top: *mut u8, arg0: u64) -> Self {
        RegisterFrame {
            rip: entry as usize as u64,
            rsp: stack_top as u64,
            rdi: arg0,
            rflags: 0x200, // IF set; we run in user space so this just mirrors a sane default.
            ..Default::default()
        }
    }
}

/// Restore CPU state from `frame` and resume execution there. Never returns.
///
/// # Safety
///
/// `frame` must describe a valid, live execution context: `rsp` must point
/// into a stack region that is still mapped and exclusively owned by the
/// resuming coroutine, and `rip` must be an address safe to jump to with that
/// stack. The caller's own registers and any locks it holds are abandoned
/// without being unwound -- callers must release locks and drop guards
/// *before* calling `restore`.
///
/// Every field of `RegisterFrame` -- including `r10` and `r11`, which double
/// as scratch during the restore sequence itself -- is reloaded with its true
/// saved value before control reaches `rip`. The landing address is staged on
/// the resumed stack and consumed by `ret` rather than carried in a register,
/// since every integer GPR is already spoken for by the frame it restores;
/// this transiently writes 8 bytes below the resumed `rsp` (its red zone)
/// before `ret`'s pop puts `rsp` back where `frame.rsp` says it belongs.
#[inline(never)]
pub unsafe fn restore(frame: *const RegisterFrame) -> ! {
    unsafe {
        asm!(
            "mov r11, rdi",            // r11 = &frame (base pointer, restored last)

            "mov rax, [r11 + 112]",
            "mov rbx, [r11 + 104]",
            "mov rcx, [r11 + 96]",
            "mov rdx, [r11 + 88]",
            "mov rsi, [r11 + 80]",
            "mov rdi, [r11 + 72]",
            "mov rbp, [r11 + 64]",
            "mov r8,  [r11 + 56]",
            "mov r9,  [r11 + 48]",
            "mov r10, [r11 + 40]",
            "mov r12, [r11 + 24]",
            "mov r13, [r11 + 16]",
            "mov r14, [r11 + 8]",
            "mov r15, [r11 + 0]",

            "push qword ptr [r11 + 120]", // rflags, onto the *current* (soon-to-be-abandoned) stack
            "popfq",

            "mov rsp, [r11 + 128]",       // switch to the resumed coroutine's stack
            "push qword ptr [r11 + 136]", // stage rip just below the new rsp
            "mov r11, [r11 + 32]",        // restore r11's real value last; frame no longer addressable after this

            "ret",                        // pop the staged rip, rsp lands back on frame.rsp

            in("rdi") frame,
            options(noreturn),
        )
    }
}
