//! x86_64 context switching for stackful fibers.
//!
//! Only the callee-saved registers cross a voluntary switch; the System V
//! ABI guarantees everything else is dead at a call boundary.

use std::arch::naked_asm;

/// Callee-saved register file. Field offsets are baked into the assembly
/// below; keep layout and asm in sync.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    pub(crate) fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// Sets up a fresh context so that switching to `regs` enters
/// `entry(arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point at valid memory and `stack_top` one past the end of a
/// live stack allocation.
pub(crate) unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
) {
    // 16-byte alignment per the System V AMD64 ABI, minus the slot a call
    // would have pushed.
    let sp = (stack_top as usize & !0xF) - 8;

    let regs = &mut *regs;
    regs.rsp = sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First frame of every fiber: calls the entry function carried in r12
/// with the argument in r13. The entry never returns; it parks or
/// finishes by switching away.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Saves the current callee-saved state into `save` and resumes from
/// `restore`.
///
/// # Safety
///
/// `restore` must hold a context previously produced by `init_context` or
/// a prior save; both pointers must be valid for the duration of the
/// switch.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _restore: *const SavedRegs) {
    naked_asm!(
        // Save into `save` (rdi).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `restore` (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "1:",
        "ret",
    );
}
