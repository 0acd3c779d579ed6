//! x86_64 context switching implementation
//!
//! System V AMD64: callee-saved registers only, since a voluntary switch
//! is a function call and the compiler already spilled everything else.
//! One pointer-sized payload crosses the switch in RAX.

use std::arch::naked_asm;

/// Callee-saved register block
///
/// Field order is load-bearing: the assembly below addresses the block
/// with fixed offsets.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `regs` so the first switch into it enters `entry_fn(entry_arg,
/// payload)` on the given stack
///
/// # Safety
///
/// `regs` must be valid and `stack_top` must point at the high end of a
/// live, writable stack.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // The trampoline is entered by jump, not call, so leave the stack
    // 16-aligned: its own `call` then produces the entry alignment the
    // ABI expects
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First-entry trampoline: forwards the stashed argument and the
/// incoming payload to the entry function
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13", // entry argument
        "mov rsi, rax", // payload carried by the switch
        "call r12",
        // The entry function must switch away instead of returning
        "ud2",
    );
}

/// Switch from `old` to `new`, carrying `payload` across
///
/// Saves the callee-saved state into `old` and restores `new`; the value
/// returned is the payload supplied by whoever later switches back into
/// `old`.
///
/// # Safety
///
/// Both register blocks must be valid; `new` must describe a live context
/// created by [`init_context`] or a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _old: *mut SavedRegs,
    _new: *const SavedRegs,
    _payload: usize,
) -> usize {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Payload travels across the switch in RAX
        "mov rax, rdx",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rcx, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rcx",
        // Return point for the saved context; RAX holds the payload of
        // whoever switched back here
        "1:",
        "ret",
    );
}
