//! Ring-3 entry trampolines.
//!
//! Both are return targets for the context switch: the stack above them
//! holds a synthetic frame that `iretd` consumes to cross into ring 3.

use core::arch::naked_asm;

/// First entry into ring 3: load the user data selectors, then pop the
/// `[eip cs eflags esp ss]` block built by the user-task stack builder.
#[unsafe(naked)]
pub extern "C" fn enter_user_mode() {
    naked_asm!(
        "mov ax, 0x23",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "iretd",
    );
}

/// Fork-child resume: replay the copied trap frame (its saved EAX is 0),
/// then return to where the parent took the syscall.
#[unsafe(naked)]
pub extern "C" fn fork_return() {
    naked_asm!(
        "popa",
        "iretd",
    );
}
