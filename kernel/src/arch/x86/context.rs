//! The context switch.
//!
//! Contract (mirrored by the stack builders in `process::creation`): the
//! outgoing task pushes the flags word and the eight general-purpose
//! registers onto its kernel stack and stores ESP through `old_sp`; the
//! incoming stack is loaded and unwound in the opposite order, and `ret`
//! lands wherever the incoming stack says. Callers must have already
//! written the incoming kernel-stack top into the TSS and loaded the
//! incoming CR3.

use core::arch::naked_asm;

/// Switch kernel stacks.
///
/// `old_sp` receives the outgoing ESP (pass null when the outgoing record
/// is gone, e.g. the task was just killed). `new_sp` is the incoming
/// task's saved stack pointer.
///
/// # Safety
///
/// `new_sp` must point at a frame built by this routine or by the
/// `process::creation` builders, on a live kernel stack. Interrupts must
/// be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old_sp: *mut usize, new_sp: usize) {
    naked_asm!(
        "pusha",
        "pushf",
        "mov eax, [esp + 40]", // old_sp
        "mov edx, [esp + 44]", // new_sp
        "test eax, eax",
        "jz 2f",
        "mov [eax], esp",
        "2:",
        "mov esp, edx",
        "popf",
        "popa",
        "ret",
    );
}
