//! Architecture layer.
//!
//! `context` holds the trap-frame layout and segment-selector constants:
//! pure data contracts shared with the scheduler and syscall dispatcher.
//! Everything that touches hardware (descriptor tables, port I/O, the
//! context-switch and ring-transition assembly) lives in `x86` and is
//! compiled only for bare-metal x86 builds; thin no-op shims keep the rest
//! of the kernel architecture-neutral and host-testable.

pub mod context;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

use crate::mm::VirtualAddress;

/// Invalidate the TLB entry covering `virt`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn flush_tlb_entry(virt: VirtualAddress) {
    // SAFETY: invlpg only drops a TLB entry; it cannot fault.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_usize(), options(nostack));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn flush_tlb_entry(_virt: VirtualAddress) {}

/// Stop the CPU until the next interrupt.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn halt() {
    // SAFETY: hlt with interrupts enabled resumes on the next interrupt.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn halt() {
    core::hint::spin_loop();
}

/// Halt forever; terminal error path.
pub fn halt_loop() -> ! {
    loop {
        halt();
    }
}
