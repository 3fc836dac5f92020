//! Bare-metal x86 (32-bit protected mode) support.
//!
//! Everything in this tree touches hardware: descriptor tables, the TSS,
//! the PIC/PIT, VGA text memory, port I/O, and the assembly seams (context
//! switch, interrupt stubs, ring-3 entry). The rest of the kernel reaches
//! these only through the contracts in `arch::context` and the scheduler's
//! switch protocol.

pub mod boot;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod port;
pub mod timer;
pub mod trap;
pub mod tss;
pub mod usermode;
pub mod vga;

/// Bring up the CPU tables and the timer. Interrupts stay disabled until
/// the caller is ready.
pub fn init() {
    gdt::init();
    tss::init();
    idt::init();
    timer::init(100);
}

/// Enable interrupts once the kernel is ready to take them.
pub fn enable_interrupts() {
    // SAFETY: the IDT and PIC are programmed before this is called.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}
