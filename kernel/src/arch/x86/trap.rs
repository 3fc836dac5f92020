//! Interrupt entry stubs and their Rust bodies.
//!
//! Every stub preserves the canonical trap frame: `pusha`, work, `popa`,
//! `iretd`. Vectors with a CPU-pushed error code drop it before returning.
//! The timer stub acknowledges the PIC before scheduling so the controller
//! can latch the next tick during a long slice.

use core::arch::naked_asm;

use super::port::{inb, outb};
use crate::arch::context::TrapFrame;
use crate::mm::page_fault::{self, FaultResolution, PageFaultErrorCode};
use crate::mm::VirtualAddress;
use crate::process::scheduler;

/// Timer interrupt: EOI, then charge the tick.
#[unsafe(naked)]
pub extern "C" fn timer_stub() {
    naked_asm!(
        "pusha",
        "call {handler}",
        "popa",
        "iretd",
        handler = sym timer_isr,
    );
}

extern "C" fn timer_isr() {
    // SAFETY: EOI write to the master PIC command port.
    unsafe { outb(0x20, 0x20) };
    scheduler::on_timer_tick();
}

/// Keyboard interrupt: drain the scancode so the controller can latch the
/// next one. The line discipline lives outside the core.
#[unsafe(naked)]
pub extern "C" fn keyboard_stub() {
    naked_asm!(
        "pusha",
        "call {handler}",
        "popa",
        "iretd",
        handler = sym keyboard_isr,
    );
}

extern "C" fn keyboard_isr() {
    // SAFETY: reading port 0x60 acknowledges the controller.
    let _scancode = unsafe { inb(0x60) };
    // SAFETY: EOI.
    unsafe { outb(0x20, 0x20) };
}

/// Page fault: error code is on the stack, faulting address in CR2.
#[unsafe(naked)]
pub extern "C" fn page_fault_stub() {
    naked_asm!(
        "pusha",
        "mov eax, cr2",
        "mov edx, [esp + 32]", // CPU-pushed error code
        "push eax",            // arg: fault address
        "push edx",            // arg: error code
        "call {handler}",
        "add esp, 8",
        "popa",
        "add esp, 4", // drop the error code
        "iretd",
        handler = sym page_fault_isr,
    );
}

extern "C" fn page_fault_isr(error: u32, address: usize) {
    let code = PageFaultErrorCode::from_bits_truncate(error);
    match page_fault::handle(VirtualAddress::new(address), code) {
        FaultResolution::DemandPaged => {}
        FaultResolution::KillProcess => {
            let decision = crate::sync::without_interrupts(|| {
                let mut sched = scheduler::SCHEDULER.lock();
                let current = sched.current_pid();
                sched.kill(current, -(crate::process::sig::SIGSEGV as i32))
            });
            match decision {
                Ok(d) => scheduler::apply_switch(d),
                // A fault the policy cannot attribute halts the machine.
                Err(_) => crate::arch::halt_loop(),
            }
        }
        FaultResolution::Halt => {
            crate::println!("System halted.");
            crate::arch::halt_loop();
        }
    }
}

/// General protection fault: error code plus the saved CS to tell rings
/// apart.
#[unsafe(naked)]
pub extern "C" fn gpf_stub() {
    naked_asm!(
        "pusha",
        "mov eax, [esp + 32]", // error code
        "mov edx, [esp + 40]", // saved cs
        "push edx",
        "push eax",
        "call {handler}",
        "add esp, 8",
        "popa",
        "add esp, 4",
        "iretd",
        handler = sym gpf_isr,
    );
}

extern "C" fn gpf_isr(error: u32, cs: u32) {
    crate::println!("\n[GPF] general protection fault, error {:#x}", error);
    if cs & 0x3 == 0x3 {
        log::warn!("terminating ring-3 offender");
        let decision = crate::sync::without_interrupts(|| {
            let mut sched = scheduler::SCHEDULER.lock();
            let current = sched.current_pid();
            sched.kill(current, -(crate::process::sig::SIGSEGV as i32))
        });
        if let Ok(d) = decision {
            scheduler::apply_switch(d);
        }
        return;
    }
    crate::println!("System halted.");
    crate::arch::halt_loop();
}

/// Double fault: nothing to recover.
#[unsafe(naked)]
pub extern "C" fn double_fault_stub() {
    naked_asm!(
        "pusha",
        "call {handler}",
        handler = sym double_fault_isr,
    );
}

extern "C" fn double_fault_isr() -> ! {
    crate::println!("\n[DOUBLE FAULT] system panic");
    crate::println!("System halted.");
    crate::arch::halt_loop();
}

/// int 0x80: the dispatcher mutates the saved EAX through the frame.
#[unsafe(naked)]
pub extern "C" fn syscall_stub() {
    naked_asm!(
        "pusha",
        "push esp", // &mut TrapFrame
        "call {handler}",
        "add esp, 4",
        "popa",
        "iretd",
        handler = sym syscall_isr,
    );
}

extern "C" fn syscall_isr(frame: &mut TrapFrame) {
    crate::syscall::dispatch(frame);
}
