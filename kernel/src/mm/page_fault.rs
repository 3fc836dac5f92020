//! Page-fault classification and policy.
//!
//! The handler receives the faulting linear address (CR2) and the
//! hardware error code. Not-present faults inside the current process's
//! brk window are resolved by demand allocation; anything else terminates
//! a ring-3 offender or halts the kernel with a diagnostic banner.

use bitflags::bitflags;

use super::{PageFlags, VirtualAddress};

bitflags! {
    /// Hardware page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// Set: protection violation. Clear: not-present page.
        const PROTECTION_VIOLATION = 1 << 0;
        /// Set: write access. Clear: read.
        const CAUSED_BY_WRITE = 1 << 1;
        /// Set: fault taken in ring 3.
        const USER_MODE = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED_BITS = 1 << 3;
        /// The fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// What the fault handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// Demand allocation satisfied the access; retry the instruction.
    DemandPaged,
    /// Ring-3 offender: terminate the faulting process.
    KillProcess,
    /// Kernel-mode fault with no covering policy: halt.
    Halt,
}

/// Classify a fault against the current process's brk window.
///
/// `brk_window` is `[start, brk)` of the lazily-populated data segment; a
/// not-present access inside it is a demand-allocation candidate.
pub fn classify(
    address: VirtualAddress,
    code: PageFaultErrorCode,
    brk_window: Option<(usize, usize)>,
) -> FaultResolution {
    let not_present = !code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    if not_present && !code.contains(PageFaultErrorCode::RESERVED_BITS) {
        if let Some((start, end)) = brk_window {
            if address.as_usize() >= start && address.as_usize() < end {
                return FaultResolution::DemandPaged;
            }
        }
    }
    if code.contains(PageFaultErrorCode::USER_MODE) {
        FaultResolution::KillProcess
    } else {
        FaultResolution::Halt
    }
}

/// Render the diagnostic banner for a fault that will not be resolved.
pub fn print_banner(address: VirtualAddress, code: PageFaultErrorCode) {
    crate::println!("\n========== PAGE FAULT ==========");
    crate::println!("faulting address: {:#010x}", address.as_usize());
    crate::println!("error code:       {:#010x}", code.bits());
    crate::println!(
        "  [{}] [{}] [{}]{}{}",
        if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            "protection violation"
        } else {
            "non-present page"
        },
        if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            "write"
        } else {
            "read"
        },
        if code.contains(PageFaultErrorCode::USER_MODE) {
            "user mode"
        } else {
            "kernel mode"
        },
        if code.contains(PageFaultErrorCode::RESERVED_BITS) {
            " [reserved bits]"
        } else {
            ""
        },
        if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            " [instruction fetch]"
        } else {
            ""
        },
    );
    crate::println!("================================");
}

/// Entry point from the interrupt stub: resolve or escalate.
///
/// Demand paging maps a fresh zeroed frame at the faulting page with user
/// data permissions, consistent with what an eager `brk` would have built.
pub fn handle(address: VirtualAddress, code: PageFaultErrorCode) -> FaultResolution {
    let brk_window = crate::process::scheduler::current_brk_window();
    let resolution = classify(address, code, brk_window);

    match resolution {
        FaultResolution::DemandPaged => {
            let mapped = crate::sync::without_interrupts(|| {
                let mut alloc = super::FRAME_ALLOCATOR.lock();
                let frame = alloc.alloc_frame()?;
                let mapped = crate::process::scheduler::with_current_space(|space| {
                    space.map_frame(&mut *alloc, frame, address.align_down(), PageFlags::user_data())
                });
                if mapped.is_err() {
                    let _ = alloc.free_frame(frame);
                }
                mapped
            });
            match mapped {
                Ok(()) => FaultResolution::DemandPaged,
                Err(e) => {
                    log::error!("demand paging failed at {:#x}: {}", address.as_usize(), e);
                    print_banner(address, code);
                    if code.contains(PageFaultErrorCode::USER_MODE) {
                        FaultResolution::KillProcess
                    } else {
                        FaultResolution::Halt
                    }
                }
            }
        }
        FaultResolution::KillProcess => {
            print_banner(address, code);
            log::warn!(
                "terminating process for fault at {:#x}",
                address.as_usize()
            );
            FaultResolution::KillProcess
        }
        FaultResolution::Halt => {
            print_banner(address, code);
            FaultResolution::Halt
        }
    }
}
