//! FerriteOS kernel library
//!
//! Core of a 32-bit x86 kernel: physical and virtual memory management,
//! slab object caches, a preemptive priority-weighted scheduler, the
//! int 0x80 syscall surface, and a FAT12 file system over a RAM volume.
//!
//! The library is `no_std`; on bare metal (`target_os = "none"`) it owns
//! the global heap, while host builds link `std` so the standard `#[test]`
//! harness exercises every architecture-neutral path.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86", target_os = "none"),
    feature(alloc_error_handler)
)]

extern crate alloc;

// Bare metal: the kernel heap backs `alloc` collections.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target: use the system allocator so unit tests allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod process;
pub mod slab;
pub mod sync;
pub mod syscall;


// Re-exports for the binary and for tests
pub use error::{FsError, KernelError};
pub use mm::{FrameNumber, MemoryRegion, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

/// Test support shared across modules: a one-time arena behind the global
/// frame allocator so paths that go through `FRAME_ALLOCATOR` (kernel
/// stacks, kmalloc) have real frames on the host.
#[cfg(test)]
pub(crate) mod testing {
    use spin::Once;

    static INIT: Once<()> = Once::new();

    pub fn init_test_pmm() {
        INIT.call_once(|| {
            let frames = 4096; // 16 MiB arena
            let buf = alloc::vec![0u8; (frames + 1) * crate::mm::FRAME_SIZE].leak();
            let base = (buf.as_ptr() as usize).next_multiple_of(crate::mm::FRAME_SIZE);
            crate::mm::FRAME_ALLOCATOR
                .lock()
                .init(crate::mm::PhysicalAddress::new(base), frames);
        });
    }
}
