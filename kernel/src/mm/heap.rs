//! Kernel heap region.
//!
//! A fixed 1 MiB window at the 2 MiB mark, inside the low region the frame
//! allocator reserves at init, is handed to the `linked_list_allocator`
//! global heap. Typed object churn goes through the slab caches instead;
//! the heap backs `alloc` collections (process table, ready queue, names).

use super::{PhysicalAddress, FRAME_ALLOCATOR};

/// Start of the kernel heap.
pub const HEAP_START: usize = 0x0020_0000;
/// Heap size: 1 MiB.
pub const HEAP_SIZE: usize = 0x0010_0000;

/// Reserve the heap frames and initialize the global allocator over them.
///
/// Must run once, after the frame allocator is initialized and before the
/// first `alloc` use.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    FRAME_ALLOCATOR
        .lock()
        .reserve_region(PhysicalAddress::new(HEAP_START), HEAP_SIZE);
    // SAFETY: the heap window is identity-mapped, reserved in the frame
    // bitmap above, and handed to the allocator exactly once.
    unsafe {
        crate::ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
    log::info!("heap: {} KiB at {:#x}", HEAP_SIZE / 1024, HEAP_START);
}

/// Host builds use the system allocator; only the reservation invariant is
/// kept so the frame bitmap matches bare metal.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() {
    FRAME_ALLOCATOR
        .lock()
        .reserve_region(PhysicalAddress::new(HEAP_START), HEAP_SIZE);
}
