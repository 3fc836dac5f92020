//! Boot contract with the loader stage.
//!
//! The kernel gains control in 32-bit protected mode with flat selectors,
//! interrupts disabled, and a BIOS E820-style memory map in low memory:
//! a 16-bit entry count at 0x7000 and 20-byte entries from 0x7004. The
//! FAT12 volume image sits at 0x10000.

use crate::mm::{MemoryRegion, MemoryRegionKind};

const MEMORY_MAP_COUNT_ADDR: usize = 0x7000;
const MEMORY_MAP_ADDR: usize = 0x7004;
const MEMORY_MAP_ENTRY_SIZE: usize = 20;

/// Where the loader placed the FAT12 volume image.
pub const RAMDISK_BASE: usize = 0x10000;
/// 1.44 MiB volume.
pub const RAMDISK_LEN: usize = 1_474_560;

/// E820 type 1 = usable RAM.
const E820_AVAILABLE: u32 = 1;

/// Decode the boot memory map into `buf`; returns the entry count.
///
/// # Safety
///
/// Must only run on bare metal after the loader populated low memory.
pub unsafe fn read_memory_map(buf: &mut [MemoryRegion]) -> usize {
    // SAFETY: the loader wrote the count and entries at these addresses
    // per the boot contract.
    let count = unsafe { core::ptr::read(MEMORY_MAP_COUNT_ADDR as *const u16) } as usize;
    let count = count.min(buf.len());
    for (i, slot) in buf.iter_mut().enumerate().take(count) {
        let entry = MEMORY_MAP_ADDR + i * MEMORY_MAP_ENTRY_SIZE;
        // SAFETY: each entry is 20 bytes: base u64, length u64, type u32.
        let (base, len, kind) = unsafe {
            (
                core::ptr::read_unaligned(entry as *const u64),
                core::ptr::read_unaligned((entry + 8) as *const u64),
                core::ptr::read_unaligned((entry + 16) as *const u32),
            )
        };
        *slot = MemoryRegion {
            start: base,
            len,
            kind: if kind == E820_AVAILABLE {
                MemoryRegionKind::Available
            } else {
                MemoryRegionKind::Reserved
            },
        };
    }
    count
}
