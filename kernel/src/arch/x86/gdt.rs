//! Global descriptor table.
//!
//! Six entries, flat 4 GiB segments with 4 KiB granularity: null, ring-0
//! code (0x08), ring-0 data (0x10), ring-3 code (0x18), ring-3 data
//! (0x20), and the TSS (0x28, installed by the tss module).

const GDT_ENTRIES: usize = 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];

/// Fill one descriptor.
pub fn set_gate(index: usize, base: u32, limit: u32, access: u8, granularity: u8) {
    let entry = GdtEntry {
        limit_low: (limit & 0xFFFF) as u16,
        base_low: (base & 0xFFFF) as u16,
        base_middle: ((base >> 16) & 0xFF) as u8,
        access,
        granularity: (((limit >> 16) & 0x0F) as u8) | (granularity & 0xF0),
        base_high: ((base >> 24) & 0xFF) as u8,
    };
    // SAFETY: the GDT is only mutated during single-threaded boot, before
    // interrupts are enabled.
    unsafe {
        GDT[index] = entry;
    }
}

/// Install the flat descriptors and reload the segment registers.
pub fn init() {
    // Null descriptor stays zero.
    // Kernel code: present, ring 0, code, readable; 4 KiB gran, 32-bit.
    set_gate(1, 0, 0xFFFFF, 0x9A, 0xCF);
    // Kernel data: present, ring 0, data, writable.
    set_gate(2, 0, 0xFFFFF, 0x92, 0xCF);
    // User code: present, ring 3, code, readable.
    set_gate(3, 0, 0xFFFFF, 0xFA, 0xCF);
    // User data: present, ring 3, data, writable.
    set_gate(4, 0, 0xFFFFF, 0xF2, 0xCF);
    // Entry 5 is filled by tss::init().

    let pointer = GdtPointer {
        limit: (core::mem::size_of::<GdtEntry>() * GDT_ENTRIES - 1) as u16,
        base: core::ptr::addr_of!(GDT) as u32,
    };

    // SAFETY: the table above is complete and static; after lgdt the
    // segment registers are reloaded with selectors into that table, and
    // CS is refreshed with a far return.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov ax, 0x10",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push 0x08",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            ptr = in(reg) &pointer,
            out("eax") _,
        );
    }
    log::info!("gdt: flat segments loaded");
}
