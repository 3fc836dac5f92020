//! Virtual memory manager.
//!
//! Each [`AddressSpace`] owns a page directory frame plus the table frames
//! installed under it. Kernel-range directory entries (the upper quarter,
//! indices 768..1024) are shared across every address space and must stay
//! identical by value; user-range mappings belong to exactly one space.
//!
//! Cloning deep-copies user mappings so a child's writes can never alter
//! the parent. Non-user low mappings (the boot identity window) are shared
//! verbatim; ring 3 cannot reach them.

use spin::Mutex;

use super::{
    frame_allocator::FrameSource,
    page_table::{PageFlags, PageTable, PageTableEntry, PAGE_TABLE_ENTRIES},
    FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE, KERNEL_SPACE_START,
};
use crate::error::KernelError;

/// First directory index of the shared kernel range.
pub const KERNEL_DIR_INDEX: usize = KERNEL_SPACE_START >> 22;

/// A page directory and the user mappings hanging off it.
pub struct AddressSpace {
    directory: FrameNumber,
    phys_base: PhysicalAddress,
}

impl AddressSpace {
    /// Allocate and zero a fresh directory.
    pub fn new(alloc: &mut impl FrameSource) -> Result<Self, KernelError> {
        let directory = alloc.alloc_frame()?;
        let phys_base = alloc.frame_address(FrameNumber::new(0));
        let space = Self {
            directory,
            phys_base,
        };
        // SAFETY: the frame was just allocated for this directory and is
        // addressable through the managed region.
        unsafe { (*space.table_ptr(directory)).zero() };
        Ok(space)
    }

    /// The physical address to load into CR3.
    pub fn directory_address(&self) -> PhysicalAddress {
        self.frame_address(self.directory)
    }

    pub fn directory_frame(&self) -> FrameNumber {
        self.directory
    }

    fn frame_address(&self, frame: FrameNumber) -> PhysicalAddress {
        self.phys_base.offset(frame.as_usize() * FRAME_SIZE)
    }

    fn table_ptr(&self, frame: FrameNumber) -> *mut PageTable {
        self.frame_address(frame).as_mut_ptr::<PageTable>()
    }

    fn phys_to_frame(&self, phys: PhysicalAddress) -> Result<FrameNumber, KernelError> {
        if phys.as_usize() < self.phys_base.as_usize() || !phys.is_frame_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(FrameNumber::new(
            (phys.as_usize() - self.phys_base.as_usize()) / FRAME_SIZE,
        ))
    }

    /// Map `virt -> phys` with the given permissions, allocating the page
    /// table on demand. A user mapping propagates USER up to the directory
    /// entry, since the hardware walk requires user access at every level.
    pub fn map(
        &mut self,
        alloc: &mut impl FrameSource,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        let frame = self.phys_to_frame(phys)?;
        self.map_frame(alloc, frame, virt, flags)
    }

    /// Like [`map`](Self::map) but takes the frame index directly.
    pub fn map_frame(
        &mut self,
        alloc: &mut impl FrameSource,
        frame: FrameNumber,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        let dir_index = virt.directory_index();
        let table_index = virt.table_index();
        let user = flags.contains(PageFlags::USER);

        // SAFETY: the directory frame is owned by this space.
        let directory = unsafe { &mut *self.table_ptr(self.directory) };

        let table_frame = if directory[dir_index].is_present() {
            if user {
                directory[dir_index].add_flags(PageFlags::USER);
            }
            directory[dir_index].frame().ok_or(KernelError::Fault)?
        } else {
            let table_frame = alloc.alloc_frame()?;
            // SAFETY: freshly allocated table frame, addressable via the
            // managed region.
            unsafe { (*self.table_ptr(table_frame)).zero() };
            let mut table_flags = PageFlags::table_default();
            if user {
                table_flags |= PageFlags::USER;
            }
            directory[dir_index] = PageTableEntry::new(table_frame, table_flags);
            table_frame
        };

        // SAFETY: table_frame is a live page table of this space.
        let table = unsafe { &mut *self.table_ptr(table_frame) };
        table[table_index] = PageTableEntry::new(frame, flags | PageFlags::PRESENT);

        crate::arch::flush_tlb_entry(virt);
        Ok(())
    }

    /// Remove the mapping for `virt`. The backing frame is not freed; the
    /// caller owns it.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Result<(), KernelError> {
        let dir_index = virt.directory_index();
        let table_index = virt.table_index();

        // SAFETY: the directory frame is owned by this space.
        let directory = unsafe { &mut *self.table_ptr(self.directory) };
        let entry = directory[dir_index];
        if !entry.is_present() {
            return Err(KernelError::NotFound);
        }
        let table_frame = entry.frame().ok_or(KernelError::Fault)?;
        // SAFETY: present directory entries of this space point at live
        // tables.
        let table = unsafe { &mut *self.table_ptr(table_frame) };
        if !table[table_index].is_present() {
            return Err(KernelError::NotFound);
        }
        table[table_index].clear();

        crate::arch::flush_tlb_entry(virt);
        Ok(())
    }

    /// Walk the tables; `Some(phys + page offset)` if `virt` is mapped.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        // SAFETY: the directory frame is owned by this space.
        let directory = unsafe { &*self.table_ptr(self.directory) };
        let entry = directory[virt.directory_index()];
        if !entry.is_present() {
            return None;
        }
        // SAFETY: present directory entries point at live tables.
        let table = unsafe { &*self.table_ptr(entry.frame()?) };
        let leaf = table[virt.table_index()];
        let frame = leaf.frame()?;
        Some(self.frame_address(frame).offset(virt.page_offset()))
    }

    /// The flags on the leaf entry for `virt`, if mapped.
    pub fn mapping_flags(&self, virt: VirtualAddress) -> Option<PageFlags> {
        // SAFETY: as in translate().
        let directory = unsafe { &*self.table_ptr(self.directory) };
        let entry = directory[virt.directory_index()];
        if !entry.is_present() {
            return None;
        }
        // SAFETY: present directory entries point at live tables.
        let table = unsafe { &*self.table_ptr(entry.frame()?) };
        let leaf = table[virt.table_index()];
        leaf.is_present().then(|| leaf.flags())
    }

    /// Clone this space: kernel-range entries verbatim, user mappings
    /// deep-copied into freshly allocated frames.
    pub fn clone_space(&self, alloc: &mut impl FrameSource) -> Result<Self, KernelError> {
        let child = Self::new(alloc)?;
        // SAFETY: both directory frames are live and distinct.
        let src_dir = unsafe { &*self.table_ptr(self.directory) };
        let dst_dir = unsafe { &mut *child.table_ptr(child.directory) };

        for index in KERNEL_DIR_INDEX..PAGE_TABLE_ENTRIES {
            dst_dir[index] = src_dir[index];
        }

        for index in 0..KERNEL_DIR_INDEX {
            let pde = src_dir[index];
            if !pde.is_present() {
                continue;
            }
            if !pde.is_user() {
                // Kernel-only low mapping (boot identity window): shared.
                dst_dir[index] = pde;
                continue;
            }

            let src_table_frame = pde.frame().ok_or(KernelError::Fault)?;
            let dst_table_frame = alloc.alloc_frame()?;
            // SAFETY: freshly allocated table frame.
            unsafe { (*child.table_ptr(dst_table_frame)).zero() };
            // SAFETY: both table frames are live and distinct.
            let src_table = unsafe { &*self.table_ptr(src_table_frame) };
            let dst_table = unsafe { &mut *child.table_ptr(dst_table_frame) };

            for slot in 0..PAGE_TABLE_ENTRIES {
                let pte = src_table[slot];
                if !pte.is_present() {
                    continue;
                }
                if !pte.is_user() {
                    dst_table[slot] = pte;
                    continue;
                }
                let src_frame = pte.frame().ok_or(KernelError::Fault)?;
                let dst_frame = alloc.alloc_frame()?;
                // SAFETY: source frame is a live user page of this space,
                // destination was just allocated; both are frame-sized.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.frame_address(src_frame).as_ptr::<u8>(),
                        child.frame_address(dst_frame).as_mut_ptr::<u8>(),
                        FRAME_SIZE,
                    );
                }
                dst_table[slot] = PageTableEntry::new(dst_frame, pte.flags());
            }

            dst_dir[index] = PageTableEntry::new(dst_table_frame, pde.flags());
        }

        Ok(child)
    }

    /// Release every user frame, user table, and the directory itself.
    /// Shared kernel entries are left alone.
    pub fn destroy(self, alloc: &mut impl FrameSource) -> Result<(), KernelError> {
        // SAFETY: the directory frame is owned by this space until freed
        // below.
        let directory = unsafe { &*self.table_ptr(self.directory) };
        for index in 0..KERNEL_DIR_INDEX {
            let pde = directory[index];
            if !pde.is_present() || !pde.is_user() {
                continue;
            }
            let table_frame = pde.frame().ok_or(KernelError::Fault)?;
            // SAFETY: present user directory entries point at tables owned
            // by this space.
            let table = unsafe { &*self.table_ptr(table_frame) };
            for slot in 0..PAGE_TABLE_ENTRIES {
                let pte = table[slot];
                if pte.is_present() && pte.is_user() {
                    if let Some(frame) = pte.frame() {
                        alloc.free_frame(frame)?;
                    }
                }
            }
            alloc.free_frame(table_frame)?;
        }
        alloc.free_frame(self.directory)?;
        Ok(())
    }

    /// Load this directory into CR3.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn switch(&self) {
        let cr3 = self.directory_address().as_usize();
        // SAFETY: the directory is a valid, zero-based physical page
        // directory; loading CR3 is the defined way to activate it.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack));
        }
    }
}

/// The kernel's address space: the template every user space is cloned
/// from. Its upper-quarter entries are the ones shared system-wide.
pub static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Build the kernel space: identity-map the low window (kernel image,
/// heap, page tables, ramdisk) and mirror it into the upper quarter so
/// kernel virtual addresses resolve in every address space.
pub fn init_kernel_space(
    alloc: &mut impl FrameSource,
    identity_limit: usize,
) -> Result<(), KernelError> {
    let mut space = AddressSpace::new(alloc)?;
    for addr in (0..identity_limit).step_by(FRAME_SIZE) {
        let frame = FrameNumber::new(addr / FRAME_SIZE);
        space.map_frame(
            alloc,
            frame,
            VirtualAddress::new(addr),
            PageFlags::kernel_data(),
        )?;
        space.map_frame(
            alloc,
            frame,
            VirtualAddress::new(KERNEL_SPACE_START + addr),
            PageFlags::kernel_data(),
        )?;
    }
    log::info!(
        "vmm: kernel space built, identity window {} MiB",
        identity_limit / (1024 * 1024)
    );
    *KERNEL_SPACE.lock() = Some(space);
    Ok(())
}

/// Load the kernel directory and turn paging on.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn activate_kernel_space() {
    let guard = KERNEL_SPACE.lock();
    let space = guard.as_ref().expect("kernel space not built");
    space.switch();
    // SAFETY: the directory just loaded identity-maps the executing code,
    // so setting CR0.PG keeps the instruction stream valid.
    unsafe {
        core::arch::asm!(
            "mov eax, cr0",
            "or eax, 0x80000000",
            "mov cr0, eax",
            out("eax") _,
            options(nostack),
        );
    }
    log::info!("vmm: paging enabled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::arena_allocator;
    use crate::mm::PageFlags;

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut alloc = arena_allocator(32);
        let mut space = AddressSpace::new(&mut alloc).unwrap();
        let frame = alloc.alloc_frame().unwrap();
        let phys = alloc.frame_address(frame);
        let virt = VirtualAddress::new(0x4000_0000);

        space
            .map(&mut alloc, phys, virt, PageFlags::user_data())
            .unwrap();
        assert_eq!(
            space.translate(VirtualAddress::new(0x4000_0123)),
            Some(phys.offset(0x123))
        );

        space.unmap(virt).unwrap();
        assert_eq!(space.translate(virt), None);
        assert_eq!(space.unmap(virt), Err(KernelError::NotFound));
    }

    #[test]
    fn user_flag_propagates_to_directory_entry() {
        let mut alloc = arena_allocator(32);
        let mut space = AddressSpace::new(&mut alloc).unwrap();
        let frame = alloc.alloc_frame().unwrap();
        let virt_kernel = VirtualAddress::new(0x0000_0000);
        let virt_user = VirtualAddress::new(0x0000_1000);

        // Kernel mapping first: directory entry must not be user.
        space
            .map_frame(&mut alloc, frame, virt_kernel, PageFlags::kernel_data())
            .unwrap();
        // SAFETY: test-local space, directory freshly built.
        let dir = unsafe { &*space.table_ptr(space.directory_frame()) };
        assert!(!dir[0].is_user());

        // A user mapping through the same table upgrades the entry.
        space
            .map_frame(&mut alloc, frame, virt_user, PageFlags::user_data())
            .unwrap();
        let dir = unsafe { &*space.table_ptr(space.directory_frame()) };
        assert!(dir[0].is_user());
    }

    #[test]
    fn clone_shares_kernel_range_verbatim() {
        let mut alloc = arena_allocator(64);
        let mut parent = AddressSpace::new(&mut alloc).unwrap();
        let frame = alloc.alloc_frame().unwrap();
        parent
            .map_frame(
                &mut alloc,
                frame,
                VirtualAddress::new(KERNEL_SPACE_START),
                PageFlags::kernel_data(),
            )
            .unwrap();

        let child = parent.clone_space(&mut alloc).unwrap();
        // SAFETY: both directories are live test-local frames.
        let p = unsafe { &*parent.table_ptr(parent.directory_frame()) };
        let c = unsafe { &*child.table_ptr(child.directory_frame()) };
        for i in KERNEL_DIR_INDEX..PAGE_TABLE_ENTRIES {
            assert_eq!(p[i], c[i], "kernel directory entry {} differs", i);
        }
    }

    #[test]
    fn clone_deep_copies_user_pages() {
        let mut alloc = arena_allocator(64);
        let mut parent = AddressSpace::new(&mut alloc).unwrap();
        let frame = alloc.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x0040_0000);
        parent
            .map_frame(&mut alloc, frame, virt, PageFlags::user_data())
            .unwrap();

        let parent_phys = parent.translate(virt).unwrap();
        // SAFETY: the page is backed by the test arena.
        unsafe { *parent_phys.as_mut_ptr::<u8>() = 0xAB };

        let child = parent.clone_space(&mut alloc).unwrap();
        let child_phys = child.translate(virt).unwrap();
        assert_ne!(parent_phys, child_phys, "child must not alias the parent");
        // SAFETY: both pages are backed by the test arena.
        unsafe {
            assert_eq!(*child_phys.as_ptr::<u8>(), 0xAB);
            *child_phys.as_mut_ptr::<u8>() = 0xCD;
            assert_eq!(*parent_phys.as_ptr::<u8>(), 0xAB, "parent page changed");
        }
    }

    #[test]
    fn destroy_returns_user_frames() {
        let mut alloc = arena_allocator(64);
        let before = alloc.stats().used_frames;
        let mut space = AddressSpace::new(&mut alloc).unwrap();
        for i in 0..4 {
            let frame = alloc.alloc_frame().unwrap();
            space
                .map_frame(
                    &mut alloc,
                    frame,
                    VirtualAddress::new(0x0040_0000 + i * FRAME_SIZE),
                    PageFlags::user_data(),
                )
                .unwrap();
        }
        assert!(alloc.stats().used_frames > before);
        space.destroy(&mut alloc).unwrap();
        assert_eq!(alloc.stats().used_frames, before);
    }
}
