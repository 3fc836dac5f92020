//! Process model.
//!
//! A [`Process`] record carries everything the scheduler, the syscall
//! layer, and the fault handler need: identity, run state, the saved
//! kernel-stack pointer the switch routine consumes, the address space,
//! accounting, signals, the fd table, and the brk window.

pub mod creation;
pub mod scheduler;
pub mod signal;

use alloc::string::String;

use crate::error::KernelError;
use crate::fs::ShortName;
use crate::mm::{
    AddressSpace, FrameSource, PageFlags, VirtualAddress, FRAME_SIZE, PAGE_SIZE, USER_BRK_BASE,
    USER_BRK_LIMIT, USER_CODE_BASE, USER_STACK_TOP,
};

/// Per-process file descriptor slots.
pub const MAX_FDS: usize = 16;

/// Kernel stack size: two frames.
pub const KERNEL_STACK_SIZE: usize = 2 * FRAME_SIZE;

/// Number of signals.
pub const NSIG: usize = 32;

/// Signal numbers (POSIX-shaped).
pub mod sig {
    pub const SIGHUP: u32 = 1;
    pub const SIGINT: u32 = 2;
    pub const SIGQUIT: u32 = 3;
    pub const SIGILL: u32 = 4;
    pub const SIGABRT: u32 = 6;
    pub const SIGKILL: u32 = 9;
    pub const SIGSEGV: u32 = 11;
    pub const SIGTERM: u32 = 15;
    pub const SIGCHLD: u32 = 17;
    pub const SIGCONT: u32 = 18;
    pub const SIGSTOP: u32 = 19;
}

/// Process ID. Pid 0 is the initial kernel task and is never reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// On the ready queue, waiting for the CPU
    Ready,
    /// Owns the CPU; at most one process at any instant
    Running,
    /// Off the ready queue, waiting for an event
    Blocked,
    /// Exited or killed; kept until the parent reaps it
    Terminated,
}

/// What happens when a pending signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Default,
    Ignore,
    /// User handler entry point. Cross-ring delivery is not performed;
    /// the pending bit is still consumed.
    Handler(usize),
}

/// An open file: canonical 8.3 name plus a cursor.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub name: ShortName,
    pub pos: usize,
    pub flags: u32,
}

/// A kernel stack owned by one process, allocated through the kmalloc
/// fall-through (contiguous frames).
pub struct KernelStack {
    base: usize,
    size: usize,
}

impl KernelStack {
    pub fn alloc() -> Result<Self, KernelError> {
        let base = crate::slab::kmalloc(KERNEL_STACK_SIZE)?;
        Ok(Self {
            base,
            size: KERNEL_STACK_SIZE,
        })
    }

    /// The address the TSS ring-0 stack pointer is loaded with.
    pub const fn top(&self) -> usize {
        self.base + self.size
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Copy the whole stack contents from another stack (fork).
    pub fn copy_from(&mut self, other: &KernelStack) {
        debug_assert_eq!(self.size, other.size);
        // SAFETY: both regions are live kmalloc allocations of equal size.
        unsafe {
            core::ptr::copy_nonoverlapping(
                other.base as *const u8,
                self.base as *mut u8,
                self.size,
            );
        }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let _ = crate::slab::kfree(self.base, self.size);
    }
}

/// The process control block.
pub struct Process {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: ProcessState,
    /// 0..=255; only the slice length depends on it
    pub priority: u8,
    /// Remaining ticks in the current slice
    pub time_slice: u32,
    /// Total ticks this process has run
    pub total_runtime: u64,
    pub kernel_stack: KernelStack,
    /// Where the switch routine finds the callee-saved frame.
    /// Valid exactly when the process is not Running.
    pub stack_ptr: usize,
    /// None for kernel tasks sharing the kernel directory
    pub space: Option<AddressSpace>,
    pub pending_signals: u32,
    pub signal_dispositions: [SignalDisposition; NSIG],
    pub exit_status: i32,
    /// Pid the process is blocked in waitpid on
    pub waiting_for: Option<ProcessId>,
    pub brk_start: usize,
    pub brk: usize,
    pub files: [Option<OpenFile>; MAX_FDS],
}

impl Process {
    pub fn new(pid: ProcessId, name: &str, priority: u8) -> Result<Self, KernelError> {
        Ok(Self {
            pid,
            parent: None,
            name: String::from(name),
            state: ProcessState::Ready,
            priority,
            time_slice: scheduler::time_slice_for(priority),
            total_runtime: 0,
            kernel_stack: KernelStack::alloc()?,
            stack_ptr: 0,
            space: None,
            pending_signals: 0,
            signal_dispositions: [SignalDisposition::Default; NSIG],
            exit_status: 0,
            waiting_for: None,
            brk_start: USER_BRK_BASE,
            brk: USER_BRK_BASE,
            files: [None; MAX_FDS],
        })
    }

    /// Lowest free descriptor, or `EMFILE`-shaped failure.
    pub fn fd_alloc(&mut self, file: OpenFile) -> Result<usize, KernelError> {
        // 0..2 are stdin/stdout/stderr
        for fd in 3..MAX_FDS {
            if self.files[fd].is_none() {
                self.files[fd] = Some(file);
                return Ok(fd);
            }
        }
        Err(KernelError::Busy)
    }

    pub fn fd_get(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.files.get_mut(fd).and_then(|f| f.as_mut())
    }

    pub fn fd_close(&mut self, fd: usize) -> Result<(), KernelError> {
        if fd < 3 || fd >= MAX_FDS || self.files[fd].is_none() {
            return Err(KernelError::InvalidArgument);
        }
        self.files[fd] = None;
        Ok(())
    }

    /// Pages currently backing `[brk_start, brk)`.
    fn brk_pages(&self) -> usize {
        (self.brk - self.brk_start).div_ceil(PAGE_SIZE)
    }

    /// Unmap a user page and hand its frame back. No-op for holes and for
    /// shared kernel mappings.
    fn release_user_page(
        space: &mut AddressSpace,
        alloc: &mut impl FrameSource,
        virt: VirtualAddress,
    ) -> Result<(), KernelError> {
        let is_user = space
            .mapping_flags(virt)
            .map(|f| f.contains(PageFlags::USER))
            .unwrap_or(false);
        if !is_user {
            return Ok(());
        }
        if let Some(phys) = space.translate(virt) {
            let base = alloc.frame_address(crate::mm::FrameNumber::new(0)).as_usize();
            let frame = crate::mm::FrameNumber::new((phys.as_usize() - base) / FRAME_SIZE);
            space.unmap(virt)?;
            alloc.free_frame(frame)?;
        }
        Ok(())
    }

    /// Move the data-segment end. Growth maps fresh zeroed frames eagerly;
    /// shrinking unmaps and frees. `0` queries the current break.
    pub fn set_brk(
        &mut self,
        alloc: &mut impl FrameSource,
        new_brk: usize,
    ) -> Result<usize, KernelError> {
        if new_brk == 0 {
            return Ok(self.brk);
        }
        if new_brk < self.brk_start || new_brk > USER_BRK_LIMIT {
            return Err(KernelError::InvalidArgument);
        }
        let brk_start = self.brk_start;
        let old_pages = self.brk_pages();
        let new_pages = (new_brk - brk_start).div_ceil(PAGE_SIZE);
        let space = self.space.as_mut().ok_or(KernelError::InvalidArgument)?;

        if new_pages > old_pages {
            for page in old_pages..new_pages {
                let frame = alloc.alloc_frame()?;
                let virt = VirtualAddress::new(brk_start + page * PAGE_SIZE);
                // SAFETY: freshly allocated frame, zeroed before it
                // becomes user-visible.
                unsafe {
                    core::ptr::write_bytes(
                        alloc.frame_address(frame).as_mut_ptr::<u8>(),
                        0,
                        FRAME_SIZE,
                    );
                }
                space.map_frame(alloc, frame, virt, PageFlags::user_data())?;
            }
        } else {
            for page in new_pages..old_pages {
                let virt = VirtualAddress::new(brk_start + page * PAGE_SIZE);
                Self::release_user_page(space, alloc, virt)?;
            }
        }

        self.brk = new_brk;
        Ok(new_brk)
    }

    /// Replace the user image: map `image` at the user code base, give the
    /// task a fresh stack page, and reset the break. Returns
    /// `(entry, user_stack_top)` for the trap-frame rewrite.
    pub fn exec_image(
        &mut self,
        alloc: &mut impl FrameSource,
        image: &[u8],
    ) -> Result<(usize, usize), KernelError> {
        if image.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        // Drop the old data segment first so its frames can back the image.
        self.set_brk(alloc, self.brk_start)?;

        let space = self.space.as_mut().ok_or(KernelError::InvalidArgument)?;

        let pages = image.len().div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let off = page * PAGE_SIZE;
            let virt = VirtualAddress::new(USER_CODE_BASE + off);
            // A previous image (fork then exec) may still own this page.
            Self::release_user_page(space, alloc, virt)?;

            let frame = alloc.alloc_frame()?;
            let dst = alloc.frame_address(frame).as_mut_ptr::<u8>();
            let chunk = (image.len() - off).min(PAGE_SIZE);
            // SAFETY: destination is a whole freshly allocated frame.
            unsafe {
                core::ptr::copy_nonoverlapping(image.as_ptr().add(off), dst, chunk);
                core::ptr::write_bytes(dst.add(chunk), 0, PAGE_SIZE - chunk);
            }
            space.map_frame(alloc, frame, virt, PageFlags::user_data())?;
        }

        Self::release_user_page(space, alloc, VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE))?;
        let stack_frame = alloc.alloc_frame()?;
        // SAFETY: fresh frame, zeroed before it becomes the user stack.
        unsafe {
            core::ptr::write_bytes(
                alloc.frame_address(stack_frame).as_mut_ptr::<u8>(),
                0,
                FRAME_SIZE,
            );
        }
        space.map_frame(
            alloc,
            stack_frame,
            VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE),
            PageFlags::user_data(),
        )?;

        Ok((USER_CODE_BASE, USER_STACK_TOP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::arena_allocator;
    use crate::mm::AddressSpace;

    #[test]
    fn brk_grows_and_shrinks_with_frames() {
        crate::testing::init_test_pmm();
        let mut alloc = arena_allocator(64);
        let mut p = Process::new(ProcessId(5), "brk-test", 0).unwrap();
        p.space = Some(AddressSpace::new(&mut alloc).unwrap());

        assert_eq!(p.set_brk(&mut alloc, 0).unwrap(), USER_BRK_BASE);

        let used_before = alloc.stats().used_frames;
        let new_brk = USER_BRK_BASE + 3 * PAGE_SIZE + 10;
        assert_eq!(p.set_brk(&mut alloc, new_brk).unwrap(), new_brk);
        assert_eq!(alloc.stats().used_frames, used_before + 4);

        // The mapped pages translate and are user-accessible.
        let space = p.space.as_ref().unwrap();
        let flags = space
            .mapping_flags(VirtualAddress::new(USER_BRK_BASE + 2 * PAGE_SIZE))
            .unwrap();
        assert!(flags.contains(PageFlags::USER));

        assert_eq!(p.set_brk(&mut alloc, USER_BRK_BASE).unwrap(), USER_BRK_BASE);
        assert_eq!(alloc.stats().used_frames, used_before);
    }

    #[test]
    fn brk_outside_window_is_rejected() {
        crate::testing::init_test_pmm();
        let mut alloc = arena_allocator(16);
        let mut p = Process::new(ProcessId(6), "brk-bad", 0).unwrap();
        p.space = Some(AddressSpace::new(&mut alloc).unwrap());
        assert!(p.set_brk(&mut alloc, USER_BRK_BASE - 1).is_err());
        assert!(p.set_brk(&mut alloc, USER_BRK_LIMIT + 1).is_err());
    }

    #[test]
    fn exec_image_maps_code_and_stack() {
        crate::testing::init_test_pmm();
        let mut alloc = arena_allocator(64);
        let mut p = Process::new(ProcessId(7), "exec-test", 0).unwrap();
        p.space = Some(AddressSpace::new(&mut alloc).unwrap());

        let image = alloc::vec![0x90u8; PAGE_SIZE + 100];
        let (entry, user_sp) = p.exec_image(&mut alloc, &image).unwrap();
        assert_eq!(entry, USER_CODE_BASE);
        assert_eq!(user_sp, USER_STACK_TOP);

        let space = p.space.as_ref().unwrap();
        let code = space.translate(VirtualAddress::new(USER_CODE_BASE)).unwrap();
        // SAFETY: backed by the test arena.
        unsafe {
            assert_eq!(*code.as_ptr::<u8>(), 0x90);
        }
        // Tail of the last page is zero-padded.
        let tail = space
            .translate(VirtualAddress::new(USER_CODE_BASE + PAGE_SIZE + 100))
            .unwrap();
        // SAFETY: backed by the test arena.
        unsafe {
            assert_eq!(*tail.as_ptr::<u8>(), 0);
        }
        assert!(space
            .translate(VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE))
            .is_some());
    }

    #[test]
    fn fd_table_allocates_lowest_slot() {
        crate::testing::init_test_pmm();
        let mut p = Process::new(ProcessId(8), "fd-test", 0).unwrap();
        let name = crate::fs::ShortName::parse("A.TXT").unwrap();
        let file = OpenFile {
            name,
            pos: 0,
            flags: 0,
        };
        assert_eq!(p.fd_alloc(file).unwrap(), 3);
        assert_eq!(p.fd_alloc(file).unwrap(), 4);
        p.fd_close(3).unwrap();
        assert_eq!(p.fd_alloc(file).unwrap(), 3);
        assert!(p.fd_close(0).is_err());
    }
}
