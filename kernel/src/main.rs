//! FerriteOS kernel binary.
//!
//! Boot order follows the dependency chain: console first, then CPU
//! tables, the frame allocator from the boot memory map, the heap, paging,
//! multitasking, and finally the FAT12 volume before interrupts go live.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern crate alloc;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel_entry {
    use ferrite_kernel::arch::x86::{self, boot};
    use ferrite_kernel::mm::{self, heap, vmm, FRAME_ALLOCATOR};
    use ferrite_kernel::process::scheduler::SCHEDULER;
    use ferrite_kernel::{fs, logger, println, MemoryRegion, PhysicalAddress};

    /// The identity-mapped low window: kernel image, heap, tables, ramdisk.
    const IDENTITY_WINDOW: usize = 0x0080_0000;

    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        x86::vga::clear();
        logger::init();
        println!("FerriteOS booting...");

        // CPU tables and the PIT; interrupts stay off until the end.
        x86::init();

        // Physical memory from the boot map, with the ramdisk carved out.
        let mut regions = [MemoryRegion {
            start: 0,
            len: 0,
            kind: mm::MemoryRegionKind::Reserved,
        }; 32];
        // SAFETY: the loader populated the map per the boot contract.
        let count = unsafe { boot::read_memory_map(&mut regions) };
        {
            let mut alloc = FRAME_ALLOCATOR.lock();
            alloc.init_from_map(&regions[..count]);
            alloc.reserve_region(
                PhysicalAddress::new(boot::RAMDISK_BASE),
                boot::RAMDISK_LEN,
            );
        }
        heap::init();

        // Paging: identity window plus the shared upper-quarter mirror.
        {
            let mut alloc = FRAME_ALLOCATOR.lock();
            vmm::init_kernel_space(&mut *alloc, IDENTITY_WINDOW).expect("kernel space");
        }
        vmm::activate_kernel_space();

        // Multitasking: the boot flow becomes pid 0.
        SCHEDULER
            .lock()
            .adopt_boot_task("kernel")
            .expect("boot task");

        // The FAT12 volume the loader staged in RAM.
        // SAFETY: the region is reserved above and identity-mapped.
        let ramdisk = unsafe {
            core::slice::from_raw_parts_mut(boot::RAMDISK_BASE as *mut u8, boot::RAMDISK_LEN)
        };
        if let Err(e) = fs::mount_ramdisk(ramdisk) {
            println!("fat12 mount failed: {}", e);
        } else {
            list_volume();
        }

        spawn_init();

        x86::enable_interrupts();
        println!("FerriteOS ready.");

        // Pid 0 idles; the timer preempts into whatever work exists.
        loop {
            ferrite_kernel::arch::halt();
        }
    }

    /// Print the root directory of the mounted volume.
    fn list_volume() {
        let entries = match fs::with_root(|root| root.list_directory()) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        println!("Files on volume:");
        for entry in entries {
            if entry.is_directory {
                println!(" - {}/", entry.name);
            } else {
                println!(" - {} ({} bytes)", entry.name, entry.size);
            }
        }
    }

    /// Launch INIT.BIN from the volume as the first ring-3 task, if the
    /// image exists.
    fn spawn_init() {
        let image = match fs::with_root(|root| {
            let size = root.size("INIT.BIN")?;
            let mut data = alloc::vec![0u8; size];
            root.read("INIT.BIN", &mut data)?;
            Ok(data)
        }) {
            Ok(image) => image,
            Err(_) => {
                println!("no INIT.BIN on the volume; staying in the kernel");
                return;
            }
        };

        let trampoline = x86::usermode::enter_user_mode as usize;
        let result = {
            let mut sched = SCHEDULER.lock();
            let mut alloc = FRAME_ALLOCATOR.lock();
            let template = vmm::KERNEL_SPACE.lock();
            let template = template.as_ref().expect("kernel space");
            sched.spawn_user_task(&mut *alloc, template, &image, trampoline, "init", 128)
        };
        match result {
            Ok(pid) => println!("init spawned as pid {}", pid),
            Err(e) => println!("failed to spawn init: {}", e),
        }
    }

    /// Loader entry: give ourselves a known stack and go.
    #[unsafe(naked)]
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        core::arch::naked_asm!(
            "mov esp, {stack}",
            "call kernel_main",
            "2:",
            "hlt",
            "jmp 2b",
            stack = const BOOT_STACK_TOP,
        );
    }

    /// Boot stack inside the reserved low region, below the heap.
    const BOOT_STACK_TOP: usize = 0x0019_0000;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("\n[PANIC] {}", info);
        ferrite_kernel::arch::halt_loop();
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("ferrite-kernel must be built for a bare-metal i586 target");
}
