//! Process-lifecycle system calls.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::arch::context::TrapFrame;
use crate::error::{errno, KernelError};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::user_validation::copy_user_cstr;
use crate::mm::user_validation::validate_user_range;
use crate::mm::FRAME_ALLOCATOR;
use crate::process::scheduler::{WaitResult, SCHEDULER};
use crate::process::{sig, signal, ProcessId};

fn err(e: KernelError) -> isize {
    -(e.to_errno() as isize)
}

/// getpid()
pub fn sys_getpid() -> isize {
    crate::sync::without_interrupts(|| SCHEDULER.lock().current_pid().0 as isize)
}

/// kill(pid, signal). SIGKILL is synchronous: the target leaves the ready
/// structures before the call returns. Everything else marks a pending bit
/// delivered at the target's next checkpoint.
pub fn sys_kill(pid: usize, signal_num: usize) -> isize {
    let target = ProcessId(pid as u32);
    let result = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if signal_num as u32 == sig::SIGKILL {
            sched
                .kill(target, -(sig::SIGKILL as i32))
                .map(|decision| Some(decision))
        } else {
            signal::send(&mut sched, target, signal_num as u32).map(|()| None)
        }
    });
    match result {
        Ok(Some(decision)) => {
            // Killing the current process must never return to its frame.
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            crate::process::scheduler::apply_switch(decision);
            let _ = decision;
            0
        }
        Ok(None) => 0,
        Err(KernelError::NotFound) => -(errno::ESRCH as isize),
        Err(e) => err(e),
    }
}

/// brk(new_break). 0 queries; anything else moves the break, eagerly
/// mapping or releasing frames. Returns the resulting break.
pub fn sys_brk(new_break: usize) -> isize {
    let result = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        let mut alloc = FRAME_ALLOCATOR.lock();
        p.set_brk(&mut *alloc, new_break)
    });
    match result {
        Ok(brk) => brk as isize,
        Err(e) => err(e),
    }
}

/// waitpid(pid, status_out, options)
pub fn sys_waitpid(pid: usize, status_out: usize, _options: usize) -> isize {
    if status_out != 0 {
        if let Err(e) = validate_user_range(status_out, core::mem::size_of::<i32>()) {
            return err(e);
        }
    }
    let target = ProcessId(pid as u32);

    loop {
        let result = crate::sync::without_interrupts(|| {
            let mut sched = SCHEDULER.lock();
            let parent = sched.current_pid();
            let mut alloc = FRAME_ALLOCATOR.lock();
            sched.try_wait(&mut *alloc, parent, target)
        });

        match result {
            Ok(WaitResult::Reaped(child, status)) => {
                if status_out != 0 {
                    // SAFETY: range-checked above; the caller's address
                    // space is active.
                    unsafe { core::ptr::write(status_out as *mut i32, status) };
                }
                return child.0 as isize;
            }
            Ok(WaitResult::NoChild) => return -(errno::ECHILD as isize),
            Ok(WaitResult::StillRunning) => {
                #[cfg(all(target_arch = "x86", target_os = "none"))]
                {
                    // Block until the child's exit wakes us.
                    let decision = crate::sync::without_interrupts(|| {
                        let mut sched = SCHEDULER.lock();
                        let parent = sched.current_pid();
                        sched.mark_waiting(parent, target)?;
                        sched.block(parent)
                    });
                    match decision {
                        Ok(d) => crate::process::scheduler::apply_switch(d),
                        Err(e) => return err(e),
                    }
                }
                #[cfg(not(all(target_arch = "x86", target_os = "none")))]
                {
                    // Host builds cannot suspend; report "try again".
                    return -(errno::EAGAIN as isize);
                }
            }
            Err(e) => return err(e),
        }
    }
}

/// exit(status): never returns.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sys_exit(status: i32) -> isize {
    let decision = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current_pid();
        sched.kill(current, status)
    });
    if let Ok(d) = decision {
        crate::process::scheduler::apply_switch(d);
    }
    // Killing pid 0 is refused; the boot task has nowhere to exit to.
    crate::arch::halt_loop();
}

/// fork(): child pid to the parent; the child resumes from a replay of
/// this trap frame with EAX = 0.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sys_fork(frame: &TrapFrame) -> isize {
    let result = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let mut alloc = FRAME_ALLOCATOR.lock();
        let trampoline = crate::arch::x86::usermode::fork_return as usize;
        sched.fork_current(&mut *alloc, frame, trampoline)
    });
    match result {
        Ok(pid) => pid.0 as isize,
        Err(e) => err(e),
    }
}

/// execve(path, argv, envp): replaces the user image. argv/envp are
/// accepted (and range-checked when non-null) but the flat-binary loader
/// passes nothing through.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sys_execve(frame: &mut TrapFrame, path_ptr: usize, argv: usize, envp: usize) -> isize {
    use crate::arch::context::{EFLAGS_IF, USER_CS, USER_DS};

    for ptr in [argv, envp] {
        if ptr != 0 {
            if let Err(e) = validate_user_range(ptr, core::mem::size_of::<usize>()) {
                return err(e);
            }
        }
    }
    let path = match copy_user_cstr(path_ptr, 13) {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    let path = match core::str::from_utf8(&path) {
        Ok(s) => s,
        Err(_) => return -(errno::EINVAL as isize),
    };

    let image = match crate::fs::with_root(|fs| {
        let size = fs.size(path)?;
        let mut data = alloc::vec![0u8; size];
        fs.read(path, &mut data)?;
        Ok(data)
    }) {
        Ok(image) => image,
        Err(e) => return err(e),
    };

    let result = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        let mut alloc = FRAME_ALLOCATOR.lock();
        p.exec_image(&mut *alloc, &image)
    });
    match result {
        Ok((entry, user_stack)) => {
            frame.eip = entry;
            frame.cs = USER_CS;
            frame.eflags = EFLAGS_IF;
            frame.user_esp = user_stack;
            frame.user_ss = USER_DS;
            0
        }
        Err(e) => err(e),
    }
}
