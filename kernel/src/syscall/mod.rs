//! System-call dispatch.
//!
//! Ring 3 enters through the user-callable trap gate at vector 0x80 (a
//! trap gate, so the timer and keyboard still deliver during long calls).
//! The number arrives in EAX, arguments in EBX, ECX, EDX, ESI, EDI; the
//! result is written back into the saved EAX of the trap frame.

pub mod filesystem;
pub mod process;

use crate::arch::context::TrapFrame;
use crate::error::errno;

/// Software-interrupt vector for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The system-call table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Waitpid = 7,
    Execve = 11,
    Getpid = 20,
    Kill = 37,
    Brk = 45,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Exit),
            2 => Ok(Syscall::Fork),
            3 => Ok(Syscall::Read),
            4 => Ok(Syscall::Write),
            5 => Ok(Syscall::Open),
            6 => Ok(Syscall::Close),
            7 => Ok(Syscall::Waitpid),
            11 => Ok(Syscall::Execve),
            20 => Ok(Syscall::Getpid),
            37 => Ok(Syscall::Kill),
            45 => Ok(Syscall::Brk),
            _ => Err(()),
        }
    }
}

/// Dispatch the calls that do not need the trap frame itself. Recoverable
/// failures come back as negative errno values; nothing here panics on bad
/// user input.
pub fn handle(number: usize, a1: usize, a2: usize, a3: usize, _a4: usize, _a5: usize) -> isize {
    let syscall = match Syscall::try_from(number) {
        Ok(s) => s,
        Err(()) => return -(errno::ENOSYS as isize),
    };
    match syscall {
        Syscall::Read => filesystem::sys_read(a1, a2, a3),
        Syscall::Write => filesystem::sys_write(a1, a2, a3),
        Syscall::Open => filesystem::sys_open(a1, a2),
        Syscall::Close => filesystem::sys_close(a1),
        Syscall::Waitpid => process::sys_waitpid(a1, a2, a3),
        Syscall::Getpid => process::sys_getpid(),
        Syscall::Kill => process::sys_kill(a1, a2),
        Syscall::Brk => process::sys_brk(a1),
        // These rewrite or abandon the trap frame; dispatch() routes them.
        Syscall::Exit | Syscall::Fork | Syscall::Execve => -(errno::ENOSYS as isize),
    }
}

/// Full dispatcher invoked from the int 0x80 stub.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn dispatch(frame: &mut TrapFrame) {
    let number = frame.syscall_number();
    let (a1, a2, a3, a4, a5) = frame.syscall_args();
    let ret = match Syscall::try_from(number) {
        Ok(Syscall::Exit) => process::sys_exit(a1 as i32),
        Ok(Syscall::Fork) => process::sys_fork(frame),
        Ok(Syscall::Execve) => process::sys_execve(frame, a1, a2, a3),
        _ => handle(number, a1, a2, a3, a4, a5),
    };
    frame.set_return(ret);
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn dispatch(frame: &mut TrapFrame) {
    let number = frame.syscall_number();
    let (a1, a2, a3, a4, a5) = frame.syscall_args();
    frame.set_return(handle(number, a1, a2, a3, a4, a5));
}
