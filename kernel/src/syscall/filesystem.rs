//! read/write/open/close.
//!
//! Descriptors 0..2 are the console (stdin reads yield EOF here; the
//! keyboard line discipline is outside the core). Higher descriptors
//! reference root-directory files through the per-process table.
//!
//! Every user pointer is range-checked before the first dereference.

use alloc::vec;

use crate::error::{errno, KernelError};
use crate::fs::{open_flags, ShortName};
use crate::mm::user_validation::{user_slice, user_slice_mut, copy_user_cstr};
use crate::process::scheduler::SCHEDULER;
use crate::process::OpenFile;

/// Longest user path: `12345678.123` plus NUL.
const MAX_PATH: usize = 13;

fn err(e: KernelError) -> isize {
    -(e.to_errno() as isize)
}

/// write(fd, buf, count)
pub fn sys_write(fd: usize, buf: usize, count: usize) -> isize {
    if count == 0 {
        return 0;
    }
    // Pointer check comes first: a violating call must return without any
    // kernel read of the buffer.
    // SAFETY: the calling process's address space is active for the
    // duration of the syscall.
    let data = match unsafe { user_slice(buf, count) } {
        Ok(slice) => slice,
        Err(e) => return err(e),
    };
    do_write(fd, data)
}

/// The post-validation write path; also the console output seam.
pub fn do_write(fd: usize, data: &[u8]) -> isize {
    match fd {
        1 | 2 => {
            crate::console::write_bytes(data);
            data.len() as isize
        }
        0 => -(errno::EBADF as isize),
        _ => match file_write(fd, data) {
            Ok(n) => n as isize,
            Err(e) => err(e),
        },
    }
}

/// read(fd, buf, count)
pub fn sys_read(fd: usize, buf: usize, count: usize) -> isize {
    if count == 0 {
        return 0;
    }
    // SAFETY: as in sys_write; checked before any access.
    let out = match unsafe { user_slice_mut(buf, count) } {
        Ok(slice) => slice,
        Err(e) => return err(e),
    };
    match fd {
        // Stdin: the interactive line discipline lives outside the core.
        0 => 0,
        1 | 2 => -(errno::EBADF as isize),
        _ => match file_read(fd, out) {
            Ok(n) => n as isize,
            Err(e) => err(e),
        },
    }
}

/// open(path, flags)
pub fn sys_open(path_ptr: usize, flags: usize) -> isize {
    let path = match copy_user_cstr(path_ptr, MAX_PATH) {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    let path = match core::str::from_utf8(&path) {
        Ok(s) => s,
        Err(_) => return -(errno::EINVAL as isize),
    };
    match do_open(path, flags as u32) {
        Ok(fd) => fd as isize,
        Err(e) => err(e),
    }
}

/// The post-copy open path.
pub fn do_open(path: &str, flags: u32) -> Result<usize, KernelError> {
    let name = ShortName::parse(path).map_err(KernelError::from)?;

    let size = crate::fs::with_root(|fs| {
        if !fs.file_exists(path) {
            if flags & open_flags::O_CREAT == 0 {
                return Err(crate::error::FsError::NotFound);
            }
            fs.create(path)?;
        } else if flags & open_flags::O_TRUNC != 0 {
            fs.write(path, b"")?;
        }
        fs.size(path)
    })?;

    let pos = if flags & open_flags::O_APPEND != 0 {
        size
    } else {
        0
    };
    let file = OpenFile {
        name,
        pos,
        flags,
    };
    crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        p.fd_alloc(file)
    })
}

/// close(fd)
pub fn sys_close(fd: usize) -> isize {
    let r = crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        p.fd_close(fd)
    });
    match r {
        Ok(()) => 0,
        Err(_) => -(errno::EBADF as isize),
    }
}

fn file_read(fd: usize, out: &mut [u8]) -> Result<usize, KernelError> {
    let (name, pos) = lookup_fd(fd)?;
    let display = name.display();

    let contents = crate::fs::with_root(|fs| {
        let size = fs.size(&display)?;
        let mut data = vec![0u8; size];
        fs.read(&display, &mut data)?;
        Ok(data)
    })?;

    if pos >= contents.len() {
        return Ok(0); // EOF
    }
    let n = (contents.len() - pos).min(out.len());
    out[..n].copy_from_slice(&contents[pos..pos + n]);
    advance_fd(fd, n)?;
    Ok(n)
}

fn file_write(fd: usize, data: &[u8]) -> Result<usize, KernelError> {
    let (name, _pos) = lookup_fd(fd)?;
    let display = name.display();
    // Descriptor writes extend the file; the cursor tracks the tail.
    let n = crate::fs::with_root(|fs| fs.append(&display, data))?;
    advance_fd(fd, n)?;
    Ok(n)
}

fn lookup_fd(fd: usize) -> Result<(ShortName, usize), KernelError> {
    crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        let file = p.fd_get(fd).ok_or(KernelError::InvalidArgument)?;
        Ok((file.name, file.pos))
    })
}

fn advance_fd(fd: usize, n: usize) -> Result<(), KernelError> {
    crate::sync::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let p = sched.current_mut().ok_or(KernelError::NotFound)?;
        let file = p.fd_get(fd).ok_or(KernelError::InvalidArgument)?;
        file.pos += n;
        Ok(())
    })
}
