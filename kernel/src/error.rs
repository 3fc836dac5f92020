//! Kernel-wide error types.
//!
//! Every recoverable failure in the core is expressed as a [`KernelError`]
//! so that the syscall boundary can translate it into a stable negative
//! errno without string formatting on the hot path.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frame, slab slot, or heap space left
    OutOfMemory,
    /// A frame was freed while already free
    DoubleFree { frame: usize },
    /// Bad pointer, length, or descriptor handed across a boundary
    InvalidArgument,
    /// A user pointer failed the user-range check
    BadAddress { addr: usize },
    /// Lookup failed (process, file, cluster chain)
    NotFound,
    /// Creation conflict
    AlreadyExists,
    /// Resource is in use and cannot be torn down
    Busy,
    /// Synchronous hardware exception classified by a fault handler
    Fault,
    /// Subsystem used before its init() ran
    NotInitialized { subsystem: &'static str },
    /// Filesystem-specific error
    Fs(FsError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::DoubleFree { frame } => write!(f, "double free of frame {}", frame),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::BadAddress { addr } => write!(f, "bad address {:#x}", addr),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::AlreadyExists => write!(f, "already exists"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::Fault => write!(f, "hardware fault"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            KernelError::Fs(e) => write!(f, "fs: {}", e),
        }
    }
}

/// File-system error taxonomy with stable codes.
///
/// The discriminants are part of the on-console diagnostic surface and of
/// the syscall errno mapping; do not reorder.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FsError {
    NotFound = 1,
    DiskFull = 2,
    InvalidName = 3,
    AlreadyExists = 4,
    IoError = 5,
    NotAFile = 6,
    NotADirectory = 7,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "file not found",
            FsError::DiskFull => "disk full",
            FsError::InvalidName => "invalid 8.3 name",
            FsError::AlreadyExists => "file already exists",
            FsError::IoError => "I/O error",
            FsError::NotAFile => "not a regular file",
            FsError::NotADirectory => "not a directory",
        };
        f.write_str(msg)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

/// POSIX errno values used at the syscall boundary.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const ECHILD: i32 = 10;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
}

impl KernelError {
    /// Map onto the negative errno returned to ring 3.
    pub fn to_errno(self) -> i32 {
        use errno::*;
        match self {
            KernelError::OutOfMemory => ENOMEM,
            KernelError::DoubleFree { .. } => EINVAL,
            KernelError::InvalidArgument => EINVAL,
            KernelError::BadAddress { .. } => EFAULT,
            KernelError::NotFound => ENOENT,
            KernelError::AlreadyExists => EEXIST,
            KernelError::Busy => EPERM,
            KernelError::Fault => EFAULT,
            KernelError::NotInitialized { .. } => EINVAL,
            KernelError::Fs(fs) => match fs {
                FsError::NotFound => ENOENT,
                FsError::DiskFull => ENOSPC,
                FsError::InvalidName => EINVAL,
                FsError::AlreadyExists => EEXIST,
                FsError::IoError => EIO,
                FsError::NotAFile => EISDIR,
                FsError::NotADirectory => ENOTDIR,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(KernelError::OutOfMemory.to_errno(), errno::ENOMEM);
        assert_eq!(KernelError::Fs(FsError::DiskFull).to_errno(), errno::ENOSPC);
        assert_eq!(KernelError::Fs(FsError::NotFound).to_errno(), errno::ENOENT);
        assert_eq!(KernelError::BadAddress { addr: 0 }.to_errno(), errno::EFAULT);
    }
}
