//! File system layer: a FAT12 volume over a block device.
//!
//! The volume lives in a fixed RAM region on bare metal ([`RamDisk`]); the
//! FAT12 code is generic over [`BlockDevice`] so callers pick the driver.

pub mod device;
pub mod fat12;

use lazy_static::lazy_static;
use spin::Mutex;

pub use device::{BlockDevice, RamDisk, SECTOR_SIZE};
pub use fat12::{DirEntryInfo, Fat12Volume};

use crate::error::{FsError, KernelError};

/// open(2) flags understood by the fd layer.
pub mod open_flags {
    pub const O_RDONLY: u32 = 0x0000;
    pub const O_WRONLY: u32 = 0x0001;
    pub const O_RDWR: u32 = 0x0002;
    pub const O_CREAT: u32 = 0x0100;
    pub const O_TRUNC: u32 = 0x0200;
    pub const O_APPEND: u32 = 0x0400;
}

/// A canonical 8.3 name: uppercase, space-padded, split at the first dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    /// Canonicalize `name`. ASCII letters fold to uppercase; the part
    /// before the first dot must fit 8 bytes, the extension 3.
    pub fn parse(name: &str) -> Result<Self, FsError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || !bytes.is_ascii() {
            return Err(FsError::InvalidName);
        }
        let (stem, ext) = match bytes.iter().position(|&b| b == b'.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &bytes[..0]),
        };
        if stem.is_empty() || stem.len() > 8 || ext.len() > 3 {
            return Err(FsError::InvalidName);
        }
        let mut out = [b' '; 11];
        for (i, &b) in stem.iter().enumerate() {
            out[i] = canonical_byte(b)?;
        }
        for (i, &b) in ext.iter().enumerate() {
            out[8 + i] = canonical_byte(b)?;
        }
        Ok(Self(out))
    }

    /// Render back to `NAME.EXT` form.
    pub fn display(&self) -> alloc::string::String {
        let mut s = alloc::string::String::new();
        for &b in self.0[..8].iter().take_while(|&&b| b != b' ') {
            s.push(b as char);
        }
        let ext: alloc::vec::Vec<u8> = self.0[8..]
            .iter()
            .take_while(|&&b| b != b' ')
            .copied()
            .collect();
        if !ext.is_empty() {
            s.push('.');
            for b in ext {
                s.push(b as char);
            }
        }
        s
    }
}

fn canonical_byte(b: u8) -> Result<u8, FsError> {
    match b {
        b'a'..=b'z' => Ok(b - b'a' + b'A'),
        b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'~' | b'!' | b'#' | b'$' | b'%' | b'&' => Ok(b),
        _ => Err(FsError::InvalidName),
    }
}

lazy_static! {
    /// The mounted root volume. Lock inside interrupt-disabled sections.
    pub static ref ROOT_FS: Mutex<Option<Fat12Volume<RamDisk>>> = Mutex::new(None);
}

/// Mount the RAM-resident volume as the root file system.
pub fn mount_ramdisk(region: &'static mut [u8]) -> Result<(), KernelError> {
    let volume = Fat12Volume::mount(RamDisk::new(region))?;
    log::info!(
        "fat12: mounted, {} KiB free of {} KiB",
        volume.free_space() / 1024,
        volume.total_space() / 1024
    );
    *ROOT_FS.lock() = Some(volume);
    Ok(())
}

/// Run `f` against the mounted root volume.
pub fn with_root<R>(
    f: impl FnOnce(&mut Fat12Volume<RamDisk>) -> Result<R, FsError>,
) -> Result<R, KernelError> {
    crate::sync::without_interrupts(|| {
        let mut guard = ROOT_FS.lock();
        let volume = guard
            .as_mut()
            .ok_or(KernelError::NotInitialized { subsystem: "fat12" })?;
        f(volume).map_err(KernelError::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_fold_to_uppercase_and_pad() {
        let n = ShortName::parse("hello.txt").unwrap();
        assert_eq!(&n.0, b"HELLO   TXT");
        assert_eq!(n.display(), "HELLO.TXT");
    }

    #[test]
    fn name_without_extension() {
        let n = ShortName::parse("KERNEL").unwrap();
        assert_eq!(&n.0, b"KERNEL     ");
        assert_eq!(n.display(), "KERNEL");
    }

    #[test]
    fn split_happens_at_the_first_dot() {
        let n = ShortName::parse("a.b").unwrap();
        assert_eq!(&n.0, b"A       B  ");
    }

    #[test]
    fn overflowing_fields_are_invalid() {
        assert_eq!(
            ShortName::parse("VERYLONGNAME.TXT"),
            Err(FsError::InvalidName)
        );
        assert_eq!(ShortName::parse("A.LONG"), Err(FsError::InvalidName));
        assert_eq!(ShortName::parse(""), Err(FsError::InvalidName));
        assert_eq!(ShortName::parse(".TXT"), Err(FsError::InvalidName));
    }

    #[test]
    fn exotic_bytes_are_invalid() {
        assert_eq!(ShortName::parse("A B.TXT"), Err(FsError::InvalidName));
        assert_eq!(ShortName::parse("Ä.TXT"), Err(FsError::InvalidName));
        assert_eq!(ShortName::parse("a/b.txt"), Err(FsError::InvalidName));
    }
}
