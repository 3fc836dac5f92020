//! Physical frame allocator.
//!
//! A bitmap with one bit per 4 KiB frame (1 = used) over a contiguous
//! managed region. The allocator is the sole authority for frame
//! ownership: a frame is either free or assigned to exactly one owner, and
//! frames below the reserved threshold (kernel image, BIOS data, video
//! memory, the kernel heap region) are never handed out.
//!
//! Allocation scans lowest-index-first; there is no fairness guarantee.

use spin::Mutex;

use super::{FrameNumber, MemoryRegion, MemoryRegionKind, PhysicalAddress, FRAME_SIZE};
use crate::error::KernelError;

/// Upper bound on managed physical memory: 128 MiB.
pub const MAX_PHYSICAL_FRAMES: usize = 32768;

const BITMAP_BYTES: usize = MAX_PHYSICAL_FRAMES / 8;

/// Frames reserved at the bottom of the managed region on bare metal:
/// 4 MiB covering the kernel image, BIOS data area, VGA memory and the
/// kernel heap at the 2 MiB mark.
pub const RESERVED_LOW_FRAMES: usize = 1024;

/// Anything that can hand out and take back physical frames.
///
/// The VMM and the slab allocator are written against this trait so host
/// tests can drive them from a private allocator over a leaked arena while
/// the kernel uses [`FRAME_ALLOCATOR`].
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Result<FrameNumber, KernelError>;
    fn free_frame(&mut self, frame: FrameNumber) -> Result<(), KernelError>;
    /// Resolve a frame index to the address of its first byte.
    fn frame_address(&self, frame: FrameNumber) -> PhysicalAddress;
}

/// Allocation counters reported by [`BitmapFrameAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAllocatorStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
}

/// Bitmap frame allocator over `[base, base + total_frames * 4096)`.
pub struct BitmapFrameAllocator {
    bitmap: [u8; BITMAP_BYTES],
    base: PhysicalAddress,
    total_frames: usize,
    used_frames: usize,
}

impl BitmapFrameAllocator {
    /// An empty allocator; every call fails until [`init`](Self::init) runs.
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_BYTES],
            base: PhysicalAddress::zero(),
            total_frames: 0,
            used_frames: 0,
        }
    }

    /// Start managing `total_frames` frames at `base`, all initially free.
    pub fn init(&mut self, base: PhysicalAddress, total_frames: usize) {
        let total = total_frames.min(MAX_PHYSICAL_FRAMES);
        self.bitmap = [0; BITMAP_BYTES];
        self.base = base;
        self.total_frames = total;
        self.used_frames = 0;
    }

    /// Initialize from the boot-stage memory map: everything starts
    /// reserved, `Available` ranges are freed, then the low region is
    /// re-reserved for the kernel image and heap.
    pub fn init_from_map(&mut self, regions: &[MemoryRegion]) {
        self.bitmap = [0xFF; BITMAP_BYTES];
        self.base = PhysicalAddress::zero();
        self.total_frames = MAX_PHYSICAL_FRAMES;
        self.used_frames = MAX_PHYSICAL_FRAMES;

        for region in regions {
            if region.kind != MemoryRegionKind::Available {
                continue;
            }
            let first = (region.start as usize).div_ceil(FRAME_SIZE);
            let last = ((region.start + region.len) as usize) / FRAME_SIZE;
            for frame in first..last.min(MAX_PHYSICAL_FRAMES) {
                if self.test_bit(frame) {
                    self.clear_bit(frame);
                    self.used_frames -= 1;
                }
            }
        }

        for frame in 0..RESERVED_LOW_FRAMES {
            if !self.test_bit(frame) {
                self.set_bit(frame);
                self.used_frames += 1;
            }
        }

        log::info!(
            "pmm: managing {} frames, {} reserved",
            self.total_frames,
            self.used_frames
        );
    }

    /// Allocate the lowest free frame.
    pub fn alloc_frame(&mut self) -> Result<FrameNumber, KernelError> {
        let full_bytes = self.total_frames / 8;
        for byte_idx in 0..full_bytes {
            let byte = self.bitmap[byte_idx];
            if byte == 0xFF {
                continue;
            }
            let bit = (!byte).trailing_zeros() as usize;
            let frame = byte_idx * 8 + bit;
            self.set_bit(frame);
            self.used_frames += 1;
            return Ok(FrameNumber::new(frame));
        }
        // Tail bits of a non-multiple-of-8 frame count
        for frame in full_bytes * 8..self.total_frames {
            if !self.test_bit(frame) {
                self.set_bit(frame);
                self.used_frames += 1;
                return Ok(FrameNumber::new(frame));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Return a frame to the pool.
    pub fn free_frame(&mut self, frame: FrameNumber) -> Result<(), KernelError> {
        let idx = frame.as_usize();
        if idx >= self.total_frames {
            return Err(KernelError::InvalidArgument);
        }
        if !self.test_bit(idx) {
            debug_assert!(false, "double free of frame {}", idx);
            return Err(KernelError::DoubleFree { frame: idx });
        }
        self.clear_bit(idx);
        self.used_frames -= 1;
        Ok(())
    }

    /// Allocate `n` consecutive frames; returns the first.
    pub fn alloc_contiguous(&mut self, n: usize) -> Result<FrameNumber, KernelError> {
        if n == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..self.total_frames {
            if self.test_bit(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == n {
                for f in run_start..run_start + n {
                    self.set_bit(f);
                }
                self.used_frames += n;
                return Ok(FrameNumber::new(run_start));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Free `n` consecutive frames starting at `frame`.
    pub fn free_contiguous(&mut self, frame: FrameNumber, n: usize) -> Result<(), KernelError> {
        for i in 0..n {
            self.free_frame(FrameNumber::new(frame.as_usize() + i))?;
        }
        Ok(())
    }

    /// Mark every frame overlapping `[start, start + len)` used. The start
    /// is rounded down and the length up to whole frames. Idempotent:
    /// already-reserved frames are left alone and not double-counted.
    pub fn reserve_region(&mut self, start: PhysicalAddress, len: usize) {
        if len == 0 {
            return;
        }
        let rel = start.as_usize().saturating_sub(self.base.as_usize());
        let first = rel / FRAME_SIZE;
        let last = (rel + len).div_ceil(FRAME_SIZE);
        for frame in first..last.min(self.total_frames) {
            if !self.test_bit(frame) {
                self.set_bit(frame);
                self.used_frames += 1;
            }
        }
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        FrameAllocatorStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames,
        }
    }

    /// Whether a frame is currently marked used.
    pub fn is_frame_used(&self, frame: FrameNumber) -> bool {
        self.test_bit(frame.as_usize())
    }

    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    fn test_bit(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    fn set_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for BitmapFrameAllocator {
    fn alloc_frame(&mut self) -> Result<FrameNumber, KernelError> {
        BitmapFrameAllocator::alloc_frame(self)
    }

    fn free_frame(&mut self, frame: FrameNumber) -> Result<(), KernelError> {
        BitmapFrameAllocator::free_frame(self, frame)
    }

    fn frame_address(&self, frame: FrameNumber) -> PhysicalAddress {
        self.base.offset(frame.as_usize() * FRAME_SIZE)
    }
}

/// The kernel's frame allocator. Lock only inside an interrupt-disabled
/// critical section.
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::new());

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(frames: usize) -> BitmapFrameAllocator {
        let mut a = BitmapFrameAllocator::new();
        a.init(PhysicalAddress::zero(), frames);
        a
    }

    #[test]
    fn alloc_is_lowest_first() {
        let mut a = allocator(16);
        assert_eq!(a.alloc_frame().unwrap(), FrameNumber::new(0));
        assert_eq!(a.alloc_frame().unwrap(), FrameNumber::new(1));
        a.free_frame(FrameNumber::new(0)).unwrap();
        assert_eq!(a.alloc_frame().unwrap(), FrameNumber::new(0));
    }

    #[test]
    fn bitmap_matches_allocation_set() {
        let mut a = allocator(64);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..10 {
            held.push(a.alloc_frame().unwrap());
        }
        for f in held.iter().step_by(2) {
            a.free_frame(*f).unwrap();
        }
        for i in 0..64 {
            let f = FrameNumber::new(i);
            let expected = held.iter().skip(1).step_by(2).any(|h| *h == f);
            assert_eq!(a.is_frame_used(f), expected, "frame {}", i);
        }
        assert_eq!(a.stats().used_frames, 5);
    }

    #[test]
    fn double_free_is_reported() {
        let mut a = allocator(8);
        let f = a.alloc_frame().unwrap();
        a.free_frame(f).unwrap();
        // debug_assert fires under debug; check the release-path error
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| a.free_frame(f)));
        match result {
            Ok(r) => assert_eq!(r, Err(KernelError::DoubleFree { frame: 0 })),
            Err(_) => {} // debug_assert panicked, also acceptable
        }
    }

    #[test]
    fn contiguous_needs_adjacent_frames() {
        // Allocate 10, free every other one: alloc_contiguous(2) fails on
        // the {0,2,4,6,8} free pattern and succeeds once frame 1 is freed
        // too.
        let mut a = allocator(10);
        let mut frames = alloc::vec::Vec::new();
        for _ in 0..10 {
            frames.push(a.alloc_frame().unwrap());
        }
        for f in frames.iter().step_by(2) {
            a.free_frame(*f).unwrap();
        }
        assert_eq!(a.alloc_contiguous(2), Err(KernelError::OutOfMemory));
        a.free_frame(FrameNumber::new(1)).unwrap();
        let got = a.alloc_contiguous(2).unwrap();
        assert!(got == FrameNumber::new(0) || got == FrameNumber::new(1));
        assert!(a.is_frame_used(got));
        assert!(a.is_frame_used(FrameNumber::new(got.as_usize() + 1)));
    }

    #[test]
    fn contiguous_marks_all_frames_used() {
        let mut a = allocator(32);
        let first = a.alloc_contiguous(5).unwrap();
        for i in 0..5 {
            assert!(a.is_frame_used(FrameNumber::new(first.as_usize() + i)));
        }
        a.free_contiguous(first, 5).unwrap();
        assert_eq!(a.stats().used_frames, 0);
    }

    #[test]
    fn reserve_region_rounds_and_is_idempotent() {
        let mut a = allocator(32);
        a.reserve_region(PhysicalAddress::new(0x1800), 0x1000); // frames 1..3
        assert!(a.is_frame_used(FrameNumber::new(1)));
        assert!(a.is_frame_used(FrameNumber::new(2)));
        assert!(!a.is_frame_used(FrameNumber::new(3)));
        let used = a.stats().used_frames;
        a.reserve_region(PhysicalAddress::new(0x1800), 0x1000);
        assert_eq!(a.stats().used_frames, used);
    }

    #[test]
    fn init_from_map_reserves_low_memory() {
        let regions = [
            MemoryRegion {
                start: 0,
                len: 64 * 1024 * 1024,
                kind: MemoryRegionKind::Available,
            },
            MemoryRegion {
                start: 64 * 1024 * 1024,
                len: 1024 * 1024,
                kind: MemoryRegionKind::Reserved,
            },
        ];
        let mut a = BitmapFrameAllocator::new();
        a.init_from_map(&regions);
        assert!(a.is_frame_used(FrameNumber::new(0)));
        assert!(a.is_frame_used(FrameNumber::new(RESERVED_LOW_FRAMES - 1)));
        assert!(!a.is_frame_used(FrameNumber::new(RESERVED_LOW_FRAMES)));
        // The first allocation lands above the reserved threshold.
        assert_eq!(
            a.alloc_frame().unwrap(),
            FrameNumber::new(RESERVED_LOW_FRAMES)
        );
    }

    #[test]
    fn exhaustion_returns_out_of_memory() {
        let mut a = allocator(4);
        for _ in 0..4 {
            a.alloc_frame().unwrap();
        }
        assert_eq!(a.alloc_frame(), Err(KernelError::OutOfMemory));
    }
}
