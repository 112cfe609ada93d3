//! Implementation of [`FrameAllocator`] which
//! controls all the frames in the operating system.

use super::{PhysAddr, PhysPageNum};
use crate::config::{LOW_MEMORY_END, PAGE_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use log::{trace, warn};

/// A range of physical memory the firmware reports as usable RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub len: usize,
}

impl MemoryRegion {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }
}

pub trait FrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// One bit per 4KiB frame: set = used or reserved, clear = free.
///
/// Frame 0 is reserved forever, so a `PhysPageNum(0)` never stands for a
/// successful allocation. The bitmap itself lives on the kernel heap, which is
/// part of the kernel image and therefore reserved at boot.
pub struct BitmapFrameAllocator {
    bitmap: Vec<u32>,
    /// Number of frames backed by physical memory.
    max_blocks: usize,
    /// Frames whose bit is set.
    used_blocks: usize,
}

impl BitmapFrameAllocator {
    /// Every frame of `total_memory` starts out used.
    pub fn new(total_memory: usize) -> Self {
        let max_blocks = total_memory / PAGE_SIZE;
        Self {
            bitmap: vec![u32::MAX; max_blocks.div_ceil(32)],
            max_blocks,
            used_blocks: max_blocks,
        }
    }

    /// Build the allocator from the firmware memory map.
    ///
    /// 1. mark every frame used
    /// 2. free every frame fully inside a usable region
    /// 3. reserve the low 1MiB, frame 0 and every range in `reserved` (kernel image, modules)
    pub fn init(total_memory: usize, usable: &[MemoryRegion], reserved: &[Range<usize>]) -> Self {
        let mut allocator = Self::new(total_memory);
        for region in usable {
            allocator.init_region(region.start, region.len);
        }
        allocator.deinit_region(0, LOW_MEMORY_END);
        for range in reserved {
            allocator.deinit_region(range.start, range.end.saturating_sub(range.start));
        }
        allocator.deinit_region(0, PAGE_SIZE);
        trace!(
            "[pmm] {} frames, {} free",
            allocator.max_blocks,
            allocator.free_blocks()
        );
        allocator
    }

    /// Mark the frames lying entirely inside `[start, start + len)` free.
    pub fn init_region(&mut self, start: usize, len: usize) {
        let first = PhysAddr(start).ceil().0;
        let last = PhysAddr(start.saturating_add(len)).floor().0.min(self.max_blocks);
        for frame in first..last {
            self.unset(frame);
        }
    }

    /// Mark every frame touching `[start, start + len)` used.
    ///
    /// Reserving an already reserved frame changes nothing.
    pub fn deinit_region(&mut self, start: usize, len: usize) {
        let first = PhysAddr(start).floor().0;
        let last = PhysAddr(start.saturating_add(len)).ceil().0.min(self.max_blocks);
        for frame in first..last {
            self.set(frame);
        }
    }

    /// Allocate `n` physically contiguous frames and return the first one.
    pub fn alloc_contiguous(&mut self, n: usize) -> Option<PhysPageNum> {
        if n == 0 {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 1..self.max_blocks {
            if self.test(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == n {
                for f in run_start..run_start + n {
                    self.set(f);
                }
                return Some(PhysPageNum(run_start));
            }
        }
        None
    }

    pub fn is_used(&self, ppn: PhysPageNum) -> bool {
        ppn.0 >= self.max_blocks || self.test(ppn.0)
    }

    pub fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.max_blocks - self.used_blocks
    }

    fn test(&self, frame: usize) -> bool {
        self.bitmap[frame / 32] & (1 << (frame % 32)) != 0
    }

    fn set(&mut self, frame: usize) {
        if !self.test(frame) {
            self.bitmap[frame / 32] |= 1 << (frame % 32);
            self.used_blocks += 1;
        }
    }

    fn unset(&mut self, frame: usize) {
        if self.test(frame) {
            self.bitmap[frame / 32] &= !(1 << (frame % 32));
            self.used_blocks -= 1;
        }
    }

    /// First clear bit, skipping whole words that are full.
    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u32::MAX)
            .map(|(i, word)| i * 32 + word.trailing_ones() as usize)
            .filter(|frame| *frame < self.max_blocks)
    }
}

impl FrameAllocator for BitmapFrameAllocator {
    /// Allocated physical memory.
    /// - Allocation Successful => Some()
    /// - Allocation failed => None()
    ///   - Exhausted memory.
    fn alloc(&mut self) -> Option<PhysPageNum> {
        let frame = self.first_free()?;
        self.set(frame);
        Some(PhysPageNum(frame))
    }

    /// Freeing a frame twice is a caller bug; the second call is reported and ignored
    /// so `used_blocks` stays exact.
    fn dealloc(&mut self, ppn: PhysPageNum) {
        if ppn.0 == 0 || ppn.0 >= self.max_blocks {
            warn!("[pmm] refusing to free {:?}", ppn);
            return;
        }
        if !self.test(ppn.0) {
            warn!("[pmm] {:?} freed twice", ppn);
            return;
        }
        self.unset(ppn.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const MIB: usize = 0x10_0000;

    fn allocator(total: usize) -> BitmapFrameAllocator {
        BitmapFrameAllocator::init(total, &[MemoryRegion::new(0, total)], &[])
    }

    #[test]
    fn init_reserves_low_memory_and_frame_zero() {
        let pmm = allocator(4 * MIB);
        assert_eq!(pmm.max_blocks(), 1024);
        assert_eq!(pmm.used_blocks(), 256);
        assert!(pmm.is_used(PhysPageNum(0)));
        assert!(pmm.is_used(PhysPageNum(255)));
        assert!(!pmm.is_used(PhysPageNum(256)));
    }

    #[test]
    fn init_ignores_holes_and_reserved_ranges() {
        let pmm = BitmapFrameAllocator::init(
            8 * MIB,
            &[MemoryRegion::new(0, 640 * 1024), MemoryRegion::new(MIB, 3 * MIB)],
            &[MIB..MIB + 0x1800],
        );
        // 3MiB usable above 1MiB, minus two frames of kernel image
        assert_eq!(pmm.free_blocks(), 768 - 2);
        assert!(pmm.is_used(PhysPageNum(0x101)));
        assert!(!pmm.is_used(PhysPageNum(0x102)));
        assert!(pmm.is_used(PhysPageNum(0x400)));
    }

    #[test]
    fn reserving_twice_is_idempotent() {
        let mut pmm = allocator(4 * MIB);
        let used = pmm.used_blocks();
        pmm.deinit_region(0, MIB);
        pmm.deinit_region(0, MIB);
        assert_eq!(pmm.used_blocks(), used);
    }

    #[test]
    fn alloc_is_first_fit_and_never_frame_zero() {
        let mut pmm = allocator(2 * MIB);
        assert_eq!(pmm.alloc(), Some(PhysPageNum(256)));
        assert_eq!(pmm.alloc(), Some(PhysPageNum(257)));
        pmm.dealloc(PhysPageNum(256));
        assert_eq!(pmm.alloc(), Some(PhysPageNum(256)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pmm = allocator(2 * MIB);
        let mut n = 0;
        while pmm.alloc().is_some() {
            n += 1;
        }
        assert_eq!(n, 256);
        assert_eq!(pmm.free_blocks(), 0);
        assert_eq!(pmm.alloc(), None);
        assert_eq!(pmm.alloc_contiguous(1), None);
    }

    #[test]
    fn double_free_does_not_skew_accounting() {
        let mut pmm = allocator(2 * MIB);
        let frame = pmm.alloc().unwrap();
        let used = pmm.used_blocks();
        pmm.dealloc(frame);
        pmm.dealloc(frame);
        pmm.dealloc(PhysPageNum(0));
        assert_eq!(pmm.used_blocks(), used - 1);
        assert!(pmm.is_used(PhysPageNum(0)));
    }

    #[test]
    fn contiguous_allocation_skips_short_runs() {
        let mut pmm = allocator(2 * MIB);
        let a = pmm.alloc().unwrap();
        let b = pmm.alloc().unwrap();
        let _c = pmm.alloc().unwrap();
        pmm.dealloc(a);
        pmm.dealloc(b);
        let run = pmm.alloc_contiguous(3).unwrap();
        assert_eq!(run, PhysPageNum(259));
        for f in 259..262 {
            assert!(pmm.is_used(PhysPageNum(f)));
        }
        assert_eq!(pmm.alloc_contiguous(2), Some(a));
    }

    #[test]
    fn used_blocks_tracks_net_allocations() {
        let mut rng = StdRng::seed_from_u64(0x05_32);
        let mut pmm = allocator(4 * MIB);
        let base = pmm.used_blocks();
        let mut live: Vec<PhysPageNum> = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                if let Some(frame) = pmm.alloc() {
                    assert!(!live.contains(&frame), "{:?} handed out twice", frame);
                    live.push(frame);
                }
            } else {
                let frame = live.swap_remove(rng.gen_range(0..live.len()));
                pmm.dealloc(frame);
            }
            assert_eq!(pmm.used_blocks(), base + live.len());
        }
        for frame in &live {
            assert!(pmm.is_used(*frame));
        }
    }
}
