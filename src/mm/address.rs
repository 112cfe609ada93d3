//! Implementation of physical and virtual address and page number.

use super::PageTableEntry;
use crate::arch::Machine;
use crate::config::{ENTRIES_PER_TABLE, PAGE_SIZE, PAGE_SIZE_BITS};
use core::fmt::{self, Debug, Formatter};

// Definitions

/// # Physical address(32bit)
///
/// | BitNum  |31----------------12|11---------0|
/// |---------|--------------------|------------|
/// | Meaning | PhysicalPageNumber | PageOffset |
/// |  Width  |         20         |     12     |
///
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default)]
pub struct PhysAddr(pub usize);

/// # Virtual address(32bit)
///
/// | BitNum  |31---------22|21---------12|11---------0|
/// |---------|-------------|-------------|------------|
/// | Meaning | Directory   | Table       | PageOffset |
/// |  Width  |     10      |     10      |     12     |
///
/// - Directory: index into the page directory, selects a page table (4MiB of address space).
/// - Table: index into that page table, selects one 4KiB page.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default)]
pub struct VirtAddr(pub usize);

/// # Physical page number (frame number)
/// - 32(PhysAddr) - 12(offset) = 20bit
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysPageNum(pub usize);

/// # Virtual page number
/// - 32(VirtAddr) - 12(offset) = 20bit
///
/// | Meaning | Directory | Table |
/// |---------|-----------|-------|
/// |  Width  |    10     |  10   |
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtPageNum(pub usize);

/// Debugging

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}

impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}

impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}

/// T: {PhysAddr, VirtAddr, PhysPageNum, VirtPageNum}
/// T -> usize: T.0
/// usize -> T: usize.into()

impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<PhysAddr> for usize {
    fn from(v: PhysAddr) -> Self {
        v.0
    }
}

impl From<PhysPageNum> for usize {
    fn from(v: PhysPageNum) -> Self {
        v.0
    }
}

impl From<VirtAddr> for usize {
    fn from(v: VirtAddr) -> Self {
        v.0
    }
}

impl From<VirtPageNum> for usize {
    fn from(v: VirtPageNum) -> Self {
        v.0
    }
}

impl VirtAddr {
    /// Page containing this address.
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }

    /// First page starting at or after this address.
    pub fn ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl From<VirtAddr> for VirtPageNum {
    fn from(v: VirtAddr) -> Self {
        assert_eq!(v.page_offset(), 0);
        v.floor()
    }
}

impl From<VirtPageNum> for VirtAddr {
    /// `VirtPageNum` by 2**`PAGE_SIZE_BITS(12)` to get `VirtAddr`
    fn from(v: VirtPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}

impl PhysAddr {
    /// Truncate to a multiple of PAGE_SIZE.
    ///
    /// # Examples
    ///
    /// ```
    /// use os32::mm::PhysAddr;
    ///
    /// assert_eq!(PhysAddr(4097 * 2).floor().0, 2);
    /// ```
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }

    /// Round up to a multiple of PAGE_SIZE.
    ///
    /// # Examples
    ///
    /// ```
    /// use os32::mm::PhysAddr;
    ///
    /// assert_eq!(PhysAddr(4096 * 2).ceil().0, 2);
    /// assert_eq!(PhysAddr(4097 * 2).ceil().0, 3);
    /// ```
    pub fn ceil(&self) -> PhysPageNum {
        PhysPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    /// Only the offset(12 bits) is taken from the physical address and returned.
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl From<PhysAddr> for PhysPageNum {
    fn from(v: PhysAddr) -> Self {
        assert_eq!(v.page_offset(), 0);
        v.floor()
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(v: PhysPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}

impl VirtPageNum {
    /// Split the page number into `[directory index, table index]`.
    pub fn indexes(&self) -> [usize; 2] {
        [
            (self.0 >> 10) & (ENTRIES_PER_TABLE - 1),
            self.0 & (ENTRIES_PER_TABLE - 1),
        ]
    }
}

impl PhysPageNum {
    /// View this frame as a page table (or the page directory).
    ///
    /// The frame is reached through [`Machine::phys_to_ptr`], so the slice is
    /// valid in whichever address space is active.
    #[allow(clippy::mut_from_ref)]
    pub fn get_pte_array<'a>(&self, machine: &'a dyn Machine) -> &'a mut [PageTableEntry] {
        let pa: PhysAddr = (*self).into();
        unsafe {
            core::slice::from_raw_parts_mut(
                machine.phys_to_ptr(pa) as *mut PageTableEntry,
                ENTRIES_PER_TABLE,
            )
        }
    }

    /// View this frame as 4096 raw bytes.
    #[allow(clippy::mut_from_ref)]
    pub fn get_bytes_array<'a>(&self, machine: &'a dyn Machine) -> &'a mut [u8] {
        let pa: PhysAddr = (*self).into();
        unsafe { core::slice::from_raw_parts_mut(machine.phys_to_ptr(pa), PAGE_SIZE) }
    }
}

pub trait StepByOne {
    fn step(&mut self);
}

impl StepByOne for VirtPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}

#[derive(Copy, Clone)]
/// a simple range structure for type T
pub struct SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    l: T,
    r: T,
}

impl<T> SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(start: T, end: T) -> Self {
        assert!(start <= end, "start {:?} > end {:?}!", start, end);
        Self { l: start, r: end }
    }
}

impl<T> IntoIterator for SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    type IntoIter = SimpleRangeIterator<T>;
    fn into_iter(self) -> Self::IntoIter {
        SimpleRangeIterator::new(self.l, self.r)
    }
}

/// iterator for the simple range structure
pub struct SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    current: T,
    end: T,
}

impl<T> SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(l: T, r: T) -> Self {
        Self { current: l, end: r }
    }
}

impl<T> Iterator for SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            None
        } else {
            let t = self.current;
            self.current.step();
            Some(t)
        }
    }
}

/// a simple range structure for virtual page number
pub type VPNRange = SimpleRange<VirtPageNum>;
