//! ## Two-level x86 page tables (32bit entries, 4KiB pages)

use super::{FrameAllocator, MemoryError, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use crate::arch::Machine;
use bitflags::*;

bitflags! {
    pub struct PTEFlags: u32 {
        /// Present:
        /// - The entry is used for translation only if this bit is 1.
        const PRESENT = 1 << 0;
        /// Read/Write:
        /// - Writes are allowed to the page (or, in a directory entry, the 4MiB range).
        const WRITABLE = 1 << 1;
        /// User/Supervisor:
        /// - Ring 3 may access the page. Must be set in both the directory
        ///   and the table entry for a user access to succeed.
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// Set by the processor on any access.
        const ACCESSED = 1 << 5;
        /// Set by the processor on a write (table entries only).
        const DIRTY = 1 << 6;
        /// Page size (directory entries only): the entry maps a 4MiB page directly.
        const HUGE = 1 << 7;
        /// Not flushed from the TLB on a `cr3` reload.
        const GLOBAL = 1 << 8;
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
///
/// # Page table entry(32bit)
///
/// The same layout is used by page directory entries (pointing at a page table)
/// and page table entries (pointing at a frame).
///
/// | Bit number  |31-------12|11--9| 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
/// |-------------|-----------|-----|---|---|---|---|---|---|---|---|---|
/// | Bit meaning |    PPN    | AVL | G |PS | D | A |PCD|PWT|U/S|R/W| P |
/// | Bit width   |    20     |  3  | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 |
pub struct PageTableEntry {
    pub bits: u32,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ((ppn.0 as u32) << 12) | flags.bits(),
        }
    }

    /// generate an all-zero PageTableEntry (not present)
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    ///  get Physical Page Number.
    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum((self.bits >> 12) as usize)
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits & 0xfff)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PTEFlags::PRESENT)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::WRITABLE)
    }

    pub fn user(&self) -> bool {
        self.flags().contains(PTEFlags::USER)
    }

    pub fn is_huge(&self) -> bool {
        self.flags().contains(PTEFlags::HUGE)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("PTE({:?}, {:?})", self.ppn(), self.flags()))
    }
}

/// # Page table
///
/// A handle on the two-level structure rooted at one page directory frame.
/// It owns nothing: the frames of the directory and its tables are released
/// explicitly by [`super::MemoryManager`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    /// Create a handle from the physical address of a page directory (the `cr3` value).
    pub fn from_token(token: PhysAddr) -> Self {
        Self {
            root_ppn: token.floor(),
        }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// Physical address of the directory, as loaded into `cr3`.
    pub fn token(&self) -> PhysAddr {
        self.root_ppn.into()
    }

    /// The 1024 directory entries.
    pub fn directory<'a>(&self, machine: &'a dyn Machine) -> &'a mut [PageTableEntry] {
        self.root_ppn.get_pte_array(machine)
    }

    /// Finds the page table entry for `vpn`, creating (and zero-filling) the
    /// page table that holds it if the directory entry is not present.
    ///
    /// A freshly created table is reachable from ring 3; the access rights of
    /// each page are decided by its table entry.
    pub fn find_pte_create<'a>(
        &self,
        machine: &'a dyn Machine,
        frames: &mut dyn FrameAllocator,
        vpn: VirtPageNum,
    ) -> Result<&'a mut PageTableEntry, MemoryError> {
        let [dir_idx, table_idx] = vpn.indexes();
        let pde = &mut self.directory(machine)[dir_idx];
        if pde.is_huge() {
            return Err(MemoryError::NotInUserSpace(VirtAddr::from(vpn)));
        }
        if !pde.is_present() {
            let frame = frames.alloc().ok_or(MemoryError::OutOfFrames)?;
            frame.get_bytes_array(machine).fill(0);
            *pde = PageTableEntry::new(
                frame,
                PTEFlags::PRESENT | PTEFlags::WRITABLE | PTEFlags::USER,
            );
        }
        Ok(&mut pde.ppn().get_pte_array(machine)[table_idx])
    }

    /// Finds the page table entry for `vpn`.
    ///
    /// Returns `None` if no page table covers `vpn`, or if the range is mapped
    /// by a 4MiB directory entry.
    pub fn find_pte<'a>(
        &self,
        machine: &'a dyn Machine,
        vpn: VirtPageNum,
    ) -> Option<&'a mut PageTableEntry> {
        let [dir_idx, table_idx] = vpn.indexes();
        let pde = self.directory(machine)[dir_idx];
        if !pde.is_present() || pde.is_huge() {
            return None;
        }
        Some(&mut pde.ppn().get_pte_array(machine)[table_idx])
    }

    /// Present `PageTableEntry` mapping `vpn`, or `None`.
    pub fn translate(&self, machine: &dyn Machine, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(machine, vpn)
            .map(|pte| *pte)
            .filter(|pte| pte.is_present())
    }

    /// Physical address backing `va`, following 4MiB directory entries too.
    pub fn translate_va(&self, machine: &dyn Machine, va: VirtAddr) -> Option<PhysAddr> {
        let [dir_idx, _] = va.floor().indexes();
        let pde = self.directory(machine)[dir_idx];
        if pde.is_present() && pde.is_huge() {
            let base: PhysAddr = pde.ppn().into();
            return Some(PhysAddr(base.0 + (va.0 & (crate::config::BYTES_PER_TABLE - 1))));
        }
        self.translate(machine, va.floor()).map(|pte| {
            let base: PhysAddr = pte.ppn().into();
            PhysAddr(base.0 + va.page_offset())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HostedMachine;
    use crate::mm::{BitmapFrameAllocator, MemoryRegion};

    const MEMORY: usize = 0x20_0000;

    fn setup() -> (HostedMachine, BitmapFrameAllocator, PageTable) {
        let machine = HostedMachine::new(MEMORY);
        let mut frames =
            BitmapFrameAllocator::init(MEMORY, &[MemoryRegion::new(0, MEMORY)], &[]);
        let root = frames.alloc().unwrap();
        (machine, frames, PageTable::from_token(root.into()))
    }

    #[test]
    fn entry_packs_frame_and_flags() {
        let pte = PageTableEntry::new(PhysPageNum(0x1234), PTEFlags::PRESENT | PTEFlags::USER);
        assert_eq!(pte.bits, 0x0123_4005);
        assert_eq!(pte.ppn(), PhysPageNum(0x1234));
        assert!(pte.is_present() && pte.user() && !pte.writable());
    }

    #[test]
    fn find_pte_create_allocates_one_zeroed_table() {
        let (machine, mut frames, pt) = setup();
        let used = frames.used_blocks();
        let vpn = VirtAddr(0x80_0000).floor();
        assert!(pt.find_pte(&machine, vpn).is_none());

        let pte = pt.find_pte_create(&machine, &mut frames, vpn).unwrap();
        assert!(!pte.is_present());
        *pte = PageTableEntry::new(PhysPageNum(0x150), PTEFlags::PRESENT);
        assert_eq!(frames.used_blocks(), used + 1);

        // same table serves the neighbour page
        pt.find_pte_create(&machine, &mut frames, VirtPageNum(vpn.0 + 1))
            .unwrap();
        assert_eq!(frames.used_blocks(), used + 1);
        assert_eq!(
            pt.translate_va(&machine, VirtAddr(0x80_0123)),
            Some(PhysAddr(0x15_0123))
        );
        assert_eq!(pt.translate(&machine, VirtPageNum(vpn.0 + 1)), None);
    }

    #[test]
    fn huge_directory_entries_translate_but_refuse_tables() {
        let (machine, mut frames, pt) = setup();
        pt.directory(&machine)[768] =
            PageTableEntry::new(PhysPageNum(0), PTEFlags::PRESENT | PTEFlags::HUGE);
        assert_eq!(
            pt.translate_va(&machine, VirtAddr(0xC000_5000)),
            Some(PhysAddr(0x5000))
        );
        assert!(pt
            .find_pte_create(&machine, &mut frames, VirtAddr(0xC000_0000).floor())
            .is_err());
    }
}
