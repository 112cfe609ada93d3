//! Address spaces: the kernel page directory and the per-process directories
//! cloned from it.
//!
//! | Directory slots | Contents                                   | Shared |
//! |-----------------|--------------------------------------------|--------|
//! | 0               | identity map of the low 4MiB (supervisor)  | yes    |
//! | 1..767          | user space, one table per 4MiB on demand   | no     |
//! | 767             | trampoline table (exit stub in its last page) | yes |
//! | 768..           | physical window, 4MiB pages (supervisor)   | yes    |
//!
//! Shared slots are written once while the kernel directory is built and
//! copied into every new directory, so interrupt handlers, the kernel heap and
//! the physical window are valid whichever directory is active. User mappings
//! are refused outside slots 1..767, which keeps the shared tables identical
//! everywhere.

use super::{
    is_user_address, BitmapFrameAllocator, FrameAllocator, MemoryError, MemoryRegion, PTEFlags,
    PageTable, PageTableEntry, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum,
};
use crate::arch::Machine;
use crate::config::{
    BYTES_PER_TABLE, ENTRIES_PER_TABLE, KERNEL_IDENTITY_END, PAGE_SIZE, PHYS_WINDOW_BASE,
    PHYS_WINDOW_SIZE, TRAMPOLINE, USER_SPACE_END, USER_SPACE_START,
};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use log::{debug, trace, warn};

/// Exit stub mapped at [`TRAMPOLINE`]: `mov ebx, eax; mov eax, 5; int 0x72; jmp $`.
///
/// It is pushed as the return address of every entry point, so the value
/// returned by `main` becomes the argument of the end-process system call.
pub const TRAMPOLINE_CODE: [u8; 11] = [
    0x89, 0xC3, 0xB8, 0x05, 0x00, 0x00, 0x00, 0xCD, 0x72, 0xEB, 0xFE,
];

/// Directory slots private to each address space.
const USER_SLOTS: Range<usize> = (USER_SPACE_START / BYTES_PER_TABLE)..(USER_SPACE_END / BYTES_PER_TABLE);

/// Backing frame requested from [`MemoryManager::map_physical`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Allocate and zero a fresh frame.
    Auto,
    /// Map this frame; ownership stays with the caller.
    Fixed(PhysPageNum),
}

/// The frame allocator together with the kernel address space.
///
/// Address spaces are plain [`PageTable`] handles; whoever created one is
/// responsible for unmapping what it mapped and for calling
/// [`MemoryManager::destroy_address_space`].
pub struct MemoryManager {
    machine: Arc<dyn Machine>,
    frames: BitmapFrameAllocator,
    kernel_space: PageTable,
}

impl MemoryManager {
    /// Initialise the frame bitmap, build the kernel directory and turn paging on.
    pub fn new(
        machine: Arc<dyn Machine>,
        total_memory: usize,
        usable: &[MemoryRegion],
        reserved: &[Range<usize>],
    ) -> Result<Self, MemoryError> {
        // frames are only reachable through the physical window
        let managed = total_memory.min(PHYS_WINDOW_SIZE);
        if managed < total_memory {
            warn!(
                "[vmm] {} MiB of memory above the physical window left unused",
                (total_memory - managed) >> 20
            );
        }
        let frames = BitmapFrameAllocator::init(managed, usable, reserved);
        let mut mm = Self {
            machine,
            frames,
            kernel_space: PageTable::from_token(PhysAddr(0)),
        };
        let root = mm.alloc_zeroed()?;
        mm.kernel_space = PageTable::from_token(root.into());
        mm.map_kernel_identity()?;
        mm.map_trampoline()?;
        mm.map_phys_window(managed);
        mm.machine.enable_paging(mm.kernel_space.token());
        debug!(
            "[vmm] kernel directory at {:?}, {} of {} frames free",
            mm.kernel_space.token(),
            mm.frames.free_blocks(),
            mm.frames.max_blocks()
        );
        Ok(mm)
    }

    /// Identity-map the first 4MiB for the kernel, leaving page 0 absent so a
    /// null dereference faults.
    fn map_kernel_identity(&mut self) -> Result<(), MemoryError> {
        let table = self.alloc_zeroed()?;
        let entries = table.get_pte_array(&*self.machine);
        for (i, pte) in entries
            .iter_mut()
            .enumerate()
            .take(KERNEL_IDENTITY_END / PAGE_SIZE)
            .skip(1)
        {
            *pte = PageTableEntry::new(
                PhysPageNum(i),
                PTEFlags::PRESENT | PTEFlags::WRITABLE | PTEFlags::GLOBAL,
            );
        }
        self.kernel_space.directory(&*self.machine)[0] =
            PageTableEntry::new(table, PTEFlags::PRESENT | PTEFlags::WRITABLE);
        Ok(())
    }

    fn map_trampoline(&mut self) -> Result<(), MemoryError> {
        let table = self.alloc_zeroed()?;
        let code = self.alloc_zeroed()?;
        code.get_bytes_array(&*self.machine)[..TRAMPOLINE_CODE.len()]
            .copy_from_slice(&TRAMPOLINE_CODE);
        let [dir_idx, table_idx] = VirtAddr(TRAMPOLINE).floor().indexes();
        table.get_pte_array(&*self.machine)[table_idx] =
            PageTableEntry::new(code, PTEFlags::PRESENT | PTEFlags::USER);
        self.kernel_space.directory(&*self.machine)[dir_idx] =
            PageTableEntry::new(table, PTEFlags::PRESENT | PTEFlags::USER);
        Ok(())
    }

    fn map_phys_window(&mut self, total_memory: usize) {
        let [first, _] = VirtAddr(PHYS_WINDOW_BASE).floor().indexes();
        let slots = total_memory.min(PHYS_WINDOW_SIZE).div_ceil(BYTES_PER_TABLE);
        let directory = self.kernel_space.directory(&*self.machine);
        for i in 0..slots {
            directory[first + i] = PageTableEntry::new(
                PhysPageNum(i * ENTRIES_PER_TABLE),
                PTEFlags::PRESENT | PTEFlags::WRITABLE | PTEFlags::HUGE | PTEFlags::GLOBAL,
            );
        }
    }

    fn alloc_zeroed(&mut self) -> Result<PhysPageNum, MemoryError> {
        let frame = self.frames.alloc().ok_or(MemoryError::OutOfFrames)?;
        frame.get_bytes_array(&*self.machine).fill(0);
        Ok(frame)
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn kernel_space(&self) -> PageTable {
        self.kernel_space
    }

    pub fn alloc_frame(&mut self) -> Option<PhysPageNum> {
        self.frames.alloc()
    }

    pub fn alloc_contiguous(&mut self, n: usize) -> Option<PhysPageNum> {
        self.frames.alloc_contiguous(n)
    }

    pub fn free_frame(&mut self, ppn: PhysPageNum) {
        self.frames.dealloc(ppn);
    }

    /// Allocate a page directory holding every shared kernel slot.
    pub fn create_address_space(&mut self) -> Result<PageTable, MemoryError> {
        let root = self.alloc_zeroed()?;
        let kernel = self.kernel_space.directory(&*self.machine);
        let directory = root.get_pte_array(&*self.machine);
        for (idx, pde) in directory.iter_mut().enumerate() {
            if !USER_SLOTS.contains(&idx) {
                *pde = kernel[idx];
            }
        }
        trace!("[vmm] new address space at {:?}", root);
        Ok(PageTable::from_token(root.into()))
    }

    /// Map the page containing `va` in `space`.
    ///
    /// The page table is created on demand. With [`Frame::Auto`] a zeroed
    /// frame is allocated; the mapped frame is returned either way.
    pub fn map_physical(
        &mut self,
        space: PageTable,
        va: VirtAddr,
        frame: Frame,
        flags: PTEFlags,
    ) -> Result<PhysPageNum, MemoryError> {
        if !is_user_address(va) {
            return Err(MemoryError::NotInUserSpace(va));
        }
        let vpn = va.floor();
        let pte = space.find_pte_create(&*self.machine, &mut self.frames, vpn)?;
        if pte.is_present() {
            return Err(MemoryError::AlreadyMapped(vpn.into()));
        }
        let ppn = match frame {
            Frame::Fixed(ppn) => ppn,
            Frame::Auto => {
                let ppn = self.frames.alloc().ok_or(MemoryError::OutOfFrames)?;
                ppn.get_bytes_array(&*self.machine).fill(0);
                ppn
            }
        };
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::PRESENT);
        self.machine.flush_tlb(vpn.into());
        trace!("[vmm] {:?} -> {:?} {:?}", vpn, ppn, flags);
        Ok(ppn)
    }

    /// Physical address `va` translates to in `space`.
    pub fn get_phys(&self, space: PageTable, va: VirtAddr) -> Option<PhysAddr> {
        space.translate_va(&*self.machine, va)
    }

    /// Present table entry for `va` in `space`.
    pub fn translate(&self, space: PageTable, va: VirtAddr) -> Option<PageTableEntry> {
        space.translate(&*self.machine, va.floor())
    }

    /// Add `flags` to an existing mapping.
    pub fn protect(
        &mut self,
        space: PageTable,
        va: VirtAddr,
        flags: PTEFlags,
    ) -> Result<(), MemoryError> {
        let vpn = va.floor();
        match space.find_pte(&*self.machine, vpn) {
            Some(pte) if pte.is_present() => {
                pte.bits |= flags.bits();
                self.machine.flush_tlb(vpn.into());
                Ok(())
            }
            _ => Err(MemoryError::NotMapped(va)),
        }
    }

    /// Remove the mapping of `va` and free its frame.
    ///
    /// Returns `false` if nothing was mapped there.
    pub fn unmap(&mut self, space: PageTable, va: VirtAddr) -> bool {
        match self.unmap_phys(space, va) {
            Some(ppn) => {
                self.frames.dealloc(ppn);
                true
            }
            None => false,
        }
    }

    /// Remove the mapping of `va`, leaving the frame allocated.
    pub fn unmap_phys(&mut self, space: PageTable, va: VirtAddr) -> Option<PhysPageNum> {
        if !is_user_address(va) {
            return None;
        }
        let vpn = va.floor();
        let pte = space.find_pte(&*self.machine, vpn)?;
        if !pte.is_present() {
            return None;
        }
        let ppn = pte.ppn();
        *pte = PageTableEntry::empty();
        self.machine.flush_tlb(vpn.into());
        Some(ppn)
    }

    /// Free the page table covering `va` and clear its directory entry.
    ///
    /// Every mapping in that 4MiB range disappears; the frames they pointed
    /// to are not freed.
    pub fn unmap_page_table(&mut self, space: PageTable, va: VirtAddr) -> bool {
        if !is_user_address(va) {
            return false;
        }
        let [dir_idx, _] = va.floor().indexes();
        let pde = &mut space.directory(&*self.machine)[dir_idx];
        if !pde.is_present() {
            return false;
        }
        let table = pde.ppn();
        *pde = PageTableEntry::empty();
        self.frames.dealloc(table);
        if self.machine.active_directory() == space.token() {
            self.machine.activate(space.token());
        }
        true
    }

    /// Free every user page table of `space` and the directory frame itself.
    ///
    /// Leaf frames must already have been unmapped by their owner. If `space`
    /// is active, the kernel directory is loaded first.
    pub fn destroy_address_space(&mut self, space: PageTable) {
        if space == self.kernel_space {
            warn!("[vmm] refusing to destroy the kernel directory");
            return;
        }
        if self.machine.active_directory() == space.token() {
            self.machine.activate(self.kernel_space.token());
        }
        let directory = space.directory(&*self.machine);
        for pde in &mut directory[USER_SLOTS] {
            if pde.is_present() {
                self.frames.dealloc(pde.ppn());
                *pde = PageTableEntry::empty();
            }
        }
        self.frames.dealloc(space.root_ppn());
        trace!("[vmm] destroyed address space at {:?}", space.token());
    }

    pub fn activate(&self, space: PageTable) {
        self.machine.activate(space.token());
    }

    /// Slices of the frames behind `[va, va + len)` in `space`, in order.
    ///
    /// With `user_only` every page must be accessible from ring 3.
    ///
    /// # Note
    ///
    /// The kernel virtual address range for this buffer may not be contiguous.
    #[allow(clippy::mut_from_ref)]
    fn translated_byte_buffer(
        &self,
        space: PageTable,
        va: VirtAddr,
        len: usize,
        user_only: bool,
    ) -> Result<Vec<&mut [u8]>, MemoryError> {
        let mut start = va.0;
        let end = start.checked_add(len).ok_or(MemoryError::NotInUserSpace(va))?;
        if len > 0 && (!is_user_address(va) || !is_user_address(VirtAddr(end - 1))) {
            return Err(MemoryError::NotInUserSpace(va));
        }
        let mut v = Vec::new();
        while start < end {
            let start_va = VirtAddr(start);
            let vpn = start_va.floor();
            let pte = space
                .translate(&*self.machine, vpn)
                .filter(|pte| !user_only || pte.user())
                .ok_or(MemoryError::NotMapped(start_va))?;
            let end_va = VirtAddr::from(VirtPageNum(vpn.0 + 1)).min(VirtAddr(end));
            let page = pte.ppn().get_bytes_array(&*self.machine);
            let stop = start_va.page_offset() + (end_va.0 - start);
            v.push(&mut page[start_va.page_offset()..stop]);
            start = end_va.0;
        }
        Ok(v)
    }

    /// Copy `data` to `va` in `space`, crossing pages as needed.
    pub fn copy_to_user(
        &self,
        space: PageTable,
        va: VirtAddr,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let mut copied = 0;
        for chunk in self.translated_byte_buffer(space, va, data.len(), false)? {
            chunk.copy_from_slice(&data[copied..copied + chunk.len()]);
            copied += chunk.len();
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `va` in `space` into `buf`.
    pub fn copy_from_user(
        &self,
        space: PageTable,
        va: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), MemoryError> {
        let mut copied = 0;
        for chunk in self.translated_byte_buffer(space, va, buf.len(), false)? {
            let n = chunk.len();
            buf[copied..copied + n].copy_from_slice(chunk);
            copied += n;
        }
        Ok(())
    }

    /// Set `len` bytes starting at `va` to `byte`.
    pub fn fill_user(
        &self,
        space: PageTable,
        va: VirtAddr,
        len: usize,
        byte: u8,
    ) -> Result<(), MemoryError> {
        for chunk in self.translated_byte_buffer(space, va, len, false)? {
            chunk.fill(byte);
        }
        Ok(())
    }

    /// Copy the whole page mapped at `from` over the page mapped at `to`.
    pub fn copy_page(
        &self,
        space: PageTable,
        from: VirtAddr,
        to: VirtAddr,
    ) -> Result<(), MemoryError> {
        let src = self.translate(space, from).ok_or(MemoryError::NotMapped(from))?;
        let dst = self.translate(space, to).ok_or(MemoryError::NotMapped(to))?;
        if src.ppn() != dst.ppn() {
            dst.ppn()
                .get_bytes_array(&*self.machine)
                .copy_from_slice(src.ppn().get_bytes_array(&*self.machine));
        }
        Ok(())
    }

    /// Copy `data` to a buffer supplied by user code; every page must be user-accessible.
    pub fn write_user_buffer(
        &self,
        space: PageTable,
        va: VirtAddr,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let mut copied = 0;
        for chunk in self.translated_byte_buffer(space, va, data.len(), true)? {
            chunk.copy_from_slice(&data[copied..copied + chunk.len()]);
            copied += chunk.len();
        }
        Ok(())
    }

    /// Read a NUL-terminated string supplied by user code, at most `max_len` bytes.
    pub fn translated_str(
        &self,
        space: PageTable,
        va: VirtAddr,
        max_len: usize,
    ) -> Result<String, MemoryError> {
        let bytes = self.translated_c_bytes(space, va, max_len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The raw bytes of a NUL-terminated user string, without the NUL.
    pub fn translated_c_bytes(
        &self,
        space: PageTable,
        va: VirtAddr,
        max_len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let mut bytes = Vec::new();
        let mut cursor = va;
        'pages: while bytes.len() < max_len {
            let room = PAGE_SIZE - cursor.page_offset();
            let take = room.min(max_len - bytes.len());
            for chunk in self.translated_byte_buffer(space, cursor, take, true)? {
                for &b in chunk.iter() {
                    if b == 0 {
                        break 'pages;
                    }
                    bytes.push(b);
                }
            }
            cursor = VirtAddr(cursor.0 + take);
        }
        Ok(bytes)
    }
}
