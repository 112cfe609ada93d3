//! Memory management implementation
//!
//! Two-level x86 paging (4KiB pages, 4MiB directory slots), and everything
//! about memory management, like the frame bitmap, page tables, address
//! spaces and the first-fit heaps, is implemented here.
//!
//! Every process owns one page directory; the kernel directory is the
//! template every new directory is cloned from.

mod address;
mod address_space;
mod frame_allocator;
pub mod heap;
mod page_table;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use address_space::{Frame, MemoryManager, TRAMPOLINE_CODE};
pub use frame_allocator::{BitmapFrameAllocator, FrameAllocator, MemoryRegion};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};

use crate::config::{USER_SPACE_END, USER_SPACE_START};

/// Failures of the frame allocator and page-table code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtAddr),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtAddr),
    #[error("{0:?} is outside of user space")]
    NotInUserSpace(VirtAddr),
}

/// Whether `va` lies in the per-process part of an address space.
pub fn is_user_address(va: VirtAddr) -> bool {
    (USER_SPACE_START..USER_SPACE_END).contains(&va.0)
}
