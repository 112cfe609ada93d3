//! Placement of the per-thread regions in a process address space
//!
//! | user address space        |                      |
//! |---------------------------|----------------------|
//! |        ...                | --high               |
//! |  heap of slot 1           | user, 1 page         |
//! |  kernel stack of slot 1   | supervisor, 1 page   |
//! |  user stack of slot 1     | user, 1 page         |
//! |  heap of slot 0           |                      |
//! |  kernel stack of slot 0   |                      |
//! |  user stack of slot 0     | <- page_ceil(image end) |
//! |  image                    | <- image_base        |
//! |        ...                | --low                |

use crate::config::{MAX_THREADS_PER_PROCESS, PAGE_SIZE, USER_SPACE_END};
use crate::mm::VirtAddr;
use core::ops::Range;

/// One slot holds a user stack, a kernel stack and a heap page.
pub const SLOT_SIZE: usize = 3 * PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("slot {0} does not fit in the address space")]
    NoRoom(usize),
}

/// Pages owned by one thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRegion {
    pub stack: VirtAddr,
    pub kernel_stack: VirtAddr,
    pub heap: VirtAddr,
}

impl ThreadRegion {
    pub fn stack_top(&self) -> usize {
        self.stack.0 + PAGE_SIZE
    }

    /// `esp0` while the thread runs.
    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.0 + PAGE_SIZE
    }

    pub fn pages(&self) -> [VirtAddr; 3] {
        [self.stack, self.kernel_stack, self.heap]
    }
}

/// Image range and thread slots of one process, computed once after loading.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserLayout {
    image: Range<usize>,
    slots_base: usize,
    max_slots: usize,
}

impl UserLayout {
    pub fn new(image_base: usize, image_size: usize) -> Self {
        let image_end = image_base + image_size;
        let slots_base = image_end.next_multiple_of(PAGE_SIZE);
        let max_slots = (USER_SPACE_END.saturating_sub(slots_base) / SLOT_SIZE)
            .min(MAX_THREADS_PER_PROCESS);
        Self {
            image: image_base..image_end,
            slots_base,
            max_slots,
        }
    }

    pub fn image(&self) -> Range<usize> {
        self.image.clone()
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn region(&self, slot: usize) -> Result<ThreadRegion, LayoutError> {
        if slot >= self.max_slots {
            return Err(LayoutError::NoRoom(slot));
        }
        let stack = self.slots_base + slot * SLOT_SIZE;
        Ok(ThreadRegion {
            stack: VirtAddr(stack),
            kernel_stack: VirtAddr(stack + PAGE_SIZE),
            heap: VirtAddr(stack + 2 * PAGE_SIZE),
        })
    }
}
