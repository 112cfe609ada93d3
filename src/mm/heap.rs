//! First-fit heap with splitting and coalescing.
//!
//! The same free list backs the kernel heap (a static arena behind the
//! global allocator) and every user heap (one page per thread, reached
//! through the physical window).
//!
//! ```text
//! +--------+---------+--------+---------+--------+----------------+
//! | header | payload | header | payload | header |      free      |
//! +--------+---------+--------+---------+--------+----------------+
//!     |                  ^  |                ^
//!     +---- next --------+  +---- next ------+
//! ```
//!
//! Headers chain from offset 0 to the end of the arena, so the sizes of all
//! blocks plus one header each add up to the arena length. `next` is an
//! offset from the arena start (0 ends the chain), which keeps a copied heap
//! page valid at any address.

use super::{PageTable, VirtAddr};
use crate::config::{HEAP_MAGIC, PAGE_SIZE};
use crate::mm::MemoryManager;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;
use spin::Mutex;

/// Bytes taken by a header in front of every block.
pub const HEADER_SIZE: usize = core::mem::size_of::<HeapHeader>();
/// Payload sizes and offsets are multiples of this.
pub const HEAP_ALIGN: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapHeader {
    pub magic: u32,
    /// Payload bytes following this header.
    pub size: u32,
    pub is_free: u32,
    /// Offset of the next header, 0 for the last block.
    pub next: u32,
}

impl HeapHeader {
    fn is_free(&self) -> bool {
        self.is_free != 0
    }
}

/// A free list laid over raw memory.
pub struct FreeList {
    base: *mut u8,
    len: usize,
}

// Only reached under the owner's lock (kernel heap) or with preemption off (user heaps).
unsafe impl Send for FreeList {}

impl FreeList {
    /// Format `[base, base + len)` as one free block.
    ///
    /// # Safety
    ///
    /// The range must be valid for writes, exclusively owned by the heap and
    /// aligned to 16 bytes.
    pub unsafe fn init(base: *mut u8, len: usize) -> Self {
        let len = len & !(HEAP_ALIGN - 1);
        let mut list = Self { base, len };
        list.write(
            0,
            HeapHeader {
                magic: HEAP_MAGIC,
                size: (len - HEADER_SIZE) as u32,
                is_free: 1,
                next: 0,
            },
        );
        list
    }

    /// Use a range previously formatted by [`FreeList::init`].
    ///
    /// # Safety
    ///
    /// Same as [`FreeList::init`]. A corrupted chain is tolerated: walking
    /// stops at the first header that is out of bounds or lacks the magic.
    pub unsafe fn attach(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len: len & !(HEAP_ALIGN - 1),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read(&self, offset: usize) -> HeapHeader {
        unsafe { ptr::read_unaligned(self.base.add(offset) as *const HeapHeader) }
    }

    fn write(&mut self, offset: usize, header: HeapHeader) {
        unsafe { ptr::write_unaligned(self.base.add(offset) as *mut HeapHeader, header) }
    }

    /// Every block of the chain as `(header offset, header)`.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            list: self,
            offset: Some(0),
        }
    }

    /// Allocate `len` bytes and return the payload offset.
    ///
    /// The first free block large enough is used; it is split when the
    /// remainder can hold a header plus [`HEAP_ALIGN`] bytes.
    pub fn allocate(&mut self, len: usize) -> Option<usize> {
        let want = len.max(1).checked_next_multiple_of(HEAP_ALIGN)?;
        let (offset, mut header) = self
            .blocks()
            .find(|(_, h)| h.is_free() && h.size as usize >= want)?;
        if header.size as usize >= want + HEADER_SIZE + HEAP_ALIGN {
            let rest = offset + HEADER_SIZE + want;
            self.write(
                rest,
                HeapHeader {
                    magic: HEAP_MAGIC,
                    size: header.size - (want + HEADER_SIZE) as u32,
                    is_free: 1,
                    next: header.next,
                },
            );
            header.size = want as u32;
            header.next = rest as u32;
        }
        header.is_free = 0;
        self.write(offset, header);
        Some(offset + HEADER_SIZE)
    }

    /// Free the block whose payload starts at `payload`.
    ///
    /// Anything that is not the payload of a live block (foreign pointer,
    /// double free, bad magic) is ignored and reported as `false`.
    pub fn release(&mut self, payload: usize) -> bool {
        let Some(target) = payload.checked_sub(HEADER_SIZE) else {
            return false;
        };
        let mut prev = None;
        let mut found = None;
        for (offset, header) in self.blocks() {
            if offset == target {
                found = Some(header);
                break;
            }
            prev = Some((offset, header));
        }
        let Some(mut header) = found else {
            return false;
        };
        if header.is_free() || header.magic != HEAP_MAGIC {
            return false;
        }
        header.is_free = 1;
        // user heaps are writable from ring 3: merge only forward, in bounds
        while header.next != 0 {
            let end = target + HEADER_SIZE + header.size as usize;
            let at = header.next as usize;
            if at < end || at.saturating_add(HEADER_SIZE) > self.len {
                break;
            }
            let next = self.read(at);
            if !next.is_free() || next.magic != HEAP_MAGIC {
                break;
            }
            let merged = match (at + HEADER_SIZE).checked_add(next.size as usize) {
                Some(merged) if merged <= self.len => merged,
                _ => break,
            };
            header.size = (merged - target - HEADER_SIZE) as u32;
            header.next = next.next;
        }
        match prev {
            Some((offset, mut p)) if p.is_free() => {
                let end = target + HEADER_SIZE + header.size as usize;
                p.size = (end - offset - HEADER_SIZE) as u32;
                p.next = header.next;
                self.write(offset, p);
            }
            _ => self.write(target, header),
        }
        true
    }

    /// Payload bytes currently allocated.
    pub fn used(&self) -> usize {
        self.blocks()
            .filter(|(_, h)| !h.is_free())
            .map(|(_, h)| h.size as usize)
            .sum()
    }
}

/// Iterator over the header chain, see [`FreeList::blocks`].
pub struct Blocks<'a> {
    list: &'a FreeList,
    offset: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = (usize, HeapHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        if offset + HEADER_SIZE > self.list.len {
            return None;
        }
        let header = self.list.read(offset);
        let end = offset + HEADER_SIZE + header.size as usize;
        if header.magic != HEAP_MAGIC || end > self.list.len {
            return None;
        }
        let next = header.next as usize;
        // offsets strictly increase, so a corrupted chain cannot loop
        if next != 0 && next >= end {
            self.offset = Some(next);
        }
        Some((offset, header))
    }
}

#[repr(C, align(4096))]
struct Arena<const N: usize>([u8; N]);

/// The kernel heap: a static arena handed out through [`GlobalAlloc`].
///
/// Requests aligned to more than [`HEAP_ALIGN`] fail.
pub struct KernelHeap<const N: usize> {
    arena: UnsafeCell<Arena<N>>,
    list: Mutex<Option<FreeList>>,
}

unsafe impl<const N: usize> Sync for KernelHeap<N> {}

impl<const N: usize> KernelHeap<N> {
    pub const fn new() -> Self {
        Self {
            arena: UnsafeCell::new(Arena([0; N])),
            list: Mutex::new(None),
        }
    }

    fn base(&self) -> *mut u8 {
        self.arena.get() as *mut u8
    }

    fn with_list<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        let mut list = self.list.lock();
        let list = list.get_or_insert_with(|| unsafe { FreeList::init(self.base(), N) });
        f(list)
    }

    /// Payload bytes currently allocated.
    pub fn used(&self) -> usize {
        self.with_list(|list| list.used())
    }
}

impl<const N: usize> Default for KernelHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for KernelHeap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        match self.with_list(|list| list.allocate(layout.size())) {
            Some(offset) => self.base().add(offset),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let offset = ptr as usize - self.base() as usize;
        if !self.with_list(|list| list.release(offset)) {
            log::warn!("[kheap] bad free of {:p}", ptr);
        }
    }
}

/// Format the page mapped at `base` in `space` as an empty user heap.
pub fn init_user_heap(mm: &MemoryManager, space: PageTable, base: VirtAddr) -> Option<FreeList> {
    let pa = mm.get_phys(space, base)?;
    Some(unsafe { FreeList::init(mm.machine().phys_to_ptr(pa), PAGE_SIZE) })
}

/// The free list of the user heap page mapped at `base` in `space`.
pub fn user_heap(mm: &MemoryManager, space: PageTable, base: VirtAddr) -> Option<FreeList> {
    let pa = mm.get_phys(space, base)?;
    Some(unsafe { FreeList::attach(mm.machine().phys_to_ptr(pa), PAGE_SIZE) })
}

/// Strings laid out in a user heap: the address of each NUL-terminated copy.
pub fn place_strings(
    mm: &MemoryManager,
    space: PageTable,
    base: VirtAddr,
    strings: &[&str],
) -> Option<Vec<VirtAddr>> {
    let mut heap = user_heap(mm, space, base)?;
    let mut placed = Vec::with_capacity(strings.len());
    for s in strings {
        let offset = heap.allocate(s.len() + 1)?;
        let va = VirtAddr(base.0 + offset);
        mm.copy_to_user(space, va, s.as_bytes()).ok()?;
        mm.fill_user(space, VirtAddr(va.0 + s.len()), 1, 0).ok()?;
        placed.push(va);
    }
    Some(placed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    struct Page(Vec<u64>);

    impl Page {
        fn new() -> Self {
            Self(vec![0; PAGE_SIZE / 8])
        }
        fn list(&mut self) -> FreeList {
            unsafe { FreeList::init(self.0.as_mut_ptr() as *mut u8, PAGE_SIZE) }
        }
    }

    fn check_sizes(list: &FreeList) {
        let total: usize = list
            .blocks()
            .map(|(_, h)| HEADER_SIZE + h.size as usize)
            .sum();
        assert_eq!(total, list.len());
    }

    #[test]
    fn init_writes_one_free_block() {
        let mut page = Page::new();
        let list = page.list();
        let blocks: Vec<_> = list.blocks().collect();
        assert_eq!(
            blocks,
            [(
                0,
                HeapHeader {
                    magic: HEAP_MAGIC,
                    size: (PAGE_SIZE - HEADER_SIZE) as u32,
                    is_free: 1,
                    next: 0
                }
            )]
        );
        assert_eq!(list.used(), 0);
    }

    #[test]
    fn allocation_splits_and_rounds() {
        let mut page = Page::new();
        let mut list = page.list();
        assert_eq!(list.allocate(10), Some(16));
        assert_eq!(list.allocate(16), Some(48));
        assert_eq!(list.used(), 32);
        let sizes: Vec<_> = list.blocks().map(|(o, h)| (o, h.size, h.is_free)).collect();
        assert_eq!(sizes, [(0, 16, 0), (32, 16, 0), (64, 4096 - 64 - 16, 1)]);
        check_sizes(&list);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let mut page = Page::new();
        let mut list = page.list();
        // leaves exactly 16 free bytes: not enough for a header plus payload
        let whole = PAGE_SIZE - HEADER_SIZE;
        assert_eq!(list.allocate(whole - 16), Some(16));
        assert_eq!(list.blocks().count(), 1);
        assert_eq!(list.allocate(1), None);
        check_sizes(&list);
    }

    #[test]
    fn allocate_then_release_restores_the_list() {
        let mut page = Page::new();
        let mut list = page.list();
        let a = list.allocate(100).unwrap();
        let before: Vec<_> = list.blocks().collect();

        let b = list.allocate(64).unwrap();
        assert!(list.release(b));
        assert_eq!(list.blocks().collect::<Vec<_>>(), before);

        assert!(list.release(a));
        assert_eq!(list.blocks().count(), 1);
        assert_eq!(list.used(), 0);
    }

    #[test]
    fn release_coalesces_both_neighbours() {
        let mut page = Page::new();
        let mut list = page.list();
        let a = list.allocate(32).unwrap();
        let b = list.allocate(32).unwrap();
        let c = list.allocate(32).unwrap();
        let _d = list.allocate(32).unwrap();
        assert!(list.release(a));
        assert!(list.release(c));
        assert_eq!(list.blocks().count(), 5);
        assert!(list.release(b));
        let blocks: Vec<_> = list.blocks().map(|(o, h)| (o, h.size, h.is_free)).collect();
        assert_eq!(blocks[0], (0, 32 * 3 + 32, 1));
        assert_eq!(blocks.len(), 3);
        check_sizes(&list);
    }

    #[test]
    fn bad_pointers_are_ignored() {
        let mut page = Page::new();
        let mut list = page.list();
        let a = list.allocate(32).unwrap();
        let snapshot: Vec<_> = list.blocks().collect();
        assert!(!list.release(0));
        assert!(!list.release(a + 8));
        assert!(!list.release(PAGE_SIZE * 2));
        assert_eq!(list.blocks().collect::<Vec<_>>(), snapshot);
        assert!(list.release(a));
        assert!(!list.release(a));
    }

    #[test]
    fn corrupted_magic_stops_the_walk() {
        let mut page = Page::new();
        let mut list = page.list();
        let a = list.allocate(32).unwrap();
        page.0[0] = 0;
        let list2 = unsafe { FreeList::attach(page.0.as_mut_ptr() as *mut u8, PAGE_SIZE) };
        assert_eq!(list2.blocks().count(), 0);
        assert!(!list.release(a));
        assert_eq!(list.allocate(8), None);
    }

    fn set_header_field(page: &mut Page, offset: usize, field: usize, value: u32) {
        unsafe {
            (page.0.as_mut_ptr() as *mut u8)
                .add(offset + field * 4)
                .cast::<u32>()
                .write_unaligned(value)
        }
    }

    #[test]
    fn self_linked_header_does_not_hang_release() {
        let mut page = Page::new();
        let mut list = page.list();
        let a = list.allocate(16).unwrap();
        // the free remainder at 32 now links to itself
        set_header_field(&mut page, 32, 3, 32);
        assert!(list.release(a));
        let blocks: Vec<_> = list.blocks().map(|(o, h)| (o, h.size, h.is_free)).collect();
        assert_eq!(blocks, [(0, (PAGE_SIZE - HEADER_SIZE) as u32, 1)]);
        assert_eq!(list.allocate(8), Some(16));
    }

    #[test]
    fn out_of_range_links_stop_coalescing() {
        for (field, value) in [(3, 0xFFFF_FFF0), (3, PAGE_SIZE as u32), (1, u32::MAX)] {
            let mut page = Page::new();
            let mut list = page.list();
            let a = list.allocate(16).unwrap();
            set_header_field(&mut page, 32, field, value);
            assert!(list.release(a));
            for (offset, header) in list.blocks() {
                assert!(offset + HEADER_SIZE + header.size as usize <= PAGE_SIZE);
            }
            assert_eq!(list.allocate(8), Some(16));
        }
    }

    #[test]
    fn random_allocations_never_overlap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut page = Page::new();
        let mut list = page.list();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for _ in 0..3000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let len = rng.gen_range(1..200);
                if let Some(p) = list.allocate(len) {
                    assert_eq!(p % HEAP_ALIGN, 0);
                    for &(q, qlen) in &live {
                        assert!(p + len <= q || q + qlen <= p, "{p}+{len} overlaps {q}+{qlen}");
                    }
                    live.push((p, len));
                }
            } else {
                let (p, _) = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(list.release(p));
            }
            check_sizes(&list);
            let adjacent_free = list
                .blocks()
                .zip(list.blocks().skip(1))
                .any(|((_, a), (_, b))| a.is_free() && b.is_free());
            assert!(!adjacent_free);
        }
        for (p, _) in live {
            assert!(list.release(p));
        }
        assert_eq!(list.blocks().count(), 1);
    }

    #[test]
    fn kernel_heap_serves_global_alloc_requests() {
        static HEAP: KernelHeap<8192> = KernelHeap::new();
        unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let p = HEAP.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % HEAP_ALIGN, 0);
            assert_eq!(HEAP.used(), 32);
            assert!(HEAP
                .alloc(Layout::from_size_align(16, 64).unwrap())
                .is_null());
            assert!(HEAP
                .alloc(Layout::from_size_align(9000, 8).unwrap())
                .is_null());
            HEAP.dealloc(p, layout);
            assert_eq!(HEAP.used(), 0);
        }
    }
}
