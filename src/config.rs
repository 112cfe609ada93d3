//! Constants used in the kernel

/// 4096byte == 4KiB
pub const PAGE_SIZE: usize = 0x1000;
/// Bit width of intra-page offset
pub const PAGE_SIZE_BITS: usize = 0xc;
/// Number of 32-bit entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bytes covered by one page directory entry (4MiB).
pub const BYTES_PER_TABLE: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Real-mode memory, BIOS data and VGA holes. Never handed out by the frame allocator.
pub const LOW_MEMORY_END: usize = 0x10_0000;
/// End of the identity-mapped region shared by every address space (directory entry 0).
pub const KERNEL_IDENTITY_END: usize = BYTES_PER_TABLE;

/// First user virtual address (directory entry 1).
pub const USER_SPACE_START: usize = KERNEL_IDENTITY_END;
/// Page holding the user-executable exit stub.
///
/// Entry points return here, so `main` returning `n` ends its process with code `n`.
pub const TRAMPOLINE: usize = 0xBFFF_F000;
/// End (exclusive) of the range a process may map.
///
/// The 4MiB slot holding the trampoline uses a page table shared by every
/// address space, so user mappings stop below it.
pub const USER_SPACE_END: usize = 0xBFC0_0000;

/// Kernel view of physical memory, built from 4MiB pages.
///
/// | Virtual address range       | Contents                     |
/// |-----------------------------|------------------------------|
/// | `0x0000_0000..0x0040_0000`  | kernel identity (supervisor) |
/// | `0x0040_0000..0xBFC0_0000`  | user space                   |
/// | `0xBFC0_0000..0xC000_0000`  | trampoline (last page)       |
/// | `0xC000_0000..`             | physical window              |
pub const PHYS_WINDOW_BASE: usize = 0xC000_0000;
/// Largest amount of physical memory reachable through the window (1GiB).
pub const PHYS_WINDOW_SIZE: usize = 0x4000_0000;

/// 0x100000byte == 1MiB
pub const KERNEL_HEAP_SIZE: usize = 0x10_0000;
/// Sentinel written into every heap header.
pub const HEAP_MAGIC: u32 = 0xA0_B0C0;

/// Ticks a thread runs before the scheduler considers switching it out.
pub const TIME_SLICE: usize = 20;
/// First thread id handed out; 0 and 1 belong to the idle and boot contexts.
pub const FIRST_TID: usize = 2;
/// Upper bound on simultaneously live threads of one process.
pub const MAX_THREADS_PER_PROCESS: usize = 64;

/// Software interrupt used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x72;
/// IRQ0 after the PIC remap.
pub const TIMER_VECTOR: u8 = 32;
/// Exit code reported for a thread killed by a CPU fault.
pub const FAULT_EXIT_CODE: u32 = 1;

/// Chunk size used when reading an executable.
pub const FILE_BLOCK_SIZE: usize = 512;

/// Default working directory of new processes.
pub const DEFAULT_CWD: &str = "/";
