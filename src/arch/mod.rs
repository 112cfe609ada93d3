//! The narrow interface between the kernel core and the processor.
//!
//! Everything above this module (frame allocator, page tables, heaps, loader,
//! scheduler) only talks to the hardware through [`Machine`]. The core is
//! written once and runs either on a real i686 machine ([`x86`]) or on a host
//! process that emulates physical memory with a byte arena
//! ([`HostedMachine`]).

use crate::mm::{PhysAddr, VirtAddr};

#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(not(target_os = "none"))]
pub use hosted::{transcript, HostedMachine};

#[cfg(all(target_os = "none", not(target_arch = "x86")))]
compile_error!("os32 only runs on 32-bit x86 when built for bare metal");

/// Privileged operations the kernel core needs from the processor.
///
/// Implementations are used from interrupt context, so every method must be
/// callable with interrupts masked.
pub trait Machine: Send + Sync {
    /// Kernel pointer through which the byte at physical address `pa` is reached.
    ///
    /// Before paging is on this is the identity; afterwards it goes through the
    /// physical window at `PHYS_WINDOW_BASE`.
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8;

    /// Load `dir` and turn paging on. Called once, with the kernel directory.
    fn enable_paging(&self, dir: PhysAddr);

    /// Make `dir` the active page directory (`cr3`).
    fn activate(&self, dir: PhysAddr);

    /// Physical address of the active page directory.
    fn active_directory(&self) -> PhysAddr;

    /// Drop the cached translation of `va` (`invlpg`).
    fn flush_tlb(&self, va: VirtAddr);

    /// Stack loaded on the next ring 3 to ring 0 transition (`TSS.esp0`).
    fn set_kernel_stack(&self, esp0: usize);

    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);
}

/// Write a string to the kernel console.
pub fn console_write(s: &str) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::serial::write_str(s);
    #[cfg(not(target_os = "none"))]
    hosted::write_str(s);
}
