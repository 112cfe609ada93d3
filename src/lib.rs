//! os32: the core of a small 32-bit x86 protected-mode kernel
//!
//! Various facilities of the kernel are implemented as submodules. The most
//! important ones are:
//!
//! - [`mm`]: the frame allocator, page directories and the heaps
//! - [`loader`]: ELF32 executables into a fresh address space
//! - [`task`]: processes, threads and the round-robin scheduler
//! - [`syscall`]: the `int 0x72` system call table
//!
//! Everything talks to the processor through [`arch::Machine`]. On bare metal
//! (`i686`, `target_os = "none"`) the boot code calls [`boot::run`], which
//! builds the [`kernel::Kernel`], starts the init process and idles; from
//! then on the timer interrupt drives the scheduler. On any other target the
//! same core runs against a hosted machine, which is how the unit tests
//! exercise it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod console;
pub mod arch;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod boot;
pub mod config;
pub mod fs;
pub mod kernel;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod lang_items;
pub mod loader;
pub mod logging;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
#[cfg(test)]
mod testing;
pub mod trap;
