//! Implementation of syscalls
//!
//! The single entry point to all system calls, [`syscall()`], is called
//! whenever userspace executes `int 0x72`. The call index is in `eax` and
//! the arguments in `ebx`, `ecx`, `edx`, `esi` and `edi`; the result goes
//! back in `eax`.
//!
//! Each call is a plain function in one of the submodules, named `sys_`
//! followed by the call's name. Indices without a function (the console
//! input and VFS calls served by collaborators) and indices past the table
//! return `u32::MAX`.
mod fs;
mod memory;
mod process;

use crate::kernel::Kernel;
use crate::trap::TrapFrame;
use fs::*;
use memory::*;
use process::*;

pub const SYSCALL_PRINT: usize = 0;
pub const SYSCALL_GETS: usize = 1;
pub const SYSCALL_CLEAR: usize = 2;
pub const SYSCALL_FORK: usize = 3;
pub const SYSCALL_EXIT: usize = 4;
pub const SYSCALL_END_PROCESS: usize = 5;
pub const SYSCALL_FOPEN: usize = 6;
pub const SYSCALL_FCLOSE: usize = 7;
pub const SYSCALL_PWD: usize = 8;
pub const SYSCALL_MALLOC: usize = 9;
pub const SYSCALL_FREE: usize = 10;

/// Returned for unknown calls and failures.
pub const SYSCALL_ERROR: u32 = u32::MAX;

type Handler = fn(&mut Kernel, &TrapFrame) -> u32;

static SYSCALLS: [Option<Handler>; 11] = [
    Some(sys_print),
    None,
    None,
    Some(sys_fork),
    Some(sys_exit),
    Some(sys_end_process),
    None,
    None,
    Some(sys_pwd),
    Some(sys_malloc),
    Some(sys_free),
];

/// Dispatch the call selected by `frame.eax` and store its result there.
pub fn syscall(kernel: &mut Kernel, frame: &mut TrapFrame) {
    let id = frame.eax as usize;
    log::trace!("[syscall] {} ({:#x}, {:#x})", id, frame.ebx, frame.ecx);
    frame.eax = match SYSCALLS.get(id).copied().flatten() {
        Some(handler) => handler(kernel, frame),
        None => SYSCALL_ERROR,
    };
}
