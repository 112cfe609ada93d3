//! Console syscalls
use super::SYSCALL_ERROR;
use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::trap::TrapFrame;
use alloc::string::String;

/// Print the NUL-terminated string at `ebx`.
///
/// # Return
/// Bytes printed, or `SYSCALL_ERROR` if the string is not readable.
pub fn sys_print(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    let Ok(id) = kernel.current_thread() else {
        return SYSCALL_ERROR;
    };
    let space = kernel.tasks.process(id.process).space;
    match kernel
        .mm
        .translated_c_bytes(space, VirtAddr(frame.ebx as usize), PAGE_SIZE)
    {
        Ok(bytes) => {
            print!("{}", String::from_utf8_lossy(&bytes));
            bytes.len() as u32
        }
        Err(_) => SYSCALL_ERROR,
    }
}
