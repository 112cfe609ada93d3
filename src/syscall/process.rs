//! Process management syscalls
use super::SYSCALL_ERROR;
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::trap::TrapFrame;
use log::warn;

/// Start a thread sharing the caller's process.
///
/// # Return
/// - in the parent: the child's tid
/// - in the child: 0
pub fn sys_fork(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    match kernel.fork_current(frame) {
        Ok(tid) => tid as u32,
        Err(err) => {
            warn!("[kernel] fork failed: {}", err);
            SYSCALL_ERROR
        }
    }
}

/// Stop the calling thread with exit code `ebx`.
pub fn sys_exit(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    kernel.stop_current(frame.ebx);
    0
}

/// End the calling process with exit code `ebx`; `main` returning lands here.
pub fn sys_end_process(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    kernel.end_current(frame.ebx);
    0
}

/// Copy the working directory into the `ecx` byte buffer at `ebx`.
///
/// The copy is truncated to fit and always NUL-terminated.
///
/// # Return
/// Bytes copied without the NUL
pub fn sys_pwd(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    let Ok(id) = kernel.current_thread() else {
        return SYSCALL_ERROR;
    };
    let len = frame.ecx as usize;
    if len == 0 {
        return 0;
    }
    let process = kernel.tasks.process(id.process);
    let cwd = process.cwd.as_bytes();
    let n = cwd.len().min(len - 1);
    let mut buf = alloc::vec::Vec::with_capacity(n + 1);
    buf.extend_from_slice(&cwd[..n]);
    buf.push(0);
    match kernel
        .mm
        .write_user_buffer(process.space, VirtAddr(frame.ebx as usize), &buf)
    {
        Ok(()) => n as u32,
        Err(_) => SYSCALL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{kernel, running_kernel};
    use crate::syscall::{syscall, SYSCALL_MALLOC, SYSCALL_PWD};
    use pretty_assertions::assert_eq;

    fn pwd(kernel: &mut Kernel, buf: u32, len: u32) -> u32 {
        let mut frame = TrapFrame::user_entry(0x80_0000, 0x80_2ff4);
        frame.eax = SYSCALL_PWD as u32;
        frame.ebx = buf;
        frame.ecx = len;
        syscall(kernel, &mut frame);
        frame.eax
    }

    #[test]
    fn pwd_truncates_and_terminates() {
        let (_machine, mut kernel) = kernel();
        kernel.set_working_directory("/usr/share");
        let pid = kernel.start_process("/bin/app", &[]).unwrap();
        kernel.timer_tick(0x1000);
        let space = kernel.tasks.process(pid).space;
        let mut frame = TrapFrame::user_entry(0x80_0000, 0x80_2ff4);
        frame.eax = SYSCALL_MALLOC as u32;
        frame.ebx = 16;
        syscall(&mut kernel, &mut frame);
        let buf = frame.eax;

        assert_eq!(pwd(&mut kernel, buf, 16), 10);
        assert_eq!(
            kernel.mm.translated_str(space, VirtAddr(buf as usize), 16).unwrap(),
            "/usr/share"
        );
        assert_eq!(pwd(&mut kernel, buf, 5), 4);
        assert_eq!(
            kernel.mm.translated_str(space, VirtAddr(buf as usize), 16).unwrap(),
            "/usr"
        );
        assert_eq!(pwd(&mut kernel, buf, 0), 0);
    }

    #[test]
    fn pwd_rejects_kernel_buffers() {
        let (_machine, mut kernel, _id) = running_kernel();
        assert_eq!(pwd(&mut kernel, 0x1000, 16), SYSCALL_ERROR);
    }
}
