//! User heap syscalls
use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;
use crate::mm::heap::user_heap;
use crate::trap::TrapFrame;
use log::{trace, warn};

/// Allocate `ebx` bytes from the calling thread's heap.
///
/// # Return
/// The block address, 0 when the heap is full
pub fn sys_malloc(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    let Ok(id) = kernel.current_thread() else {
        return 0;
    };
    let space = kernel.tasks.process(id.process).space;
    let heap = kernel.tasks.thread(id).region.heap;
    let block = user_heap(&kernel.mm, space, heap)
        .and_then(|mut list| list.allocate(frame.ebx as usize))
        .map_or(0, |offset| heap.0 + offset);
    trace!("[syscall] malloc({}) = {:#x}", frame.ebx, block);
    block as u32
}

/// Give back the block at `ebx`; anything else is ignored.
pub fn sys_free(kernel: &mut Kernel, frame: &TrapFrame) -> u32 {
    let Ok(id) = kernel.current_thread() else {
        return 0;
    };
    let space = kernel.tasks.process(id.process).space;
    let heap = kernel.tasks.thread(id).region.heap;
    let ptr = frame.ebx as usize;
    let released = (heap.0..heap.0 + PAGE_SIZE).contains(&ptr)
        && user_heap(&kernel.mm, space, heap).is_some_and(|mut list| list.release(ptr - heap.0));
    if !released {
        warn!("[syscall] free of {:#x} ignored", ptr);
    }
    0
}
