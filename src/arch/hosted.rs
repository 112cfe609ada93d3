//! A [`Machine`] for running the kernel core inside a host process.
//!
//! Physical memory is a zeroed heap arena and physical address `pa` is simply
//! `arena + pa`. Privileged state (active directory, `esp0`, the interrupt
//! flag) is recorded so tests can observe what the kernel asked the hardware
//! to do.

use super::Machine;
use crate::mm::{PhysAddr, VirtAddr};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use lazy_static::*;
use spin::Mutex;

lazy_static! {
    /// Everything printed on the console since start-up.
    static ref TRANSCRIPT: Mutex<String> = Mutex::new(String::new());
}

pub(super) fn write_str(s: &str) {
    TRANSCRIPT.lock().push_str(s);
}

/// Copy of the console output so far.
pub fn transcript() -> String {
    TRANSCRIPT.lock().clone()
}

pub struct HostedMachine {
    /// Start of the arena standing in for physical memory.
    base: *mut u64,
    /// Arena length in `u64` words.
    words: usize,
    paging: AtomicBool,
    active_directory: AtomicUsize,
    kernel_stack: AtomicUsize,
    interrupts: AtomicBool,
    tlb_flushes: Mutex<Vec<VirtAddr>>,
}

// The arena is only reached through raw pointers handed out by `phys_to_ptr`,
// exactly like real physical memory.
unsafe impl Send for HostedMachine {}
unsafe impl Sync for HostedMachine {}

impl HostedMachine {
    /// A machine with `memory_size` bytes of zeroed physical memory.
    pub fn new(memory_size: usize) -> Self {
        let words = memory_size / core::mem::size_of::<u64>();
        let arena: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        Self {
            base: Box::into_raw(arena) as *mut u64,
            words,
            paging: AtomicBool::new(false),
            active_directory: AtomicUsize::new(0),
            kernel_stack: AtomicUsize::new(0),
            interrupts: AtomicBool::new(false),
            tlb_flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn memory_size(&self) -> usize {
        self.words * core::mem::size_of::<u64>()
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging.load(Ordering::SeqCst)
    }

    /// Last value written to `esp0`.
    pub fn kernel_stack(&self) -> usize {
        self.kernel_stack.load(Ordering::SeqCst)
    }

    /// Drain the list of virtual addresses flushed from the TLB.
    pub fn take_tlb_flushes(&self) -> Vec<VirtAddr> {
        core::mem::take(&mut *self.tlb_flushes.lock())
    }
}

impl Drop for HostedMachine {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.base, self.words,
            )));
        }
    }
}

impl Machine for HostedMachine {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        assert!(
            pa.0 < self.memory_size(),
            "{:?} is outside of {:#x} bytes of physical memory",
            pa,
            self.memory_size()
        );
        unsafe { (self.base as *mut u8).add(pa.0) }
    }

    fn enable_paging(&self, dir: PhysAddr) {
        self.activate(dir);
        self.paging.store(true, Ordering::SeqCst);
    }

    fn activate(&self, dir: PhysAddr) {
        self.active_directory.store(dir.0, Ordering::SeqCst);
    }

    fn active_directory(&self) -> PhysAddr {
        PhysAddr(self.active_directory.load(Ordering::SeqCst))
    }

    fn flush_tlb(&self, va: VirtAddr) {
        self.tlb_flushes.lock().push(va);
    }

    fn set_kernel_stack(&self, esp0: usize) {
        self.kernel_stack.store(esp0, Ordering::SeqCst);
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_addressed_by_physical_address() {
        let machine = HostedMachine::new(0x4000);
        unsafe {
            *machine.phys_to_ptr(PhysAddr(0x1234)) = 0x5a;
            assert_eq!(*machine.phys_to_ptr(PhysAddr(0x1234)), 0x5a);
            assert_eq!(*machine.phys_to_ptr(PhysAddr(0x1235)), 0);
        }
    }

    #[test]
    #[should_panic]
    fn address_past_the_arena_faults() {
        let machine = HostedMachine::new(0x1000);
        machine.phys_to_ptr(PhysAddr(0x1000));
    }

    #[test]
    fn records_privileged_state() {
        let machine = HostedMachine::new(0x1000);
        machine.enable_paging(PhysAddr(0x3000));
        machine.set_kernel_stack(0x40_2000);
        machine.flush_tlb(VirtAddr(0x40_0000));
        assert!(machine.paging_enabled());
        assert_eq!(machine.active_directory(), PhysAddr(0x3000));
        assert_eq!(machine.kernel_stack(), 0x40_2000);
        assert_eq!(machine.take_tlb_flushes(), vec![VirtAddr(0x40_0000)]);
        assert!(machine.take_tlb_flushes().is_empty());
    }
}
