//! The i686 [`Machine`]: control registers, the TSS and port I/O.
pub mod serial;
pub mod trap;

use super::Machine;
use crate::config::PHYS_WINDOW_BASE;
use crate::mm::{PhysAddr, VirtAddr};
use core::arch::asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

const CR0_PG: u32 = 1 << 31;
const CR4_PSE: u32 = 1 << 4;
const CR4_PGE: u32 = 1 << 7;
const EFLAGS_IF: u32 = 1 << 9;

/// 32-bit task state segment. Only `ss0:esp0` is used: no hardware task
/// switching takes place.
#[repr(C, packed)]
pub struct TaskStateSegment {
    prev_task: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    trap: u16,
    iomap_base: u16,
}

struct TssCell(UnsafeCell<TaskStateSegment>);

// Written only with interrupts masked on the single core.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment {
    prev_task: 0,
    esp0: 0,
    ss0: crate::trap::KERNEL_DS,
    unused: [0; 22],
    trap: 0,
    iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
}));

/// Address and limit of the TSS, for the descriptor the boot code puts in the GDT.
pub fn tss_descriptor() -> (usize, usize) {
    (
        TSS.0.get() as usize,
        core::mem::size_of::<TaskStateSegment>() - 1,
    )
}

pub struct X86Machine {
    paging: AtomicBool,
}

impl X86Machine {
    pub const fn new() -> Self {
        Self {
            paging: AtomicBool::new(false),
        }
    }

    /// Wait for the next interrupt with interrupts enabled.
    pub fn idle(&self) {
        unsafe { asm!("sti", "hlt", options(nomem, nostack)) }
    }
}

impl Default for X86Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for X86Machine {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        if self.paging.load(Ordering::Relaxed) {
            (PHYS_WINDOW_BASE + pa.0) as *mut u8
        } else {
            pa.0 as *mut u8
        }
    }

    fn enable_paging(&self, dir: PhysAddr) {
        unsafe {
            asm!(
                "mov cr3, {dir}",
                "mov {tmp}, cr4",
                "or {tmp}, {cr4}",
                "mov cr4, {tmp}",
                "mov {tmp}, cr0",
                "or {tmp}, {cr0}",
                "mov cr0, {tmp}",
                dir = in(reg) dir.0,
                cr4 = const CR4_PSE | CR4_PGE,
                cr0 = const CR0_PG,
                tmp = out(reg) _,
                options(nostack),
            );
        }
        self.paging.store(true, Ordering::Relaxed);
    }

    fn activate(&self, dir: PhysAddr) {
        unsafe { asm!("mov cr3, {}", in(reg) dir.0, options(nostack)) }
    }

    fn active_directory(&self) -> PhysAddr {
        let cr3: usize;
        unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack)) }
        PhysAddr(cr3 & !0xFFF)
    }

    fn flush_tlb(&self, va: VirtAddr) {
        unsafe { asm!("invlpg [{}]", in(reg) va.0, options(nostack)) }
    }

    fn set_kernel_stack(&self, esp0: usize) {
        unsafe { (*TSS.0.get()).esp0 = esp0 as u32 }
    }

    fn interrupts_enabled(&self) -> bool {
        let eflags: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) eflags, options(nomem)) }
        eflags & EFLAGS_IF != 0
    }

    fn enable_interrupts(&self) {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    fn disable_interrupts(&self) {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }
}

#[inline]
pub(crate) unsafe fn outb(port: u16, value: u8) {
    asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}

#[inline]
pub(crate) unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!(
        "in al, dx",
        in("dx") port,
        out("al") value,
        options(nomem, nostack, preserves_flags)
    );
    value
}
