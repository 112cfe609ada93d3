//! Hand-over from the boot code.
//!
//! The boot code programs the GDT (with the descriptor from
//! [`tss_descriptor`](crate::arch::x86::tss_descriptor)), the IDT, the PIC
//! and the PIT, then calls [`run`] on its own stack with interrupts masked.
//! That stack becomes the idle context the scheduler falls back to.
use crate::arch::x86::{self, X86Machine};
use crate::fs::FileSystem;
use crate::kernel::{BootInfo, Kernel};
use crate::sync::UPSafeCell;
use alloc::boxed::Box;
use alloc::sync::Arc;
use lazy_static::*;
use log::{error, info};

lazy_static! {
    static ref KERNEL: UPSafeCell<Option<Kernel>> = unsafe { UPSafeCell::new(None) };
}

/// Run `f` on the kernel once [`run`] has built it.
///
/// Only called from interrupt gates and the boot path, with interrupts masked.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    KERNEL.exclusive_access().as_mut().map(f)
}

/// Bring up memory management, start `init_path` and idle.
pub fn run(info: BootInfo, fs: Box<dyn FileSystem>, init_path: &str) -> ! {
    x86::serial::init();
    crate::logging::init();
    let machine = Arc::new(X86Machine::new());
    let mut kernel = match Kernel::new(machine.clone(), &info, fs) {
        Ok(kernel) => kernel,
        Err(err) => panic!("cannot set up paging: {}", err),
    };
    match kernel.start_process(init_path, &[]) {
        Ok(pid) => info!("[kernel] init is {:?}", pid),
        Err(err) => error!("[kernel] cannot start {}: {}", init_path, err),
    }
    *KERNEL.exclusive_access() = Some(kernel);
    x86::trap::install();
    loop {
        machine.idle();
    }
}
