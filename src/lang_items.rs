//! Panic handler and global allocator of the bare-metal kernel
use crate::arch::x86::serial;
use crate::config::KERNEL_HEAP_SIZE;
use crate::mm::heap::KernelHeap;
use core::arch::asm;
use core::panic::PanicInfo;

#[global_allocator]
static KERNEL_HEAP: KernelHeap<KERNEL_HEAP_SIZE> = KernelHeap::new();

/// Prints the location and message, then stops the machine.
///
/// ```text
/// [kernel] Panicked at src/kernel.rs:135 PageFault in kernel mode at 0x101a2c
/// ```
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        asm!("cli", options(nomem, nostack));
        serial::force_unlock();
    }
    if let Some(location) = info.location() {
        println!(
            "[kernel] Panicked at {}:{} {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        println!("[kernel] Panicked: {}", info.message());
    }
    shutdown()
}

/// Leave QEMU through the `isa-debug-exit` device.
#[cfg(feature = "board_qemu")]
fn shutdown() -> ! {
    unsafe { crate::arch::x86::outb(0xF4, 0x01) }
    halt()
}

#[cfg(not(feature = "board_qemu"))]
fn shutdown() -> ! {
    halt()
}

fn halt() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}
