//! Interrupt entry stubs and the Rust code they call.
//!
//! Every stub saves the interrupted context as a [`TrapFrame`] on the
//! current kernel stack. The timer stub then loads the page directory and
//! kernel stack picked by the scheduler before restoring registers, so the
//! `iretd` resumes the incoming thread.
//!
//! Exiting threads and user faults cannot be torn down on the stack they
//! run on: the frame is parked in [`PENDING`] and the stub moves to the
//! reaper stack, which finishes the job and idles until the next tick.
use super::{outb, X86Machine};
use crate::arch::Machine;
use crate::boot::with_kernel;
use crate::config::{SYSCALL_VECTOR, TIMER_VECTOR};
use crate::sync::UPSafeCell;
use crate::syscall::{syscall, SYSCALL_END_PROCESS, SYSCALL_EXIT};
use crate::trap::{Fault, TrapFrame, KERNEL_CS, KERNEL_DS};
use core::arch::global_asm;
use lazy_static::*;

const REAPER_STACK_SIZE: usize = 0x2000;
/// Interrupt gate, ring 0 only.
const GATE_KERNEL: u8 = 0x8E;
/// Interrupt gate reachable with `int` from ring 3.
const GATE_USER: u8 = 0xEE;
const PIC1_COMMAND: u16 = 0x20;
const PIC_EOI: u8 = 0x20;

#[repr(C, align(16))]
struct ReaperStack([u8; REAPER_STACK_SIZE]);

static mut REAPER_STACK: ReaperStack = ReaperStack([0; REAPER_STACK_SIZE]);

#[derive(Copy, Clone, Debug)]
enum Reap {
    Syscall,
    Fault(Fault),
}

lazy_static! {
    static ref PENDING: UPSafeCell<Option<(Reap, TrapFrame)>> = unsafe { UPSafeCell::new(None) };
}

extern "C" {
    /// IDT setup lives in the boot code.
    fn install_interrupt_handler(vector: u8, flags: u8, selector: u16, handler: usize);

    fn __timer_entry();
    fn __syscall_entry();
    fn __fault_entry_0();
    fn __fault_entry_6();
    fn __fault_entry_13();
    fn __fault_entry_14();
}

global_asm!(
    r#"
.macro SAVE_ALL
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, {kernel_ds}
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
.endm

.macro RESTORE_ALL
    pop gs
    pop fs
    pop es
    pop ds
    popad
.endm

.global __timer_entry
__timer_entry:
    SAVE_ALL
    push esp
    call {timer}
    add esp, 4
    mov cr3, edx
    mov esp, eax
    RESTORE_ALL
    iretd

.global __syscall_entry
__syscall_entry:
    SAVE_ALL
    push esp
    call {syscall}
    add esp, 4
    test eax, eax
    jnz __enter_reaper
    RESTORE_ALL
    iretd

.macro FAULT_ENTRY vector, has_error
.global __fault_entry_\vector
__fault_entry_\vector:
    .if \has_error
    add esp, 4
    .endif
    SAVE_ALL
    push esp
    push \vector
    call {fault}
    add esp, 8
    jmp __enter_reaper
.endm

FAULT_ENTRY 0, 0
FAULT_ENTRY 6, 0
FAULT_ENTRY 13, 1
FAULT_ENTRY 14, 1

__enter_reaper:
    lea esp, [{stack} + {stack_size}]
    call {reap}
    ud2
"#,
    kernel_ds = const KERNEL_DS,
    timer = sym x86_timer_entry,
    syscall = sym x86_syscall_entry,
    fault = sym x86_fault_entry,
    reap = sym x86_reap,
    stack = sym REAPER_STACK,
    stack_size = const REAPER_STACK_SIZE,
);

/// Register the timer, system call and fault stubs.
pub fn install() {
    let selector = KERNEL_CS as u16;
    let faults: [(u8, unsafe extern "C" fn()); 4] = [
        (0, __fault_entry_0),
        (6, __fault_entry_6),
        (13, __fault_entry_13),
        (14, __fault_entry_14),
    ];
    unsafe {
        install_interrupt_handler(TIMER_VECTOR, GATE_KERNEL, selector, __timer_entry as usize);
        install_interrupt_handler(SYSCALL_VECTOR, GATE_USER, selector, __syscall_entry as usize);
        for (vector, entry) in faults {
            install_interrupt_handler(vector, GATE_KERNEL, selector, entry as usize);
        }
    }
}

/// # Return
/// `edx:eax` = directory to load : kernel stack to resume on
extern "C" fn x86_timer_entry(saved_esp: usize) -> u64 {
    unsafe { outb(PIC1_COMMAND, PIC_EOI) }
    let (esp, directory) = match with_kernel(|kernel| kernel.timer_tick(saved_esp)) {
        Some(switch) => (switch.kernel_esp, switch.directory.0),
        None => (saved_esp, X86Machine::new().active_directory().0),
    };
    ((directory as u64) << 32) | esp as u64
}

/// # Return
/// Nonzero when the call must run on the reaper stack.
extern "C" fn x86_syscall_entry(frame: &mut TrapFrame) -> u32 {
    let call = frame.eax as usize;
    if call == SYSCALL_EXIT || call == SYSCALL_END_PROCESS {
        *PENDING.exclusive_access() = Some((Reap::Syscall, *frame));
        return 1;
    }
    with_kernel(|kernel| syscall(kernel, frame));
    0
}

extern "C" fn x86_fault_entry(vector: u32, frame: &TrapFrame) {
    let Some(fault) = Fault::from_vector(vector) else {
        panic!("unexpected exception {}", vector);
    };
    if !frame.from_user() {
        panic!("{:?} in kernel mode at {:#x}", fault, frame.eip);
    }
    *PENDING.exclusive_access() = Some((Reap::Fault(fault), *frame));
}

extern "C" fn x86_reap() -> ! {
    let pending = PENDING.exclusive_access().take();
    if let Some((reason, mut frame)) = pending {
        with_kernel(|kernel| match reason {
            Reap::Syscall => syscall(kernel, &mut frame),
            Reap::Fault(fault) => kernel.handle_fault(fault, &frame),
        });
    }
    let machine = X86Machine::new();
    loop {
        machine.idle();
    }
}
