//! Trap handling functionality
//!
//! Every interrupt, CPU exception and system call enters the kernel through
//! a stub that pushes a [`TrapFrame`] on the current kernel stack. Three
//! kinds of traps reach the core:
//!
//! - the timer tick (vector 32), which drives [`crate::task::TaskManager::timer_tick`];
//! - the system call gate (vector 0x72), dispatched by [`crate::syscall::syscall`];
//! - the CPU faults listed in [`Fault`], handled by [`crate::kernel::Kernel::handle_fault`].
mod context;

pub use context::*;

/// CPU exceptions the kernel installs handlers for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    DivideError,
    InvalidOpcode,
    GeneralProtection,
    PageFault,
}

impl Fault {
    pub const VECTORS: [u8; 4] = [0, 6, 13, 14];

    pub fn from_vector(vector: u32) -> Option<Self> {
        match vector {
            0 => Some(Self::DivideError),
            6 => Some(Self::InvalidOpcode),
            13 => Some(Self::GeneralProtection),
            14 => Some(Self::PageFault),
            _ => None,
        }
    }
}
