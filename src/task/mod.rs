//! Process and thread management
//!
//! Processes sit in a circular ring walked by the scheduler; each process
//! owns its page directory and a ring of threads sharing it. Records live in
//! arenas and link to each other by index, so a half-finished update can
//! never leave a dangling pointer behind.
//!
//! A single [`TaskManager`] owns every record. All of its mutating
//! operations are called with preemption disabled, either from an interrupt
//! gate or under a [`crate::sync::PreemptGuard`].
//!
//! ```text
//!            +-----------+      +-----------+      +-----------+
//!  current ->| process A |----->| process B |----->| process C |--+
//!            +-----------+      +-----------+      +-----------+  |
//!              ^  threads: main <-> t1 <-> t2                     |
//!              +--------------------------------------------------+
//! ```
mod id;
mod layout;
mod manager;
mod process;
mod thread;

use crate::fs::FsError;
use crate::loader::ElfError;
use crate::mm::MemoryError;
use core::fmt;

pub use id::{ProcessId, RecycleAllocator, Slab, ThreadId};
pub use layout::{LayoutError, ThreadRegion, UserLayout, SLOT_SIZE};
pub use manager::{Running, Switch, TaskManager};
pub use process::{Process, ProcessInfo};
pub use thread::Thread;

/// Lifecycle of processes and threads: `New -> Active -> Stopped`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Being built, not visible to the scheduler.
    New,
    Active,
    /// Terminal.
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::Stopped => "STOPPED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("user heap exhausted")]
    HeapExhausted,
    #[error("no thread is running")]
    NoCurrentThread,
}
