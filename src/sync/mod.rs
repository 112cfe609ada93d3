//! Synchronization on a single core
mod up;

pub use up::{PreemptGuard, Preemption, UPSafeCell};
