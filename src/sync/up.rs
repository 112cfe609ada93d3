use crate::arch::Machine;
use alloc::sync::Arc;
use core::cell::{RefCell, RefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wrap a static data structure inside it so that we are
/// able to access it without any `unsafe`.
///
/// We should only use it in uniprocessor.
///
/// In order to get mutable reference of inner data, call
/// `exclusive_access`.
pub struct UPSafeCell<T> {
    /// inner data
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// User is responsible to guarantee that inner struct is only used in
    /// uniprocessor.
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Panic if the data has been borrowed.
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

/// Scheduling switch of the single core.
///
/// While at least one [`PreemptGuard`] is alive, interrupts are masked and the
/// timer tick leaves the running thread in place. Guards nest; the interrupt
/// flag seen by the outermost one is restored when the last guard drops.
pub struct Preemption {
    machine: Arc<dyn Machine>,
    /// exclusive access count
    nested_level: AtomicUsize,
    intr_before_masking: AtomicBool,
}

impl Preemption {
    pub fn new(machine: Arc<dyn Machine>) -> Self {
        Self {
            machine,
            nested_level: AtomicUsize::new(0),
            intr_before_masking: AtomicBool::new(false),
        }
    }

    /// Mask interrupts and suspend rescheduling until the guard drops.
    pub fn disable(self: &Arc<Self>) -> PreemptGuard {
        let intr = self.machine.interrupts_enabled();
        self.machine.disable_interrupts();
        if self.nested_level.fetch_add(1, Ordering::SeqCst) == 0 {
            self.intr_before_masking.store(intr, Ordering::SeqCst);
        }
        PreemptGuard(self.clone())
    }

    /// The timer may switch threads.
    pub fn is_enabled(&self) -> bool {
        self.nested_level.load(Ordering::SeqCst) == 0
    }
}

/// Re-enables preemption on drop, whichever way the scope is left.
#[must_use = "preemption is enabled again as soon as the guard is dropped"]
pub struct PreemptGuard(Arc<Preemption>);

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        let preemption = &self.0;
        if preemption.nested_level.fetch_sub(1, Ordering::SeqCst) == 1
            && preemption.intr_before_masking.load(Ordering::SeqCst)
        {
            preemption.machine.enable_interrupts();
        }
    }
}
