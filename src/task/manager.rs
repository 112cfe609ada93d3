//!Implementation of [`TaskManager`]
use super::{Process, ProcessId, ProcessInfo, TaskState, Thread, ThreadId};
use crate::arch::Machine;
use crate::config::FIRST_TID;
use crate::mm::PhysAddr;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::trace;

/// What the processor is executing between two timer ticks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Running {
    /// The boot context: no thread has run yet, or nothing is runnable.
    Idle,
    Thread(ThreadId),
    /// The thread that ran last has been torn down and its stack is gone.
    /// Carries its process if that one is still alive.
    Exited(Option<ProcessId>),
}

/// Where the timer stub resumes: the kernel stack holding the incoming
/// trap frame and the page directory to load just before switching to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Switch {
    pub kernel_esp: usize,
    pub directory: PhysAddr,
}

/// A round-robin scheduler over a ring of processes, each with a ring of threads.
pub struct TaskManager {
    pub(super) processes: BTreeMap<ProcessId, Process>,
    /// Scheduler position in the process ring; `None` when the ring is empty.
    pub(super) current: Option<ProcessId>,
    pub(super) running: Running,
    /// Stack pointer of the interrupted boot context.
    idle_esp: usize,
    next_tid: usize,
    /// Ticks since the running thread was switched in.
    slice_ticks: usize,
    /// Ticks since boot.
    ticks: u64,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    ///Create an empty `TaskManager`
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            current: None,
            running: Running::Idle,
            idle_esp: 0,
            next_tid: FIRST_TID,
            slice_ticks: 0,
            ticks: 0,
        }
    }

    pub(super) fn alloc_tid(&mut self) -> usize {
        self.next_tid += 1;
        self.next_tid - 1
    }

    pub fn get_process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_thread(&self, id: ThreadId) -> Option<&Thread> {
        self.get_process(id.process)?.threads.get(id.key)
    }

    /// # Panic
    /// If `pid` does not name a live process; the rings only hold live ones.
    pub fn process(&self, pid: ProcessId) -> &Process {
        match self.processes.get(&pid) {
            Some(process) => process,
            None => panic!("no process {:?}", pid),
        }
    }

    pub(super) fn process_mut(&mut self, pid: ProcessId) -> &mut Process {
        match self.processes.get_mut(&pid) {
            Some(process) => process,
            None => panic!("no process {:?}", pid),
        }
    }

    /// # Panic
    /// If `id` does not name a live thread.
    pub fn thread(&self, id: ThreadId) -> &Thread {
        match self.get_thread(id) {
            Some(thread) => thread,
            None => panic!("no thread {:?}", id),
        }
    }

    pub(super) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.process_mut(id.process).threads.get_mut(id.key) {
            Some(thread) => thread,
            None => panic!("no thread {:?}", id),
        }
    }

    pub fn running(&self) -> Running {
        self.running
    }

    /// The thread executing right now, if any.
    pub fn current_thread(&self) -> Option<ThreadId> {
        match self.running {
            Running::Thread(id) => Some(id),
            _ => None,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// State of `pid`. Process ids are never reused, so a process that has
    /// been torn down reports [`TaskState::Stopped`] for good.
    pub fn process_state(&self, pid: ProcessId) -> TaskState {
        self.get_process(pid)
            .map_or(TaskState::Stopped, |process| process.state)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// A summary of every queued process, in scheduling order.
    pub fn process_list(&self) -> Vec<ProcessInfo> {
        self.ring()
            .into_iter()
            .map(|pid| ProcessInfo::from(self.process(pid)))
            .collect()
    }

    /// Processes in scheduling order, starting at the scheduler position.
    pub fn ring(&self) -> Vec<ProcessId> {
        let mut ring = Vec::new();
        if let Some(start) = self.current {
            let mut pid = start;
            loop {
                ring.push(pid);
                pid = self.process(pid).next;
                if pid == start {
                    break;
                }
            }
        }
        ring
    }

    /// Insert `pid` right after the scheduler position.
    pub(super) fn link_process(&mut self, pid: ProcessId) {
        match self.current {
            None => {
                let process = self.process_mut(pid);
                process.next = pid;
                process.prev = pid;
                self.current = Some(pid);
            }
            Some(cur) => {
                let next = self.process(cur).next;
                let process = self.process_mut(pid);
                process.prev = cur;
                process.next = next;
                self.process_mut(cur).next = pid;
                self.process_mut(next).prev = pid;
            }
        }
    }

    /// Remove `pid` from the ring; the scheduler position moves back one so
    /// the process after `pid` is the next one to run.
    pub(super) fn unlink_process(&mut self, pid: ProcessId) {
        let (prev, next) = {
            let process = self.process(pid);
            (process.prev, process.next)
        };
        if next == pid {
            if self.current == Some(pid) {
                self.current = None;
            }
            return;
        }
        self.process_mut(prev).next = next;
        self.process_mut(next).prev = prev;
        if self.current == Some(pid) {
            self.current = Some(prev);
        }
        let process = self.process_mut(pid);
        process.next = pid;
        process.prev = pid;
    }

    /// Insert `id` into its process's ring right after `after`.
    pub(super) fn link_thread(&mut self, after: ThreadId, id: ThreadId) {
        let next = self.thread(after).next;
        let thread = self.thread_mut(id);
        thread.prev = after.key;
        thread.next = next;
        self.thread_mut(after).next = id.key;
        self.thread_mut(ThreadId::new(id.process, next)).prev = id.key;
    }

    /// Remove `id` from its ring. If the process would have resumed at `id`,
    /// it resumes at the thread after it.
    pub(super) fn unlink_thread(&mut self, id: ThreadId) {
        let (prev, next) = {
            let thread = self.thread(id);
            (thread.prev, thread.next)
        };
        if next == id.key {
            return;
        }
        self.thread_mut(ThreadId::new(id.process, prev)).next = next;
        self.thread_mut(ThreadId::new(id.process, next)).prev = prev;
        let process = self.process_mut(id.process);
        if process.active == id.key {
            process.active = next;
            process.slices = process.slices.saturating_sub(1);
        }
        let thread = self.thread_mut(id);
        thread.next = id.key;
        thread.prev = id.key;
    }

    /// Account for one timer tick.
    ///
    /// The running thread keeps the processor until its time slice is used
    /// up; with `preemptible == false` it keeps it regardless. `saved_esp`
    /// is where the interrupted context's trap frame sits.
    pub fn timer_tick(
        &mut self,
        machine: &dyn Machine,
        kernel_directory: PhysAddr,
        saved_esp: usize,
        preemptible: bool,
    ) -> Switch {
        self.ticks += 1;
        self.slice_ticks += 1;
        let stay = Switch {
            kernel_esp: saved_esp,
            directory: machine.active_directory(),
        };
        if !preemptible {
            return stay;
        }
        if let Running::Thread(id) = self.running {
            if self.slice_ticks < self.thread(id).time_slice {
                return stay;
            }
        }
        self.schedule(machine, kernel_directory, saved_esp)
    }

    /// Save the outgoing context and pick the next thread.
    ///
    /// The current process's thread ring is exhausted first, one slice per
    /// thread starting where the process last left off; then the next
    /// ACTIVE process in ring order runs. With nothing runnable the boot
    /// context resumes on the kernel directory.
    pub fn schedule(
        &mut self,
        machine: &dyn Machine,
        kernel_directory: PhysAddr,
        saved_esp: usize,
    ) -> Switch {
        self.slice_ticks = 0;
        match self.running {
            Running::Idle => self.idle_esp = saved_esp,
            Running::Thread(id) => self.thread_mut(id).kernel_esp = saved_esp,
            Running::Exited(_) => {}
        }
        match self.pick_next() {
            Some(id) => {
                self.running = Running::Thread(id);
                let thread = self.thread(id);
                machine.set_kernel_stack(thread.region.kernel_stack_top());
                trace!("[sched] switch to thread {}", thread.tid);
                Switch {
                    kernel_esp: thread.kernel_esp,
                    directory: self.process(id.process).space.token(),
                }
            }
            None => {
                self.running = Running::Idle;
                Switch {
                    kernel_esp: self.idle_esp,
                    directory: kernel_directory,
                }
            }
        }
    }

    fn pick_next(&mut self) -> Option<ThreadId> {
        let current = self.current?;
        let candidate = match self.running {
            Running::Thread(id) if id.process == current => Some(self.thread(id).next),
            Running::Exited(Some(pid)) if pid == current => Some(self.process(pid).active),
            _ => None,
        };
        if let Some(key) = candidate {
            let process = self.process_mut(current);
            process.active = key;
            if process.state == TaskState::Active && process.slices < process.threads.len() {
                process.slices += 1;
                return Some(ThreadId::new(current, key));
            }
        }
        let include_current = self.running == Running::Idle;
        let pid = self.next_active_process(current, include_current)?;
        self.current = Some(pid);
        let process = self.process_mut(pid);
        process.slices = 1;
        Some(ThreadId::new(pid, process.active))
    }

    fn next_active_process(&self, start: ProcessId, include_start: bool) -> Option<ProcessId> {
        let mut pid = if include_start {
            start
        } else {
            self.process(start).next
        };
        for _ in 0..self.processes.len() {
            if self.process(pid).state == TaskState::Active {
                return Some(pid);
            }
            pid = self.process(pid).next;
        }
        None
    }
}
