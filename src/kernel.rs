//! The kernel object: memory, tasks and the file system behind one owner.
//!
//! Interrupt entry points and the boot path reach the core only through
//! [`Kernel`]. Every operation that changes the process ring runs under a
//! [`PreemptGuard`](crate::sync::PreemptGuard).
use crate::arch::Machine;
use crate::config::{DEFAULT_CWD, FAULT_EXIT_CODE};
use crate::fs::{FileSystem, FsError};
use crate::mm::{MemoryError, MemoryManager, MemoryRegion};
use crate::sync::Preemption;
use crate::task::{ProcessError, ProcessId, Switch, TaskManager, TaskState, ThreadId};
use crate::trap::{Fault, TrapFrame};
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use log::{info, warn};

/// Memory description handed over by the boot code.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    /// Bytes of physical memory.
    pub total_memory: usize,
    /// Ranges the firmware reports as usable RAM.
    pub usable: Vec<MemoryRegion>,
    /// Physical ranges to keep away from the allocator (kernel image, modules).
    pub reserved: Vec<Range<usize>>,
}

pub struct Kernel {
    pub mm: MemoryManager,
    pub tasks: TaskManager,
    preemption: Arc<Preemption>,
    fs: Box<dyn FileSystem>,
    cwd: String,
}

impl Kernel {
    /// Bring up the frame allocator and paging, with no process yet.
    pub fn new(
        machine: Arc<dyn Machine>,
        info: &BootInfo,
        fs: Box<dyn FileSystem>,
    ) -> Result<Self, MemoryError> {
        let mm = MemoryManager::new(
            machine.clone(),
            info.total_memory,
            &info.usable,
            &info.reserved,
        )?;
        info!(
            "[kernel] {} KiB of memory, {} frames free",
            info.total_memory / 1024,
            mm.frames().free_blocks()
        );
        Ok(Self {
            mm,
            tasks: TaskManager::new(),
            preemption: Arc::new(Preemption::new(machine)),
            fs,
            cwd: DEFAULT_CWD.to_string(),
        })
    }

    pub fn machine(&self) -> &dyn Machine {
        self.mm.machine()
    }

    pub fn preemption(&self) -> &Arc<Preemption> {
        &self.preemption
    }

    /// Working directory given to processes started from now on.
    pub fn working_directory(&self) -> &str {
        &self.cwd
    }

    pub fn set_working_directory(&mut self, path: &str) {
        self.cwd = path.to_string();
    }

    /// Load the executable at `path` and queue it after the scheduler position.
    pub fn start_process(&mut self, path: &str, args: &[&str]) -> Result<ProcessId, ProcessError> {
        let _guard = self.preemption.disable();
        let mut file = self.fs.open(path)?;
        if file.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()).into());
        }
        let image = file.read_all();
        self.tasks
            .start_process(&mut self.mm, path, &image, args, &self.cwd)
    }

    /// Poll target for a foreground wait: `Stopped` once `pid` is gone.
    pub fn process_state(&self, pid: ProcessId) -> TaskState {
        self.tasks.process_state(pid)
    }

    /// Print one line per queued process to the console.
    pub fn print_processes(&self) {
        println!(" PID STATE    THR DIRECTORY  IMAGE NAME");
        for info in self.tasks.process_list() {
            println!("{}", info);
        }
    }

    /// Timer interrupt: `saved_esp` points at the interrupted trap frame.
    pub fn timer_tick(&mut self, saved_esp: usize) -> Switch {
        let preemptible = self.preemption.is_enabled();
        let kernel_directory = self.mm.kernel_space().token();
        self.tasks
            .timer_tick(self.mm.machine(), kernel_directory, saved_esp, preemptible)
    }

    pub fn current_thread(&self) -> Result<ThreadId, ProcessError> {
        self.tasks
            .current_thread()
            .ok_or(ProcessError::NoCurrentThread)
    }

    /// Fork the running thread from its system call frame.
    pub fn fork_current(&mut self, frame: &TrapFrame) -> Result<usize, ProcessError> {
        let _guard = self.preemption.disable();
        let id = self.current_thread()?;
        self.tasks.fork(&mut self.mm, id, frame)
    }

    /// Terminate the running thread; the main thread ends its process.
    pub fn stop_current(&mut self, code: u32) {
        let _guard = self.preemption.disable();
        if let Ok(id) = self.current_thread() {
            self.tasks.stop_thread(&mut self.mm, id, code);
        }
    }

    /// Terminate the running thread's process.
    pub fn end_current(&mut self, code: u32) {
        let _guard = self.preemption.disable();
        if let Ok(id) = self.current_thread() {
            self.tasks.end_process(&mut self.mm, id.process, code);
        }
    }

    /// A CPU exception: fatal in ring 0, the end of the thread in ring 3.
    pub fn handle_fault(&mut self, fault: Fault, frame: &TrapFrame) {
        if !frame.from_user() {
            panic!("{:?} in kernel mode at {:#x}", fault, frame.eip);
        }
        warn!("[kernel] {:?} at {:#x}, thread stopped", fault, frame.eip);
        self.stop_current(FAULT_EXIT_CODE);
    }
}
