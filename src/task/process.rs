//! Process creation and teardown
use super::id::{RecycleAllocator, Slab};
use super::{
    ProcessError, ProcessId, Running, TaskManager, TaskState, Thread, ThreadId, UserLayout,
};
use crate::loader;
use crate::mm::{MemoryManager, PageTable, PhysAddr, VPNRange, VirtAddr};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use log::{debug, info, warn};

/// Process control block
pub struct Process {
    pub pid: ProcessId,
    /// Path of the executable.
    pub name: String,
    pub state: TaskState,
    pub space: PageTable,
    pub layout: UserLayout,
    pub cwd: String,
    pub(super) threads: Slab<Thread>,
    main: usize,
    /// Thread the process resumes at when the scheduler comes back to it.
    pub(super) active: usize,
    /// Threads run in the current rotation through this process.
    pub(super) slices: usize,
    pub(super) slots: RecycleAllocator,
    pub(super) next: ProcessId,
    pub(super) prev: ProcessId,
}

impl Process {
    fn new(pid: ProcessId, name: &str, space: PageTable, cwd: &str, main_tid: usize) -> Self {
        let mut threads = Slab::new();
        let main = threads.insert(Thread::new(main_tid, true));
        Self {
            pid,
            name: name.to_string(),
            state: TaskState::New,
            space,
            layout: UserLayout::default(),
            cwd: cwd.to_string(),
            threads,
            main,
            active: main,
            slices: 0,
            slots: RecycleAllocator::new(),
            next: pid,
            prev: pid,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn main_thread(&self) -> ThreadId {
        ThreadId::new(self.pid, self.main)
    }

    /// Threads in ring order, main thread first.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids = Vec::with_capacity(self.threads.len());
        let mut key = self.main;
        while let Some(thread) = self.threads.get(key) {
            ids.push(ThreadId::new(self.pid, key));
            key = thread.next;
            if key == self.main || ids.len() == self.threads.len() {
                break;
            }
        }
        ids
    }
}

/// One line of the process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub name: String,
    pub state: TaskState,
    pub threads: usize,
    pub directory: PhysAddr,
    pub image: Range<usize>,
}

impl From<&Process> for ProcessInfo {
    fn from(process: &Process) -> Self {
        Self {
            pid: process.pid,
            name: process.name.clone(),
            state: process.state,
            threads: process.thread_count(),
            directory: process.space.token(),
            image: process.layout.image(),
        }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>4} {:<8} {:>3} {:#010x} {:#x}..{:#x} {}",
            self.pid.0,
            self.state,
            self.threads,
            self.directory.0,
            self.image.start,
            self.image.end,
            self.name
        )
    }
}

impl TaskManager {
    /// Create a process running the ELF executable `image` and queue it
    /// right after the scheduler position.
    ///
    /// `path` becomes the process name and `argv[0]`. On any failure every
    /// frame taken so far is given back and the ring is left untouched.
    pub fn start_process(
        &mut self,
        mm: &mut MemoryManager,
        path: &str,
        image: &[u8],
        args: &[&str],
        cwd: &str,
    ) -> Result<ProcessId, ProcessError> {
        let space = mm.create_address_space()?;
        let tid = self.alloc_tid();
        // a process is known by the tid of its main thread
        let pid = ProcessId(tid);
        self.processes
            .insert(pid, Process::new(pid, path, space, cwd, tid));
        debug!("[kernel] process {} ({:?}) is NEW", path, pid);
        if let Err(err) = self.build_process(mm, pid, path, image, args) {
            warn!("[kernel] cannot start {}: {}", path, err);
            self.process_mut(pid).state = TaskState::Stopped;
            self.release_process(mm, pid);
            return Err(err);
        }
        let process = self.process_mut(pid);
        process.state = TaskState::Active;
        let main = process.main_thread();
        self.thread_mut(main).state = TaskState::Active;
        self.link_process(pid);
        info!("[kernel] started {} as thread {}", path, self.thread(main).tid);
        Ok(pid)
    }

    fn build_process(
        &mut self,
        mm: &mut MemoryManager,
        pid: ProcessId,
        path: &str,
        image: &[u8],
        args: &[&str],
    ) -> Result<(), ProcessError> {
        let space = self.process(pid).space;
        let main = self.process(pid).main_thread();
        let loaded = loader::load(mm, space, image)?;
        self.process_mut(pid).layout = UserLayout::new(loaded.image_base, loaded.image_size);
        self.thread_mut(main).eip = loaded.entry;
        self.build_stack(mm, main)?;
        self.build_heap(mm, main)?;
        let (argc, argv) = self.heap_fill(mm, main, path, args)?;
        self.stack_fill(mm, main, argc, argv)
    }

    /// Unmap every image and thread page of `pid`, free its directory and
    /// drop the record. The process must already be out of the ring.
    fn release_process(&mut self, mm: &mut MemoryManager, pid: ProcessId) {
        let Some(process) = self.processes.remove(&pid) else {
            return;
        };
        let space = process.space;
        let image = process.layout.image();
        for vpn in VPNRange::new(VirtAddr(image.start).floor(), VirtAddr(image.end).ceil()) {
            mm.unmap(space, vpn.into());
        }
        for (_, thread) in process.threads.iter() {
            for page in thread.region.pages() {
                mm.unmap(space, page);
            }
        }
        mm.activate(mm.kernel_space());
        mm.destroy_address_space(space);
    }

    /// Tear down process `pid` and all of its threads.
    ///
    /// A nonzero `code` is reported as an abnormal exit. The kernel
    /// directory is active afterwards.
    pub fn end_process(&mut self, mm: &mut MemoryManager, pid: ProcessId, code: u32) {
        let Some(process) = self.get_process(pid) else {
            return;
        };
        if code != 0 {
            warn!(
                "[kernel] {} exited abnormally with code {}",
                process.name, code
            );
        } else {
            info!("[kernel] {} exited", process.name);
        }
        self.process_mut(pid).state = TaskState::Stopped;
        self.unlink_process(pid);
        self.release_process(mm, pid);
        if matches!(self.running, Running::Thread(id) if id.process == pid) {
            self.running = Running::Exited(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Machine;
    use crate::loader::ElfError;
    use crate::mm::MemoryError;
    use crate::testing::{elf32, memory_manager, spawn, Segment};
    use alloc::vec;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_process_lifecycle() {
        let (machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let free = mm.frames().free_blocks();

        let pid = spawn(&mut tasks, &mut mm, &[]);
        let process = tasks.process(pid);
        assert_eq!(process.state, TaskState::Active);
        assert_eq!(process.layout.image(), 0x80_0000..0x80_2000);
        assert_eq!(process.name, "/bin/app");
        let main = process.main_thread();
        assert_eq!(tasks.thread(main).state, TaskState::Active);
        assert_eq!(tasks.thread(main).eip, 0x80_0000);
        assert_eq!(tasks.ring(), [pid]);
        let space = process.space;
        let mut mapped = vec![space.root_ppn()];
        for va in (0x80_0000..0x80_5000).step_by(0x1000) {
            mapped.push(mm.translate(space, VirtAddr(va)).unwrap().ppn());
        }
        assert!(mapped.iter().all(|ppn| mm.frames().is_used(*ppn)));

        machine.activate(space.token());
        tasks.end_process(&mut mm, pid, 0);
        assert!(mapped.iter().all(|ppn| !mm.frames().is_used(*ppn)));
        assert_eq!(mm.frames().free_blocks(), free);
        assert_eq!(machine.active_directory(), mm.kernel_space().token());
        assert!(tasks.get_process(pid).is_none());
        assert!(tasks.ring().is_empty());
    }

    #[test]
    fn exhausted_memory_leaves_the_ring_unchanged() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let first = spawn(&mut tasks, &mut mm, &[]);
        while mm.alloc_frame().is_some() {}
        let image = elf32(0x80_0000, &[Segment::code(0x80_0000, vec![0x90; 16])]);
        assert_eq!(
            tasks.start_process(&mut mm, "/bin/app", &image, &[], "/"),
            Err(ProcessError::Memory(MemoryError::OutOfFrames))
        );
        assert_eq!(tasks.ring(), [first]);
        assert_eq!(tasks.processes.len(), 1);
    }

    #[test]
    fn failure_midway_gives_every_frame_back() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let image = elf32(0x80_0000, &[Segment::code(0x80_0000, vec![0x90; 16])]);
        let free = mm.frames().free_blocks();
        // directory, page table, image, user stack; the kernel stack fails
        let keep = 4;
        let mut taken = Vec::new();
        while let Some(frame) = mm.alloc_frame() {
            taken.push(frame);
        }
        for frame in taken.drain(..keep) {
            mm.free_frame(frame);
        }
        assert_eq!(
            tasks.start_process(&mut mm, "/bin/app", &image, &[], "/"),
            Err(ProcessError::Memory(MemoryError::OutOfFrames))
        );
        assert_eq!(mm.frames().free_blocks(), keep);
        for frame in taken {
            mm.free_frame(frame);
        }
        assert_eq!(mm.frames().free_blocks(), free);
        assert!(tasks.ring().is_empty());
    }

    #[test]
    fn invalid_executables_are_not_queued() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let free = mm.frames().free_blocks();
        let mut image = elf32(0x80_0000, &[Segment::code(0x80_0000, vec![0x90; 16])]);
        image[5] = 2;
        assert_eq!(
            tasks.start_process(&mut mm, "/bin/app", &image, &[], "/"),
            Err(ProcessError::Elf(ElfError::NotLittleEndian))
        );
        assert_eq!(mm.frames().free_blocks(), free);
        assert!(tasks.ring().is_empty());
    }

    #[test]
    fn processes_do_not_share_user_pages() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let a = spawn(&mut tasks, &mut mm, &[]);
        let b = spawn(&mut tasks, &mut mm, &[]);
        let (space_a, space_b) = (tasks.process(a).space, tasks.process(b).space);
        let va = VirtAddr(0x80_1000);
        assert_ne!(mm.get_phys(space_a, va), mm.get_phys(space_b, va));

        tasks.end_process(&mut mm, a, 0);
        assert!(mm.get_phys(space_b, va).is_some());
        assert_eq!(tasks.ring(), [b]);
    }

    #[test]
    fn process_ids_are_not_reused() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let first = spawn(&mut tasks, &mut mm, &[]);
        assert_eq!(first.0, tasks.thread(tasks.process(first).main_thread()).tid);
        tasks.end_process(&mut mm, first, 0);
        let second = spawn(&mut tasks, &mut mm, &[]);
        assert!(second > first);
        assert_eq!(tasks.process_state(first), TaskState::Stopped);
        assert_eq!(tasks.process_state(second), TaskState::Active);
        assert_eq!(tasks.process_count(), 1);
    }

    #[test]
    fn listing_follows_the_ring() {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let a = spawn(&mut tasks, &mut mm, &[]);
        let b = spawn(&mut tasks, &mut mm, &[]);
        let list = tasks.process_list();
        assert_eq!(list.iter().map(|info| info.pid).collect::<Vec<_>>(), [a, b]);
        assert_eq!(
            list[0],
            ProcessInfo {
                pid: a,
                name: "/bin/app".into(),
                state: TaskState::Active,
                threads: 1,
                directory: tasks.process(a).space.token(),
                image: 0x80_0000..0x80_2000,
            }
        );
        let line = alloc::format!("{}", list[1]);
        assert!(line.starts_with(&alloc::format!("{:>4} ACTIVE     1 ", b.0)));
        assert!(line.ends_with("0x800000..0x802000 /bin/app"));
    }

    #[test]
    fn abnormal_exit_is_logged() {
        crate::logging::init();
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let mut tasks = TaskManager::new();
        let pid = spawn(&mut tasks, &mut mm, &[]);
        tasks.end_process(&mut mm, pid, 7);
        assert!(crate::arch::transcript().contains("/bin/app exited abnormally with code 7"));
    }
}
