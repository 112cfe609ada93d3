//! Threads: per-thread stacks and heap, fork and thread exit
use super::{ProcessError, TaskManager, TaskState, ThreadId, ThreadRegion};
use crate::config::{TIME_SLICE, TRAMPOLINE};
use crate::mm::heap::{init_user_heap, place_strings, user_heap};
use crate::mm::{Frame, MemoryManager, PTEFlags, VirtAddr};
use crate::trap::TrapFrame;
use alloc::vec::Vec;
use log::{debug, trace};

/// Thread control block
pub struct Thread {
    /// Visible to user code (returned by fork).
    pub tid: usize,
    /// Stopping the main thread ends the process.
    pub is_main: bool,
    pub state: TaskState,
    /// Ticks the thread may run before the scheduler looks at the next one.
    pub time_slice: usize,
    /// Index in the process layout; `None` until the stack is built.
    pub slot: Option<usize>,
    pub region: ThreadRegion,
    pub eip: usize,
    /// Where the trap stub left this thread's registers.
    pub kernel_esp: usize,
    pub(super) next: usize,
    pub(super) prev: usize,
}

impl Thread {
    pub(super) fn new(tid: usize, is_main: bool) -> Self {
        Self {
            tid,
            is_main,
            state: TaskState::New,
            time_slice: TIME_SLICE,
            slot: None,
            region: ThreadRegion::default(),
            eip: 0,
            kernel_esp: 0,
            next: 0,
            prev: 0,
        }
    }
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|w| w.to_le_bytes()).collect()
}

impl TaskManager {
    /// Claim a slot and map its user stack and supervisor-only kernel stack.
    pub(super) fn build_stack(
        &mut self,
        mm: &mut MemoryManager,
        id: ThreadId,
    ) -> Result<(), ProcessError> {
        let process = self.process_mut(id.process);
        let slot = process.slots.alloc();
        let region = match process.layout.region(slot) {
            Ok(region) => region,
            Err(err) => {
                process.slots.dealloc(slot);
                return Err(err.into());
            }
        };
        let space = process.space;
        let thread = self.thread_mut(id);
        thread.slot = Some(slot);
        thread.region = region;
        mm.map_physical(
            space,
            region.stack,
            Frame::Auto,
            PTEFlags::USER | PTEFlags::WRITABLE,
        )?;
        mm.map_physical(space, region.kernel_stack, Frame::Auto, PTEFlags::WRITABLE)?;
        trace!("[kernel] thread {:?} uses slot {} at {:?}", id, slot, region.stack);
        Ok(())
    }

    /// Map the heap page of the thread's slot and format it.
    pub(super) fn build_heap(
        &mut self,
        mm: &mut MemoryManager,
        id: ThreadId,
    ) -> Result<(), ProcessError> {
        let space = self.process(id.process).space;
        let heap = self.thread(id).region.heap;
        mm.map_physical(space, heap, Frame::Auto, PTEFlags::USER | PTEFlags::WRITABLE)?;
        init_user_heap(mm, space, heap).ok_or(ProcessError::HeapExhausted)?;
        Ok(())
    }

    /// Copy `argv[0] = path` and `args` into the thread's heap.
    ///
    /// # Return
    /// `(argc, argv)`, `argv` pointing at a NUL-terminated array of string addresses.
    pub(super) fn heap_fill(
        &mut self,
        mm: &mut MemoryManager,
        id: ThreadId,
        path: &str,
        args: &[&str],
    ) -> Result<(usize, VirtAddr), ProcessError> {
        let space = self.process(id.process).space;
        let heap = self.thread(id).region.heap;
        let mut strings = Vec::with_capacity(args.len() + 1);
        strings.push(path);
        strings.extend_from_slice(args);
        let placed = place_strings(mm, space, heap, &strings).ok_or(ProcessError::HeapExhausted)?;

        let mut table: Vec<u32> = placed.iter().map(|va| va.0 as u32).collect();
        table.push(0);
        let offset = user_heap(mm, space, heap)
            .and_then(|mut list| list.allocate(table.len() * 4))
            .ok_or(ProcessError::HeapExhausted)?;
        let argv = VirtAddr(heap.0 + offset);
        mm.copy_to_user(space, argv, &words(&table))?;
        Ok((placed.len(), argv))
    }

    /// Push `argv`, `argc` and the exit trampoline on the user stack and put
    /// a ring 3 entry frame on the kernel stack.
    pub(super) fn stack_fill(
        &mut self,
        mm: &mut MemoryManager,
        id: ThreadId,
        argc: usize,
        argv: VirtAddr,
    ) -> Result<(), ProcessError> {
        let space = self.process(id.process).space;
        let thread = self.thread(id);
        let user_esp = thread.region.stack_top() - 12;
        mm.copy_to_user(
            space,
            VirtAddr(user_esp),
            &words(&[TRAMPOLINE as u32, argc as u32, argv.0 as u32]),
        )?;
        let frame = TrapFrame::user_entry(thread.eip, user_esp);
        let kernel_esp = thread.region.kernel_stack_top() - TrapFrame::SIZE;
        mm.copy_to_user(space, VirtAddr(kernel_esp), frame.as_bytes())?;
        self.thread_mut(id).kernel_esp = kernel_esp;
        Ok(())
    }

    /// Start a new thread in the process of `parent`.
    ///
    /// The child gets its own slot holding copies of the parent's stack and
    /// heap pages, and resumes from `frame` (the parent's system call frame)
    /// with `eax = 0` and its stack pointers moved into the copied stack.
    ///
    /// # Return
    /// The child's tid
    pub fn fork(
        &mut self,
        mm: &mut MemoryManager,
        parent: ThreadId,
        frame: &TrapFrame,
    ) -> Result<usize, ProcessError> {
        let tid = self.alloc_tid();
        let key = self
            .process_mut(parent.process)
            .threads
            .insert(Thread::new(tid, false));
        let child = ThreadId::new(parent.process, key);
        if let Err(err) = self.build_fork(mm, parent, child, frame) {
            self.release_thread(mm, child);
            return Err(err);
        }
        self.link_thread(parent, child);
        self.thread_mut(child).state = TaskState::Active;
        debug!(
            "[kernel] thread {} forked from {}",
            tid,
            self.thread(parent).tid
        );
        Ok(tid)
    }

    fn build_fork(
        &mut self,
        mm: &mut MemoryManager,
        parent: ThreadId,
        child: ThreadId,
        frame: &TrapFrame,
    ) -> Result<(), ProcessError> {
        self.build_stack(mm, child)?;
        self.build_heap(mm, child)?;
        let space = self.process(parent.process).space;
        let from = self.thread(parent).region;
        let to = self.thread(child).region;
        mm.copy_page(space, from.stack, to.stack)?;
        mm.copy_page(space, from.heap, to.heap)?;

        let rebase = |addr: u32| {
            let addr = addr as usize;
            if (from.stack.0..=from.stack_top()).contains(&addr) {
                (addr - from.stack.0 + to.stack.0) as u32
            } else {
                addr as u32
            }
        };
        let mut child_frame = *frame;
        child_frame.eax = 0;
        child_frame.user_esp = rebase(frame.user_esp);
        child_frame.ebp = rebase(frame.ebp);
        let kernel_esp = to.kernel_stack_top() - TrapFrame::SIZE;
        mm.copy_to_user(space, VirtAddr(kernel_esp), child_frame.as_bytes())?;

        let thread = self.thread_mut(child);
        thread.eip = frame.eip as usize;
        thread.kernel_esp = kernel_esp;
        Ok(())
    }

    /// Unmap the pages of `id`, give back its slot and drop the record.
    pub(super) fn release_thread(&mut self, mm: &mut MemoryManager, id: ThreadId) {
        let process = self.process_mut(id.process);
        let space = process.space;
        let Some(thread) = process.threads.remove(id.key) else {
            return;
        };
        if let Some(slot) = thread.slot {
            process.slots.dealloc(slot);
        }
        for page in thread.region.pages() {
            mm.unmap(space, page);
        }
    }

    /// Terminate thread `id`.
    ///
    /// The main thread takes its whole process down with it; any other
    /// thread leaves its ring and releases its slot.
    pub fn stop_thread(&mut self, mm: &mut MemoryManager, id: ThreadId, code: u32) {
        let Some((is_main, tid)) = self.get_thread(id).map(|t| (t.is_main, t.tid)) else {
            return;
        };
        if is_main {
            self.end_process(mm, id.process, code);
            return;
        }
        debug!("[kernel] thread {} exited with code {}", tid, code);
        self.thread_mut(id).state = TaskState::Stopped;
        self.unlink_thread(id);
        self.release_thread(mm, id);
        if self.running == super::Running::Thread(id) {
            self.running = super::Running::Exited(Some(id.process));
        }
    }
}
