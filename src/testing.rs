//! Helpers shared by the unit tests.

use crate::arch::HostedMachine;
use crate::mm::{MemoryManager, MemoryRegion};
use crate::task::{ProcessId, TaskManager, ThreadId};
use crate::trap::TrapFrame;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;
const PT_LOAD: u32 = 1;

/// A loadable segment of a test executable.
pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub mem_size: usize,
    pub flags: u32,
}

impl Segment {
    pub fn code(vaddr: u32, data: Vec<u8>) -> Self {
        let mem_size = data.len();
        Self {
            vaddr,
            data,
            mem_size,
            flags: PF_R | PF_X,
        }
    }

    pub fn data(vaddr: u32, data: Vec<u8>, mem_size: usize) -> Self {
        Self {
            vaddr,
            data,
            mem_size,
            flags: PF_R | PF_W,
        }
    }
}

/// Assemble an i386 `ET_EXEC` image: header, program headers, then the
/// segment bytes back to back.
pub fn elf32(entry: u32, segments: &[Segment]) -> Vec<u8> {
    let ph_offset = 52u32;
    let mut data_offset = ph_offset + 32 * segments.len() as u32;
    let mut image = Vec::new();
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&3u16.to_le_bytes()); // EM_386
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&ph_offset.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // no section headers
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&52u16.to_le_bytes());
    image.extend_from_slice(&32u16.to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&40u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    for segment in segments {
        for field in [
            PT_LOAD,
            data_offset,
            segment.vaddr,
            segment.vaddr,
            segment.data.len() as u32,
            segment.mem_size as u32,
            segment.flags,
            0x1000,
        ] {
            image.extend_from_slice(&field.to_le_bytes());
        }
        data_offset += segment.data.len() as u32;
    }
    for segment in segments {
        image.extend_from_slice(&segment.data);
    }
    image
}

/// A hosted machine with `memory` bytes, all usable, and paging on.
pub fn memory_manager(memory: usize) -> (Arc<HostedMachine>, MemoryManager) {
    let machine = Arc::new(HostedMachine::new(memory));
    let mm = MemoryManager::new(machine.clone(), memory, &[MemoryRegion::new(0, memory)], &[])
        .unwrap();
    (machine, mm)
}

/// Start `/bin/app`: a page of code at 0x800000 and a data page with BSS.
pub fn spawn(tasks: &mut TaskManager, mm: &mut MemoryManager, args: &[&str]) -> ProcessId {
    let image = elf32(
        0x80_0000,
        &[
            Segment::code(0x80_0000, vec![0x90; 4096]),
            Segment::data(0x80_1000, vec![0x11; 256], 512),
        ],
    );
    tasks
        .start_process(mm, "/bin/app", &image, args, "/")
        .unwrap()
}

/// The frame a thread would trap with right after entering user mode.
pub fn user_frame(tasks: &TaskManager, id: ThreadId) -> TrapFrame {
    let thread = tasks.thread(id);
    TrapFrame::user_entry(thread.eip, thread.region.stack_top() - 12)
}
