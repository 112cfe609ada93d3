//! Loading ELF32 executables into an address space

use crate::config::{PAGE_SIZE, USER_SPACE_END};
use crate::mm::{
    is_user_address, Frame, MemoryError, MemoryManager, PTEFlags, PageTable, VPNRange, VirtAddr,
};
use alloc::vec::Vec;
use log::trace;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF32_HEADER_SIZE: usize = 52;
const ELF32_PH_SIZE: usize = 32;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const EM_386: u16 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("file is too short for an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 32-bit ELF file")]
    NotElf32,
    #[error("not a little-endian ELF file")]
    NotLittleEndian,
    #[error("machine {0} is not x86")]
    WrongMachine(u16),
    #[error("unsupported ELF version")]
    BadVersion,
    #[error("malformed ELF file: {0}")]
    Malformed(&'static str),
    #[error("segment at {0:?} is outside of user space")]
    SegmentOutOfRange(VirtAddr),
    #[error("no loadable segment")]
    NoLoadableSegment,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Where a loaded executable ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: usize,
    /// Virtual address of the first loadable segment.
    pub image_base: usize,
    /// From `image_base` to the end of the last segment, rounded up to a page.
    pub image_size: usize,
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Check the identification bytes and header of an i386 executable.
///
/// Nothing is mapped; every rejection is an error value.
pub fn validate(data: &[u8]) -> Result<ElfFile<'_>, ElfError> {
    if data.len() < ELF_MAGIC.len() + 3 {
        return Err(ElfError::TooShort);
    }
    if data[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if data[4] != ELFCLASS32 {
        return Err(ElfError::NotElf32);
    }
    if data[5] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if data[6] != EV_CURRENT {
        return Err(ElfError::BadVersion);
    }
    if data.len() < ELF32_HEADER_SIZE {
        return Err(ElfError::TooShort);
    }
    let machine = u16_at(data, 18);
    if machine != EM_386 {
        return Err(ElfError::WrongMachine(machine));
    }
    if u32_at(data, 20) != EV_CURRENT as u32 {
        return Err(ElfError::BadVersion);
    }
    let ph_offset = u32_at(data, 28) as usize;
    let ph_entry_size = u16_at(data, 42) as usize;
    let ph_count = u16_at(data, 44) as usize;
    if ph_count > 0 {
        if ph_entry_size != ELF32_PH_SIZE || ph_offset % 4 != 0 {
            return Err(ElfError::Malformed("bad program header table"));
        }
        let table_end = ph_count
            .checked_mul(ph_entry_size)
            .and_then(|len| ph_offset.checked_add(len));
        if table_end.map_or(true, |end| end > data.len()) {
            return Err(ElfError::Malformed("program headers past end of file"));
        }
    }
    // headers are read in place
    if data.as_ptr() as usize % 4 != 0 {
        return Err(ElfError::Malformed("image is not 4-byte aligned"));
    }
    ElfFile::new(data).map_err(ElfError::Malformed)
}

/// Map and fill every loadable segment of `data` in `space`.
///
/// Pages covering `[vaddr, vaddr + mem_size)` are mapped user-accessible,
/// writable if the segment is; file bytes are copied and the rest of the
/// segment zeroed. On error the pages mapped so far are released again.
pub fn load(
    mm: &mut MemoryManager,
    space: PageTable,
    data: &[u8],
) -> Result<LoadedImage, ElfError> {
    let elf = validate(data)?;
    let mut mapped = Vec::new();
    let result = load_segments(mm, space, &elf, &mut mapped);
    if result.is_err() {
        for va in mapped {
            mm.unmap(space, va);
        }
    }
    result
}

fn load_segments(
    mm: &mut MemoryManager,
    space: PageTable,
    elf: &ElfFile<'_>,
    mapped: &mut Vec<VirtAddr>,
) -> Result<LoadedImage, ElfError> {
    let mut image_base = None;
    let mut image_end = 0;
    for i in 0..elf.header.pt2.ph_count() {
        let ph = elf.program_header(i).map_err(ElfError::Malformed)?;
        if !matches!(ph.get_type(), Ok(Type::Load)) || ph.mem_size() == 0 {
            continue;
        }
        let start = ph.virtual_addr() as usize;
        let mem_size = ph.mem_size() as usize;
        let file_size = ph.file_size() as usize;
        let offset = ph.offset() as usize;
        if file_size > mem_size {
            return Err(ElfError::Malformed("file size exceeds memory size"));
        }
        let end = start
            .checked_add(mem_size)
            .filter(|end| is_user_address(VirtAddr(start)) && *end <= USER_SPACE_END)
            .ok_or(ElfError::SegmentOutOfRange(VirtAddr(start)))?;
        if image_base.is_some_and(|base| start < base) {
            return Err(ElfError::Malformed("segments are not sorted"));
        }
        let bytes = offset
            .checked_add(file_size)
            .and_then(|file_end| elf.input.get(offset..file_end))
            .ok_or(ElfError::Malformed("segment data past end of file"))?;

        let mut flags = PTEFlags::USER;
        if ph.flags().is_write() {
            flags |= PTEFlags::WRITABLE;
        }
        for vpn in VPNRange::new(VirtAddr(start).floor(), VirtAddr(end).ceil()) {
            let va: VirtAddr = vpn.into();
            if mm.translate(space, va).is_some() {
                // page shared with the previous segment
                mm.protect(space, va, flags)?;
            } else {
                mm.map_physical(space, va, Frame::Auto, flags)?;
                mapped.push(va);
            }
        }
        mm.copy_to_user(space, VirtAddr(start), bytes)?;
        mm.fill_user(space, VirtAddr(start + file_size), mem_size - file_size, 0)?;
        trace!(
            "[loader] segment {:#x}..{:#x} ({} bytes from file)",
            start,
            end,
            file_size
        );
        image_base.get_or_insert(start);
        image_end = image_end.max(end);
    }
    let image_base = image_base.ok_or(ElfError::NoLoadableSegment)?;
    Ok(LoadedImage {
        entry: elf.header.pt2.entry_point() as usize,
        image_base,
        image_size: (image_end - image_base).next_multiple_of(PAGE_SIZE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{elf32, memory_manager, Segment};
    use alloc::vec;
    use pretty_assertions::assert_eq;

    fn setup() -> (MemoryManager, PageTable) {
        let (_machine, mut mm) = memory_manager(0x80_0000);
        let space = mm.create_address_space().unwrap();
        (mm, space)
    }

    fn two_segment_image() -> Vec<u8> {
        elf32(
            0x80_0010,
            &[
                Segment::code(0x80_0000, vec![0x90; 4096]),
                Segment::data(0x80_1000, vec![7; 256], 512),
            ],
        )
    }

    #[test]
    fn accepts_i386_executables() {
        let image = two_segment_image();
        let elf = validate(&image).unwrap();
        assert_eq!(elf.header.pt2.ph_count(), 2);
    }

    #[test]
    fn rejects_corrupted_identification() {
        let good = two_segment_image();
        let cases: [(usize, u8, ElfError); 4] = [
            (0, 0x7e, ElfError::BadMagic),
            (4, 2, ElfError::NotElf32),
            (5, 2, ElfError::NotLittleEndian),
            (6, 0, ElfError::BadVersion),
        ];
        for (offset, byte, error) in cases {
            let mut image = good.clone();
            image[offset] = byte;
            assert_eq!(validate(&image).err(), Some(error));
        }
        let mut image = good.clone();
        image[18] = 62;
        assert_eq!(validate(&image).err(), Some(ElfError::WrongMachine(62)));
        assert_eq!(validate(&good[..20]).err(), Some(ElfError::TooShort));
        assert_eq!(validate(b"\x7fEL").err(), Some(ElfError::TooShort));
    }

    #[test]
    fn program_header_table_past_the_file_is_malformed() {
        let good = two_segment_image();
        for (ph_offset, ph_count) in [(0xFFFF_FFF0u32, 2u16), (52, 0xFFFF)] {
            let mut image = good.clone();
            image[28..32].copy_from_slice(&ph_offset.to_le_bytes());
            image[44..46].copy_from_slice(&ph_count.to_le_bytes());
            assert_eq!(
                validate(&image).err(),
                Some(ElfError::Malformed("program headers past end of file"))
            );
        }
    }

    #[test]
    fn rejection_maps_nothing() {
        let (mut mm, space) = setup();
        let free = mm.frames().free_blocks();
        let mut image = two_segment_image();
        image[4] = 2;
        assert_eq!(load(&mut mm, space, &image), Err(ElfError::NotElf32));
        assert_eq!(mm.frames().free_blocks(), free);
        assert_eq!(mm.get_phys(space, VirtAddr(0x80_0000)), None);
    }

    #[test]
    fn loads_segments_and_zeroes_bss() {
        let (mut mm, space) = setup();
        let image = load(&mut mm, space, &two_segment_image()).unwrap();
        assert_eq!(
            image,
            LoadedImage {
                entry: 0x80_0010,
                image_base: 0x80_0000,
                image_size: 8192,
            }
        );
        let code = mm.translate(space, VirtAddr(0x80_0000)).unwrap();
        let data = mm.translate(space, VirtAddr(0x80_1000)).unwrap();
        assert!(code.user() && !code.writable());
        assert!(data.user() && data.writable());

        let mut buf = [0u8; 512];
        mm.copy_from_user(space, VirtAddr(0x80_1000), &mut buf).unwrap();
        assert!(buf[..256].iter().all(|b| *b == 7));
        assert!(buf[256..].iter().all(|b| *b == 0));
        assert_eq!(mm.get_phys(space, VirtAddr(0x80_2000)), None);
    }

    #[test]
    fn bss_spanning_pages_is_mapped() {
        let (mut mm, space) = setup();
        let image = elf32(
            0x40_0000,
            &[Segment::data(0x40_0800, vec![1; 16], 3 * PAGE_SIZE)],
        );
        let loaded = load(&mut mm, space, &image).unwrap();
        assert_eq!(loaded.image_size, 3 * PAGE_SIZE);
        for page in 0..4 {
            assert!(mm
                .translate(space, VirtAddr(0x40_0000 + page * PAGE_SIZE))
                .is_some());
        }
    }

    #[test]
    fn segments_sharing_a_page() {
        let (mut mm, space) = setup();
        let image = elf32(
            0x40_0000,
            &[
                Segment::code(0x40_0000, vec![0xc3; 0x100]),
                Segment::data(0x40_0100, vec![5; 0x10], 0x10),
            ],
        );
        let free = mm.frames().free_blocks();
        load(&mut mm, space, &image).unwrap();
        // one table, one page
        assert_eq!(mm.frames().free_blocks(), free - 2);
        assert!(mm.translate(space, VirtAddr(0x40_0000)).unwrap().writable());
        let mut buf = [0u8; 2];
        mm.copy_from_user(space, VirtAddr(0x40_00ff), &mut buf).unwrap();
        assert_eq!(buf, [0xc3, 5]);
    }

    #[test]
    fn segments_outside_user_space_are_refused() {
        let (mut mm, space) = setup();
        let free = mm.frames().free_blocks();
        for vaddr in [0x1000u32, 0xC000_0000] {
            let image = elf32(vaddr, &[Segment::code(vaddr, vec![0; 16])]);
            assert_eq!(
                load(&mut mm, space, &image),
                Err(ElfError::SegmentOutOfRange(VirtAddr(vaddr as usize)))
            );
        }
        let image = elf32(0x40_0000, &[]);
        assert_eq!(load(&mut mm, space, &image), Err(ElfError::NoLoadableSegment));
        assert_eq!(mm.frames().free_blocks(), free);
    }

    #[test]
    fn failed_load_releases_mapped_pages() {
        let (mut mm, space) = setup();
        let mut image = elf32(
            0x40_0000,
            &[
                Segment::code(0x40_0000, vec![0; 16]),
                Segment::data(0x40_1000, vec![0; 16], 16),
            ],
        );
        // point the second segment's data past the end of the file
        let second = ELF32_HEADER_SIZE + ELF32_PH_SIZE;
        image[second + 4..second + 8].copy_from_slice(&0xffff_u32.to_le_bytes());
        assert!(matches!(
            load(&mut mm, space, &image),
            Err(ElfError::Malformed(_))
        ));
        assert_eq!(mm.get_phys(space, VirtAddr(0x40_0000)), None);
    }
}
