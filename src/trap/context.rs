/// Ring 0 code segment selector.
pub const KERNEL_CS: u32 = 0x08;
/// Ring 0 data segment selector.
pub const KERNEL_DS: u32 = 0x10;
/// Ring 3 code segment selector (RPL 3).
pub const USER_CS: u32 = 0x1B;
/// Ring 3 data and stack segment selector (RPL 3).
pub const USER_DS: u32 = 0x23;
/// `IF` set, plus the always-one bit 1.
pub const USER_EFLAGS: u32 = 0x202;

/// Registers saved on a kernel stack when an interrupt is taken
///
/// The layout, from low to high addresses, is what the trap stubs build: the
/// data segment registers they push, the `pushad` block, then the frame the
/// processor pushes itself. `user_esp`/`user_ss` are only present when the
/// interrupt came from ring 3.
///
/// Returning through the stub (`pop` segments, `popad`, `iret`) with a frame
/// built by [`TrapFrame::user_entry`] lands at `eip` in ring 3.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Value of `esp` stored by `pushad`; ignored by `popad`.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == 17 * 4);

impl TrapFrame {
    pub const SIZE: usize = core::mem::size_of::<TrapFrame>();

    /// Frame that enters user mode at `entry` with `user_esp` as stack pointer.
    pub fn user_entry(entry: usize, user_esp: usize) -> Self {
        Self {
            gs: USER_DS,
            fs: USER_DS,
            es: USER_DS,
            ds: USER_DS,
            eip: entry as u32,
            cs: USER_CS,
            eflags: USER_EFLAGS,
            user_esp: user_esp as u32,
            user_ss: USER_DS,
            ..Default::default()
        }
    }

    /// The interrupted code ran in ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE)
        }
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}
