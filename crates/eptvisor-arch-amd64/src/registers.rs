/// General-purpose registers saved by the exit trampoline.
///
/// The layout is shared with the trampoline, which pushes the registers on
/// the host stack in this order before calling into the dispatcher.
#[expect(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GuestRegisters {
    /// Size of the saved frame in bytes.
    pub const FRAME_SIZE: u64 = size_of::<Self>() as u64;

    /// Stores `value` split into EDX:EAX, zeroing the upper halves.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xffff_ffff;
        self.rdx = value >> 32;
    }

    /// Returns EDX:EAX as one value.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx & 0xffff_ffff) << 32 | self.rax & 0xffff_ffff
    }
}
