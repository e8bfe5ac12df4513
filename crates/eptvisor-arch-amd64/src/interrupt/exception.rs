/// Exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionVector(pub u8);

#[expect(non_upper_case_globals)]
impl ExceptionVector {
    /// Divide error (#DE).
    pub const DivideError: Self = Self(0);

    /// Debug exception (#DB).
    pub const Debug: Self = Self(1);

    /// Non-maskable interrupt.
    pub const Nmi: Self = Self(2);

    /// Breakpoint (#BP), raised by INT3.
    pub const Breakpoint: Self = Self(3);

    /// Invalid opcode (#UD).
    ///
    /// SYSCALL and SYSRET raise it while `EFER.SCE` is clear, which is how
    /// system calls are intercepted.
    pub const InvalidOpcode: Self = Self(6);

    /// Double fault (#DF).
    pub const DoubleFault: Self = Self(8);

    /// General protection fault (#GP).
    pub const GeneralProtection: Self = Self(13);

    /// Page fault (#PF).
    pub const PageFault: Self = Self(14);

    /// Machine check (#MC).
    pub const MachineCheck: Self = Self(18);

    /// Virtualization exception (#VE).
    pub const VirtualizationException: Self = Self(20);

    /// Checks if the processor pushes an error code for this vector.
    pub fn requires_error_code(self) -> bool {
        matches!(self.0, 8 | 10..=14 | 17 | 21)
    }

    /// Returns the bit selecting this vector in the exception bitmap.
    pub fn bitmap_bit(self) -> u32 {
        1 << (self.0 & 0x1f)
    }
}

impl From<u8> for ExceptionVector {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<ExceptionVector> for u8 {
    fn from(value: ExceptionVector) -> Self {
        value.0
    }
}
