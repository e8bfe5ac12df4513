/// The RFLAGS register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Rflags(pub u64);

impl Rflags {
    /// Carry flag (CF). VMX instructions report `VMfailInvalid` through it.
    pub const CARRY: u64 = 1 << 0;

    /// Bit 1, always set.
    pub const FIXED: u64 = 1 << 1;

    /// Trap flag (TF).
    pub const TRAP: u64 = 1 << 8;

    /// Interrupt enable flag (IF).
    pub const INTERRUPT: u64 = 1 << 9;

    /// Resume flag (RF).
    pub const RESUME: u64 = 1 << 16;

    /// Bits SYSRET restores from R11.
    pub const SYSRET_MASK: u64 = 0x3c_7fd7;

    /// Checks if the carry flag is set.
    pub fn carry(self) -> bool {
        self.0 & Self::CARRY != 0
    }

    /// Checks if the trap flag is set.
    pub fn trap(self) -> bool {
        self.0 & Self::TRAP != 0
    }

    /// Checks if maskable interrupts are enabled.
    pub fn interrupt(self) -> bool {
        self.0 & Self::INTERRUPT != 0
    }

    /// Checks if the resume flag is set.
    pub fn resume(self) -> bool {
        self.0 & Self::RESUME != 0
    }
}

impl std::fmt::Debug for Rflags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Rflags")
            .field("carry", &self.carry())
            .field("trap", &self.trap())
            .field("interrupt", &self.interrupt())
            .field("resume", &self.resume())
            .finish()
    }
}

impl From<u64> for Rflags {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Rflags> for u64 {
    fn from(value: Rflags) -> Self {
        value.0
    }
}
