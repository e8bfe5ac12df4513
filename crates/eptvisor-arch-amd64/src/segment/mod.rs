mod descriptor;
pub use self::descriptor::SegmentDescriptor;

mod selector;
pub use self::selector::{DescriptorTable, Selector};

/// Segment access rights in the VMCS format.
///
/// Bits 0 to 7 mirror byte 5 of the descriptor (type, S, DPL, P), bits 12
/// to 15 mirror the upper nibble of byte 6 (AVL, L, D/B, G) and bit 16
/// marks the register as unusable.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAccess(pub u32);

impl SegmentAccess {
    /// Access rights of a register that holds a null selector.
    pub const UNUSABLE: Self = Self(1 << 16);

    /// 64-bit ring 0 code segment loaded by SYSCALL.
    pub const SYSCALL_CODE: Self = Self(0xa09b);

    /// Ring 0 stack segment loaded by SYSCALL.
    pub const SYSCALL_STACK: Self = Self(0xc093);

    /// 64-bit ring 3 code segment loaded by SYSRET.
    pub const SYSRET_CODE: Self = Self(0xa0fb);

    /// Ring 3 stack segment loaded by SYSRET.
    pub const SYSRET_STACK: Self = Self(0xc0f3);

    /// Returns the segment type.
    pub fn typ(self) -> u8 {
        (self.0 & 0b1111) as _
    }

    /// Checks if this is a system segment (S flag clear).
    pub fn is_system(self) -> bool {
        (self.0 >> 4) & 1 == 0
    }

    /// Returns the descriptor privilege level.
    pub fn descriptor_privilege_level(self) -> u8 {
        ((self.0 >> 5) & 0b11) as _
    }

    /// Checks if the segment is present.
    pub fn present(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if the code segment holds 64-bit code (L flag).
    pub fn long_mode(self) -> bool {
        (self.0 >> 13) & 1 != 0
    }

    /// Checks if the default operation size is 32 bits (D/B flag).
    pub fn default_big(self) -> bool {
        (self.0 >> 14) & 1 != 0
    }

    /// Checks if the limit is scaled by 4KiB (G flag).
    pub fn granularity(self) -> bool {
        (self.0 >> 15) & 1 != 0
    }

    /// Checks if the segment register is unusable.
    pub fn unusable(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }
}

impl From<u32> for SegmentAccess {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SegmentAccess> for u32 {
    fn from(value: SegmentAccess) -> Self {
        value.0
    }
}

impl std::fmt::Debug for SegmentAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SegmentAccess")
            .field("type", &self.typ())
            .field("system", &self.is_system())
            .field(
                "descriptor_privilege_level",
                &self.descriptor_privilege_level(),
            )
            .field("present", &self.present())
            .field("long_mode", &self.long_mode())
            .field("default_big", &self.default_big())
            .field("granularity", &self.granularity())
            .field("unusable", &self.unusable())
            .finish()
    }
}
