/// `CR4` control register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr4(pub u64);

impl Cr4 {
    /// Physical address extension (PAE).
    pub fn physical_address_extension(self) -> bool {
        self.0 >> 5 & 1 != 0
    }

    /// VMX enable (VMXE). Must be set before VMXON.
    pub fn vmx_enable(self) -> bool {
        self.0 >> 13 & 1 != 0
    }

    /// Process-context identifiers enable (PCIDE).
    pub fn pcid_enable(self) -> bool {
        self.0 >> 17 & 1 != 0
    }

    /// XSAVE and processor extended states enable (OSXSAVE).
    pub fn os_xsave(self) -> bool {
        self.0 >> 18 & 1 != 0
    }

    /// Returns the value adjusted to the VMX fixed-bit requirements.
    ///
    /// On every VMX capable processor this sets VMXE.
    pub fn with_vmx_fixed_bits(self, fixed0: u64, fixed1: u64) -> Self {
        Self(super::apply_fixed_bits(self.0, fixed0, fixed1))
    }
}

impl std::fmt::Debug for Cr4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr4")
            .field("physical_address_extension", &self.physical_address_extension())
            .field("vmx_enable", &self.vmx_enable())
            .field("pcid_enable", &self.pcid_enable())
            .field("os_xsave", &self.os_xsave())
            .finish()
    }
}

impl From<u64> for Cr4 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr4> for u64 {
    fn from(value: Cr4) -> Self {
        value.0
    }
}
