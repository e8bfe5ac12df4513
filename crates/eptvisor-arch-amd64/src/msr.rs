//! Model-specific register indices and the VMX capability formats.

#![expect(missing_docs)]

use crate::MemoryType;

pub const IA32_FEATURE_CONTROL: u32 = 0x3a;
pub const IA32_MTRRCAP: u32 = 0xfe;
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
pub const IA32_DEBUGCTL: u32 = 0x1d9;
pub const IA32_MTRR_PHYSBASE0: u32 = 0x200;
pub const IA32_MTRR_PHYSMASK0: u32 = 0x201;

pub const IA32_VMX_BASIC: u32 = 0x480;
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub const IA32_VMX_MISC: u32 = 0x485;
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
pub const IA32_VMX_VMCS_ENUM: u32 = 0x48a;
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48b;
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48d;
pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x48e;
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48f;
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;

pub const IA32_EFER: u32 = 0xc000_0080;
pub const IA32_STAR: u32 = 0xc000_0081;
pub const IA32_LSTAR: u32 = 0xc000_0082;
pub const IA32_FMASK: u32 = 0xc000_0084;
pub const IA32_FS_BASE: u32 = 0xc000_0100;
pub const IA32_GS_BASE: u32 = 0xc000_0101;

/// Number of consecutive capability MSRs starting at [`IA32_VMX_BASIC`].
pub const VMX_CAPABILITY_COUNT: usize = 17;

/// `IA32_FEATURE_CONTROL`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeatureControl(pub u64);

impl FeatureControl {
    /// Checks if the register is locked until the next reset.
    pub fn locked(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if VMXON is allowed outside SMX operation.
    pub fn vmx_outside_smx(self) -> bool {
        self.0 >> 2 & 1 != 0
    }
}

/// `IA32_VMX_BASIC`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic(pub u64);

impl VmxBasic {
    /// VMCS revision identifier written to the VMXON region and the VMCS.
    pub fn revision_id(self) -> u32 {
        (self.0 & 0x7fff_ffff) as u32
    }

    /// Bit 31, always zero on conforming processors.
    pub fn reserved_bit(self) -> bool {
        self.0 >> 31 & 1 != 0
    }

    /// Number of bytes to allocate for the VMXON region and the VMCS.
    pub fn region_size(self) -> u64 {
        self.0 >> 32 & 0x1fff
    }

    /// Memory type the processor uses to access the VMCS.
    pub fn memory_type(self) -> Option<MemoryType> {
        MemoryType::from_bits((self.0 >> 50 & 0xf) as u8)
    }

    /// Checks if the `IA32_VMX_TRUE_*_CTLS` registers are implemented.
    pub fn true_controls(self) -> bool {
        self.0 >> 55 & 1 != 0
    }
}

/// `IA32_VMX_EPT_VPID_CAP`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EptVpidCapability(pub u64);

impl EptVpidCapability {
    /// Checks if a page-walk length of 4 is supported.
    pub fn page_walk_length_4(self) -> bool {
        self.0 >> 6 & 1 != 0
    }

    /// Checks if write-back paging structures are supported.
    pub fn write_back(self) -> bool {
        self.0 >> 14 & 1 != 0
    }

    /// Checks if PML2 entries may map 2MiB pages.
    pub fn large_pages(self) -> bool {
        self.0 >> 16 & 1 != 0
    }

    /// Checks whether every feature the EPT engine depends on is present.
    pub fn supports_ept(self) -> bool {
        self.page_walk_length_4() && self.write_back() && self.large_pages()
    }
}

/// The VMX capability registers of one processor, read in index order from
/// [`IA32_VMX_BASIC`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapabilities(pub [u64; VMX_CAPABILITY_COUNT]);

impl VmxCapabilities {
    /// Reads all capability registers through `read_msr`.
    pub fn read(mut read_msr: impl FnMut(u32) -> u64) -> Self {
        let mut values = [0; VMX_CAPABILITY_COUNT];
        for (index, value) in values.iter_mut().enumerate() {
            *value = read_msr(IA32_VMX_BASIC + index as u32);
        }
        Self(values)
    }

    /// Returns the value of `msr`, or zero if it is not a capability register.
    pub fn get(&self, msr: u32) -> u64 {
        msr.checked_sub(IA32_VMX_BASIC)
            .and_then(|index| self.0.get(index as usize))
            .copied()
            .unwrap_or_default()
    }

    /// Returns `IA32_VMX_BASIC`.
    pub fn basic(&self) -> VmxBasic {
        VmxBasic(self.get(IA32_VMX_BASIC))
    }

    /// Returns `IA32_VMX_EPT_VPID_CAP`.
    pub fn ept_vpid(&self) -> EptVpidCapability {
        EptVpidCapability(self.get(IA32_VMX_EPT_VPID_CAP))
    }

    /// Returns the fixed-0 and fixed-1 masks of CR0.
    pub fn cr0_fixed(&self) -> (u64, u64) {
        (self.get(IA32_VMX_CR0_FIXED0), self.get(IA32_VMX_CR0_FIXED1))
    }

    /// Returns the fixed-0 and fixed-1 masks of CR4.
    pub fn cr4_fixed(&self) -> (u64, u64) {
        (self.get(IA32_VMX_CR4_FIXED0), self.get(IA32_VMX_CR4_FIXED1))
    }
}
