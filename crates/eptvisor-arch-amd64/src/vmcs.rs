/// Encoding of a VMCS field, as used by VMREAD and VMWRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmcsField(pub u32);

#[expect(non_upper_case_globals, missing_docs)]
impl VmcsField {
    // 16-bit control fields.
    pub const VirtualProcessorId: Self = Self(0x0000);

    // 16-bit guest-state fields.
    pub const GuestEsSelector: Self = Self(0x0800);
    pub const GuestCsSelector: Self = Self(0x0802);
    pub const GuestSsSelector: Self = Self(0x0804);
    pub const GuestDsSelector: Self = Self(0x0806);
    pub const GuestFsSelector: Self = Self(0x0808);
    pub const GuestGsSelector: Self = Self(0x080a);
    pub const GuestLdtrSelector: Self = Self(0x080c);
    pub const GuestTrSelector: Self = Self(0x080e);

    // 16-bit host-state fields.
    pub const HostEsSelector: Self = Self(0x0c00);
    pub const HostCsSelector: Self = Self(0x0c02);
    pub const HostSsSelector: Self = Self(0x0c04);
    pub const HostDsSelector: Self = Self(0x0c06);
    pub const HostFsSelector: Self = Self(0x0c08);
    pub const HostGsSelector: Self = Self(0x0c0a);
    pub const HostTrSelector: Self = Self(0x0c0c);

    // 64-bit control fields.
    pub const MsrBitmap: Self = Self(0x2004);
    pub const EptPointer: Self = Self(0x201a);

    // 64-bit read-only data fields.
    pub const GuestPhysicalAddress: Self = Self(0x2400);

    // 64-bit guest-state fields.
    pub const VmcsLinkPointer: Self = Self(0x2800);
    pub const GuestDebugCtl: Self = Self(0x2802);
    pub const GuestEfer: Self = Self(0x2806);

    // 32-bit control fields.
    pub const PinBasedControls: Self = Self(0x4000);
    pub const PrimaryProcessorControls: Self = Self(0x4002);
    pub const ExceptionBitmap: Self = Self(0x4004);
    pub const ExitControls: Self = Self(0x400c);
    pub const EntryControls: Self = Self(0x4012);
    pub const EntryInterruptionInfo: Self = Self(0x4016);
    pub const EntryExceptionErrorCode: Self = Self(0x4018);
    pub const EntryInstructionLength: Self = Self(0x401a);
    pub const SecondaryProcessorControls: Self = Self(0x401e);

    // 32-bit read-only data fields.
    pub const VmInstructionError: Self = Self(0x4400);
    pub const ExitReason: Self = Self(0x4402);
    pub const ExitInterruptionInfo: Self = Self(0x4404);
    pub const ExitInterruptionErrorCode: Self = Self(0x4406);
    pub const ExitInstructionLength: Self = Self(0x440c);

    // 32-bit guest-state fields.
    pub const GuestEsLimit: Self = Self(0x4800);
    pub const GuestCsLimit: Self = Self(0x4802);
    pub const GuestSsLimit: Self = Self(0x4804);
    pub const GuestDsLimit: Self = Self(0x4806);
    pub const GuestFsLimit: Self = Self(0x4808);
    pub const GuestGsLimit: Self = Self(0x480a);
    pub const GuestLdtrLimit: Self = Self(0x480c);
    pub const GuestTrLimit: Self = Self(0x480e);
    pub const GuestGdtrLimit: Self = Self(0x4810);
    pub const GuestIdtrLimit: Self = Self(0x4812);
    pub const GuestEsAccessRights: Self = Self(0x4814);
    pub const GuestCsAccessRights: Self = Self(0x4816);
    pub const GuestSsAccessRights: Self = Self(0x4818);
    pub const GuestDsAccessRights: Self = Self(0x481a);
    pub const GuestFsAccessRights: Self = Self(0x481c);
    pub const GuestGsAccessRights: Self = Self(0x481e);
    pub const GuestLdtrAccessRights: Self = Self(0x4820);
    pub const GuestTrAccessRights: Self = Self(0x4822);
    pub const GuestSysenterCs: Self = Self(0x482a);

    // 32-bit host-state fields.
    pub const HostSysenterCs: Self = Self(0x4c00);

    // Natural-width control fields.
    pub const Cr0GuestHostMask: Self = Self(0x6000);
    pub const Cr4GuestHostMask: Self = Self(0x6002);
    pub const Cr0ReadShadow: Self = Self(0x6004);
    pub const Cr4ReadShadow: Self = Self(0x6006);

    // Natural-width read-only data fields.
    pub const ExitQualification: Self = Self(0x6400);
    pub const GuestLinearAddress: Self = Self(0x640a);

    // Natural-width guest-state fields.
    pub const GuestCr0: Self = Self(0x6800);
    pub const GuestCr3: Self = Self(0x6802);
    pub const GuestCr4: Self = Self(0x6804);
    pub const GuestEsBase: Self = Self(0x6806);
    pub const GuestCsBase: Self = Self(0x6808);
    pub const GuestSsBase: Self = Self(0x680a);
    pub const GuestDsBase: Self = Self(0x680c);
    pub const GuestFsBase: Self = Self(0x680e);
    pub const GuestGsBase: Self = Self(0x6810);
    pub const GuestLdtrBase: Self = Self(0x6812);
    pub const GuestTrBase: Self = Self(0x6814);
    pub const GuestGdtrBase: Self = Self(0x6816);
    pub const GuestIdtrBase: Self = Self(0x6818);
    pub const GuestDr7: Self = Self(0x681a);
    pub const GuestRsp: Self = Self(0x681c);
    pub const GuestRip: Self = Self(0x681e);
    pub const GuestRflags: Self = Self(0x6820);
    pub const GuestSysenterEsp: Self = Self(0x6824);
    pub const GuestSysenterEip: Self = Self(0x6826);

    // Natural-width host-state fields.
    pub const HostCr0: Self = Self(0x6c00);
    pub const HostCr3: Self = Self(0x6c02);
    pub const HostCr4: Self = Self(0x6c04);
    pub const HostFsBase: Self = Self(0x6c06);
    pub const HostGsBase: Self = Self(0x6c08);
    pub const HostTrBase: Self = Self(0x6c0a);
    pub const HostGdtrBase: Self = Self(0x6c0c);
    pub const HostIdtrBase: Self = Self(0x6c0e);
    pub const HostSysenterEsp: Self = Self(0x6c10);
    pub const HostSysenterEip: Self = Self(0x6c12);
    pub const HostRsp: Self = Self(0x6c14);
    pub const HostRip: Self = Self(0x6c16);
}

impl std::fmt::Display for VmcsField {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PinControls: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;

        /// Non-maskable interrupts cause VM exits.
        const NMI_EXITING = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PrimaryControls: u32 {
        /// A VM exit occurs after the next guest instruction.
        const MONITOR_TRAP_FLAG = 1 << 27;

        /// RDMSR and WRMSR exits are filtered through the MSR bitmap.
        const USE_MSR_BITMAPS = 1 << 28;

        /// The secondary controls are in effect.
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryControls: u32 {
        /// Guest-physical addresses are translated through EPT.
        const ENABLE_EPT = 1 << 1;

        /// RDTSCP does not raise #UD.
        const ENABLE_RDTSCP = 1 << 3;

        /// Cached translations are tagged with the VPID.
        const ENABLE_VPID = 1 << 5;

        /// INVPCID does not raise #UD.
        const ENABLE_INVPCID = 1 << 12;

        /// XSAVES and XRSTORS do not raise #UD.
        const ENABLE_XSAVES = 1 << 20;
    }
}

bitflags::bitflags! {
    /// VM-exit controls.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ExitControls: u32 {
        /// The host runs in 64-bit mode after a VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;

        /// `IA32_EFER` is saved into the guest EFER field on exit.
        const SAVE_EFER = 1 << 20;

        /// `IA32_EFER` is loaded from the host EFER field on exit.
        const LOAD_EFER = 1 << 21;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EntryControls: u32 {
        /// The guest runs in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;

        /// `IA32_EFER` is loaded from the guest EFER field on entry.
        const LOAD_EFER = 1 << 15;
    }
}

/// Applies the allowed-0 and allowed-1 settings of a VMX capability MSR to
/// a desired control value.
///
/// Bits that must be zero (clear in the high dword) are cleared and bits
/// that must be one (set in the low dword) are set.
pub fn adjust_controls(desired: u32, capability: u64) -> u32 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    desired & allowed1 | allowed0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_forces_bits() {
        let capability = 0x0000_fff0_0000_0016;
        assert_eq!(adjust_controls(0, capability), 0x16);
        assert_eq!(adjust_controls(0xffff_ffff, capability), 0xfff6);
        assert_eq!(adjust_controls(0x100, capability), 0x116);
        assert_eq!(adjust_controls(0x10_0000, capability), 0x16);
    }
}
