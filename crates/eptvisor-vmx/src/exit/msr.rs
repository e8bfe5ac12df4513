use eptvisor_arch_amd64::{VmcsField, msr};

use super::{ExitDispatcher, GuestContext};
use crate::platform::{AddressSpace, HostMemory, Processor, VmxOperations};

/// Returns the guest-state field that holds `index` while the guest runs.
///
/// These registers are swapped by VM entry and VM exit, so reading or
/// writing the real register from the host would touch the host value.
fn guest_field(index: u32) -> Option<VmcsField> {
    match index {
        msr::IA32_SYSENTER_CS => Some(VmcsField::GuestSysenterCs),
        msr::IA32_SYSENTER_ESP => Some(VmcsField::GuestSysenterEsp),
        msr::IA32_SYSENTER_EIP => Some(VmcsField::GuestSysenterEip),
        msr::IA32_DEBUGCTL => Some(VmcsField::GuestDebugCtl),
        msr::IA32_FS_BASE => Some(VmcsField::GuestFsBase),
        msr::IA32_GS_BASE => Some(VmcsField::GuestGsBase),
        _ => None,
    }
}

impl<P> ExitDispatcher<'_, P>
where
    P: HostMemory + AddressSpace + Processor + VmxOperations,
{
    pub(super) fn handle_rdmsr(&self, guest: &mut GuestContext) {
        let index = guest.registers.rcx as u32;

        let value = match guest_field(index) {
            Some(field) => self.platform.vmread(field),
            None => self.platform.read_msr(index),
        };

        guest.registers.set_edx_eax(value);
    }

    pub(super) fn handle_wrmsr(&self, guest: &mut GuestContext) {
        let index = guest.registers.rcx as u32;
        let value = guest.registers.edx_eax();

        match guest_field(index) {
            Some(field) => self.platform.vmwrite(field, value),
            None => self.platform.write_msr(index, value),
        }
    }
}
