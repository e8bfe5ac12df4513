use eptvisor_arch_amd64::{
    CpuidResult, EntryControls, ExceptionVector, ExitControls, MsrEfer, Selector, VmcsField,
    adjust_controls, msr,
};

use super::{
    CONTROL_LEAF, ExitDispatcher, GuestContext, HYPERVISOR_SIGNATURE, SHUTDOWN_SUBLEAF,
    SYSCALL_HOOKS_SUBLEAF,
};
use crate::platform::{AddressSpace, HostMemory, Processor, VmxOperations};

impl<P> ExitDispatcher<'_, P>
where
    P: HostMemory + AddressSpace + Processor + VmxOperations,
{
    /// Emulates CPUID.
    ///
    /// Two sub-leaves of [`CONTROL_LEAF`] form the control channel. They
    /// are honored only for callers running at CPL 0 and never reach the
    /// real instruction.
    pub(super) fn handle_cpuid(&self, guest: &mut GuestContext) {
        let leaf = guest.registers.rax as u32;
        let subleaf = guest.registers.rcx as u32;

        if leaf == CONTROL_LEAF && self.is_system() {
            match subleaf {
                SYSCALL_HOOKS_SUBLEAF => {
                    self.enable_syscall_hooks();
                    return;
                }
                SHUTDOWN_SUBLEAF => {
                    guest.exit_vm = true;
                    return;
                }
                _ => {}
            }
        }

        let mut result = self.platform.cpuid(leaf, subleaf);
        match leaf {
            CpuidResult::FEATURE_INFORMATION => result.ecx |= CpuidResult::HYPERVISOR_PRESENT,
            CpuidResult::HYPERVISOR_INTERFACE => result.eax = HYPERVISOR_SIGNATURE,
            _ => {}
        }

        guest.registers.rax = result.eax as u64;
        guest.registers.rbx = result.ebx as u64;
        guest.registers.rcx = result.ecx as u64;
        guest.registers.rdx = result.edx as u64;
    }

    /// Checks if the guest runs at CPL 0.
    fn is_system(&self) -> bool {
        let cs = Selector(self.platform.vmread(VmcsField::GuestCsSelector) as u16);
        cs.request_privilege_level() == 0
    }

    /// Routes every SYSCALL and SYSRET of the guest through the
    /// invalid-opcode exit.
    ///
    /// Clearing `EFER.SCE` makes both instructions raise #UD. The guest
    /// EFER is loaded on entry and saved on exit so the guest never
    /// observes the change.
    pub(super) fn enable_syscall_hooks(&self) {
        let restore = self.vcpu.restore_state();
        let capabilities = restore.capabilities;
        let true_controls = capabilities.basic().true_controls();

        let (entry_capability, exit_capability) = if true_controls {
            (
                capabilities.get(msr::IA32_VMX_TRUE_ENTRY_CTLS),
                capabilities.get(msr::IA32_VMX_TRUE_EXIT_CTLS),
            )
        }
        else {
            (
                capabilities.get(msr::IA32_VMX_ENTRY_CTLS),
                capabilities.get(msr::IA32_VMX_EXIT_CTLS),
            )
        };

        let entry = self.platform.vmread(VmcsField::EntryControls) as u32;
        let entry = entry | EntryControls::LOAD_EFER.bits();
        self.platform.vmwrite(
            VmcsField::EntryControls,
            adjust_controls(entry, entry_capability) as u64,
        );

        let exit = self.platform.vmread(VmcsField::ExitControls) as u32;
        let exit = exit | ExitControls::SAVE_EFER.bits();
        self.platform.vmwrite(
            VmcsField::ExitControls,
            adjust_controls(exit, exit_capability) as u64,
        );

        let efer = MsrEfer(self.platform.read_msr(msr::IA32_EFER)).with_syscall_enable(false);
        self.platform.vmwrite(VmcsField::GuestEfer, efer.0);

        let bitmap = self.platform.vmread(VmcsField::ExceptionBitmap) as u32;
        let bitmap = bitmap | ExceptionVector::InvalidOpcode.bitmap_bit();
        self.platform
            .vmwrite(VmcsField::ExceptionBitmap, bitmap as u64);

        tracing::debug!(core = self.vcpu.index(), "syscall interception enabled");
    }
}
