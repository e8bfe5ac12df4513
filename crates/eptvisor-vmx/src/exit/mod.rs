//! VM-exit dispatch.
//!
//! Every VM exit lands in the exit trampoline, which saves the guest
//! general-purpose registers on the per-core host stack and calls
//! [`Hypervisor::handle_exit`]. The dispatcher handles the exit as a
//! one-shot transaction: it reads the exit information from the VMCS,
//! runs the handler for the exit reason, advances the guest RIP unless the
//! handler redirected it, and finally tells the trampoline whether to
//! resume the guest or to leave VMX operation.
//!
//! [`Hypervisor::handle_exit`]: crate::Hypervisor::handle_exit

mod cpuid;
mod exception;
mod msr;

use eptvisor_arch_amd64::{
    EptViolationQualification, ExitReason, GuestRegisters, PrimaryControls, Rflags, VmcsField,
};
use eptvisor_core::{FatalCondition, Pa, Va};

use crate::{
    ept::{Ept, ViolationOutcome},
    platform::{AddressSpace, HostMemory, Processor, VmxOperations},
    vcpu::{CoreStatus, Vcpu},
};

/// CPUID leaf of the control channel.
pub const CONTROL_LEAF: u32 = 0x4141_4141;

/// Sub-leaf of [`CONTROL_LEAF`] that ends VMX operation on the calling core.
pub const SHUTDOWN_SUBLEAF: u32 = 0x4242_4242;

/// Sub-leaf of [`CONTROL_LEAF`] that turns on syscall interception on the
/// calling core.
pub const SYSCALL_HOOKS_SUBLEAF: u32 = 0x4242_4243;

/// Value left in the guest RCX when the core leaves VMX operation.
pub const SHUTDOWN_MARKER: u64 = 0x4343_4343;

/// EAX of the hypervisor interface leaf while the hypervisor is running.
pub const HYPERVISOR_SIGNATURE: u32 = 0x6f6d_6f6d;

/// Guest state the exit trampoline restores when the core leaves VMX
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateFrame {
    /// Instruction the former guest continues at.
    pub rip: Va,

    /// Stack pointer of the former guest.
    pub rsp: u64,

    /// Flags of the former guest.
    pub rflags: Rflags,
}

/// What the exit trampoline does after the dispatcher returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Execute VMRESUME.
    Resume,

    /// The core has left VMX operation. Restore the saved registers, load
    /// the frame and continue without virtualization.
    Terminate(TerminateFrame),
}

/// State of the exit being handled.
pub(crate) struct GuestContext<'a> {
    pub(crate) registers: &'a mut GuestRegisters,
    pub(crate) rip: Va,
    pub(crate) rsp: u64,
    pub(crate) rflags: Rflags,
    pub(crate) reason: ExitReason,
    pub(crate) qualification: u64,
    pub(crate) guest_physical_address: Pa,
    pub(crate) instruction_length: u64,

    /// Leave VMX operation once the handler returns.
    pub(crate) exit_vm: bool,

    /// Skip the exiting instruction before resuming.
    pub(crate) increment_rip: bool,
}

impl<'a> GuestContext<'a> {
    fn capture(vmx: &impl VmxOperations, registers: &'a mut GuestRegisters) -> Self {
        registers.rsp = vmx.vmread(VmcsField::GuestRsp);

        Self {
            rip: Va(vmx.vmread(VmcsField::GuestRip)),
            rsp: registers.rsp,
            rflags: Rflags(vmx.vmread(VmcsField::GuestRflags)),
            reason: ExitReason::from_raw(vmx.vmread(VmcsField::ExitReason) as u32),
            qualification: vmx.vmread(VmcsField::ExitQualification),
            guest_physical_address: Pa(vmx.vmread(VmcsField::GuestPhysicalAddress)),
            instruction_length: vmx.vmread(VmcsField::ExitInstructionLength),
            registers,
            exit_vm: false,
            increment_rip: true,
        }
    }
}

/// Handles the VM exits of one core.
pub(crate) struct ExitDispatcher<'a, P> {
    platform: &'a P,
    ept: &'a Ept,
    vcpu: &'a Vcpu,
}

impl<'a, P> ExitDispatcher<'a, P>
where
    P: HostMemory + AddressSpace + Processor + VmxOperations,
{
    pub(crate) fn new(platform: &'a P, ept: &'a Ept, vcpu: &'a Vcpu) -> Self {
        Self {
            platform,
            ept,
            vcpu,
        }
    }

    /// Handles the pending VM exit of the current core.
    ///
    /// `registers` is the frame saved by the exit trampoline. Handlers
    /// update it in place and the trampoline reloads it before resuming or
    /// terminating.
    pub(crate) fn dispatch(&self, registers: &mut GuestRegisters) -> ExitAction {
        let mut guest = GuestContext::capture(self.platform, registers);

        tracing::trace!(
            core = self.vcpu.index(),
            reason = ?guest.reason,
            rip = %guest.rip,
            "VM exit"
        );

        match guest.reason {
            ExitReason::ExceptionOrNmi => self.handle_exception(&mut guest),
            ExitReason::Cpuid => self.handle_cpuid(&mut guest),
            ExitReason::Invd => self.platform.wbinvd(),
            ExitReason::Xsetbv => self.handle_xsetbv(&guest),
            ExitReason::VmxInstruction(_) => self.handle_vmx_instruction(&mut guest),
            ExitReason::Rdmsr => self.handle_rdmsr(&mut guest),
            ExitReason::Wrmsr => self.handle_wrmsr(&mut guest),
            ExitReason::EptViolation => self.handle_ept_violation(&mut guest),
            ExitReason::EptMisconfiguration => self.handle_ept_misconfiguration(&mut guest),
            ExitReason::MonitorTrapFlag => self.handle_monitor_trap(&mut guest),
            ExitReason::Other(_) => {}
        }

        if guest.increment_rip {
            guest.rip = guest.rip + guest.instruction_length;
            self.platform.vmwrite(VmcsField::GuestRip, guest.rip.0);
        }

        if guest.exit_vm {
            return self.terminate(&mut guest);
        }

        ExitAction::Resume
    }

    /// Leaves VMX operation on the current core.
    ///
    /// The descriptor tables are reloaded from the launch capture, because
    /// VM exits load the host GDTR and IDTR limits as 0xffff.
    fn terminate(&self, guest: &mut GuestContext) -> ExitAction {
        guest.registers.rcx = SHUTDOWN_MARKER;

        let restore = self.vcpu.restore_state();
        self.platform.lgdt(&restore.gdtr);
        self.platform.lidt(&restore.idtr);
        self.platform
            .write_cr3(self.platform.vmread(VmcsField::GuestCr3).into());
        self.platform.vmxoff();

        self.vcpu.set_status(CoreStatus::Stopped);

        tracing::debug!(core = self.vcpu.index(), rip = %guest.rip, "left VMX operation");

        ExitAction::Terminate(TerminateFrame {
            rip: guest.rip,
            rsp: guest.rsp,
            rflags: guest.rflags,
        })
    }

    fn handle_xsetbv(&self, guest: &GuestContext) {
        self.platform
            .xsetbv(guest.registers.rcx as u32, guest.registers.edx_eax());
    }

    /// The guest is not expected to be VMX-aware. Fail the instruction with
    /// VMfailInvalid.
    fn handle_vmx_instruction(&self, guest: &mut GuestContext) {
        guest.rflags = Rflags(guest.rflags.0 | Rflags::CARRY);
        self.platform.vmwrite(VmcsField::GuestRflags, guest.rflags.0);
    }

    fn handle_ept_violation(&self, guest: &mut GuestContext) {
        let qualification = EptViolationQualification(guest.qualification);
        let address = guest.guest_physical_address;

        let outcome = self.ept.handle_violation(
            self.platform,
            self.vcpu.index(),
            address,
            qualification,
            guest.rip,
        );

        match outcome {
            ViolationOutcome::HookToggled(_) | ViolationOutcome::Stale => {}
            ViolationOutcome::WatchpointHit => {
                // Re-armed by the monitor trap after one instruction.
                self.set_monitor_trap(true);
            }
            ViolationOutcome::Unexpected => {
                tracing::error!(
                    core = self.vcpu.index(),
                    %address,
                    ?qualification,
                    rip = %guest.rip,
                    "unexpected EPT violation"
                );
                self.platform.bugcheck(FatalCondition::UnexpectedViolation {
                    address,
                    qualification: guest.qualification,
                });
            }
        }

        self.invalidate();
        guest.increment_rip = false;
    }

    fn handle_ept_misconfiguration(&self, guest: &mut GuestContext) {
        let condition = self
            .ept
            .handle_misconfiguration(guest.guest_physical_address);

        tracing::error!(core = self.vcpu.index(), %condition, "terminating guest");

        guest.exit_vm = true;
        guest.increment_rip = false;
    }

    fn handle_monitor_trap(&self, guest: &mut GuestContext) {
        let rearmed = self.ept.handle_monitor_trap(self.vcpu.index());
        tracing::trace!(core = self.vcpu.index(), rearmed, "monitor trap");

        self.set_monitor_trap(false);
        self.invalidate();
        guest.increment_rip = false;
    }

    fn set_monitor_trap(&self, enable: bool) {
        let controls = self.platform.vmread(VmcsField::PrimaryProcessorControls);
        let mut controls = PrimaryControls::from_bits_retain(controls as u32);
        controls.set(PrimaryControls::MONITOR_TRAP_FLAG, enable);
        self.platform
            .vmwrite(VmcsField::PrimaryProcessorControls, controls.bits() as u64);
    }

    fn invalidate(&self) {
        self.ept.invalidate(self.platform);
    }
}

#[cfg(test)]
#[path = "exit_tests.rs"]
mod tests;
