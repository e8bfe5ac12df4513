use eptvisor_arch_amd64::{
    Cr0, Cr3, Cr4, CpuidResult, EntryControls, ExitControls, Gdtr, GuestRegisters, Idtr,
    PinControls, PrimaryControls, SecondaryControls, SegmentDescriptor, Selector, VmcsField,
    VmxFailure, adjust_controls,
    msr::{self, FeatureControl, VmxCapabilities},
};
use eptvisor_core::{FatalCondition, HvError, HypervisorConfig, Pa, Va};

use super::{CoreStatus, RestoreState, Vcpu, VmxRegions};
use crate::{
    ept::Ept,
    exit::{CONTROL_LEAF, HYPERVISOR_SIGNATURE, SHUTDOWN_SUBLEAF, SYSCALL_HOOKS_SUBLEAF},
    platform::{HostMemory, LaunchContext, Processor, SegmentRegister, VmxOperations},
};

/// Processor state captured before entering VMX operation.
struct SpecialRegisters {
    cr0: Cr0,
    cr3: Cr3,
    cr4: Cr4,
    debug_control: u64,
    gs_base: u64,
    dr7: u64,
    gdtr: Gdtr,
    idtr: Idtr,
}

impl SpecialRegisters {
    fn capture(cpu: &impl Processor) -> Self {
        Self {
            cr0: cpu.read_cr0(),
            cr3: cpu.read_cr3(),
            cr4: cpu.read_cr4(),
            debug_control: cpu.read_msr(msr::IA32_DEBUGCTL),
            gs_base: cpu.read_msr(msr::IA32_GS_BASE),
            dr7: cpu.read_dr7(),
            gdtr: cpu.sgdt(),
            idtr: cpu.sidt(),
        }
    }
}

/// Physical addresses of the regions, published before launch.
#[derive(Debug, Clone, Copy)]
struct RegionAddresses {
    vmxon: Pa,
    vmcs: Pa,
    msr_bitmap: Pa,
    host_rsp: u64,
}

/// Everything the VMCS is populated from.
struct LaunchState {
    capabilities: VmxCapabilities,
    registers: SpecialRegisters,
    addresses: RegionAddresses,
    context: LaunchContext,
}

/// VMCS encodings of one segment register.
struct SegmentFields {
    register: SegmentRegister,
    selector: VmcsField,
    limit: VmcsField,
    access: VmcsField,
    base: VmcsField,
    host_selector: Option<VmcsField>,
}

const SEGMENTS: [SegmentFields; 8] = [
    SegmentFields {
        register: SegmentRegister::Cs,
        selector: VmcsField::GuestCsSelector,
        limit: VmcsField::GuestCsLimit,
        access: VmcsField::GuestCsAccessRights,
        base: VmcsField::GuestCsBase,
        host_selector: Some(VmcsField::HostCsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Ss,
        selector: VmcsField::GuestSsSelector,
        limit: VmcsField::GuestSsLimit,
        access: VmcsField::GuestSsAccessRights,
        base: VmcsField::GuestSsBase,
        host_selector: Some(VmcsField::HostSsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Ds,
        selector: VmcsField::GuestDsSelector,
        limit: VmcsField::GuestDsLimit,
        access: VmcsField::GuestDsAccessRights,
        base: VmcsField::GuestDsBase,
        host_selector: Some(VmcsField::HostDsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Es,
        selector: VmcsField::GuestEsSelector,
        limit: VmcsField::GuestEsLimit,
        access: VmcsField::GuestEsAccessRights,
        base: VmcsField::GuestEsBase,
        host_selector: Some(VmcsField::HostEsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Fs,
        selector: VmcsField::GuestFsSelector,
        limit: VmcsField::GuestFsLimit,
        access: VmcsField::GuestFsAccessRights,
        base: VmcsField::GuestFsBase,
        host_selector: Some(VmcsField::HostFsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Gs,
        selector: VmcsField::GuestGsSelector,
        limit: VmcsField::GuestGsLimit,
        access: VmcsField::GuestGsAccessRights,
        base: VmcsField::GuestGsBase,
        host_selector: Some(VmcsField::HostGsSelector),
    },
    SegmentFields {
        register: SegmentRegister::Tr,
        selector: VmcsField::GuestTrSelector,
        limit: VmcsField::GuestTrLimit,
        access: VmcsField::GuestTrAccessRights,
        base: VmcsField::GuestTrBase,
        host_selector: Some(VmcsField::HostTrSelector),
    },
    SegmentFields {
        register: SegmentRegister::Ldtr,
        selector: VmcsField::GuestLdtrSelector,
        limit: VmcsField::GuestLdtrLimit,
        access: VmcsField::GuestLdtrAccessRights,
        base: VmcsField::GuestLdtrBase,
        host_selector: None,
    },
];

/// Converts a failed VMX instruction into an error, fetching the
/// VM-instruction error number when the processor reported one.
fn vmx_error(vmx: &impl VmxOperations, instruction: &'static str, failure: VmxFailure) -> HvError {
    let code = match failure {
        VmxFailure::Valid => vmx.vmread(VmcsField::VmInstructionError) as u32,
        VmxFailure::Invalid => 0,
    };

    HvError::VmxInstruction { instruction, code }
}

/// Checks that the processor implements VMX and the firmware allows it
/// outside SMX.
pub(crate) fn check_vmx_support(cpu: &impl Processor) -> Result<(), HvError> {
    if !cpu.cpuid(CpuidResult::FEATURE_INFORMATION, 0).vmx() {
        return Err(HvError::VmxNotSupported);
    }

    let feature_control = FeatureControl(cpu.read_msr(msr::IA32_FEATURE_CONTROL));
    if !feature_control.locked() || !feature_control.vmx_outside_smx() {
        return Err(HvError::VmxDisabled);
    }

    Ok(())
}

/// Checks if this hypervisor answers CPUID on the current core.
pub(crate) fn is_hypervisor_present(cpu: &impl Processor) -> bool {
    if !cpu
        .cpuid(CpuidResult::FEATURE_INFORMATION, 0)
        .hypervisor_present()
    {
        return false;
    }

    cpu.cpuid(CpuidResult::HYPERVISOR_INTERFACE, 0).eax == HYPERVISOR_SIGNATURE
}

impl Vcpu {
    /// Virtualizes the current core in place.
    ///
    /// Must run on the processor this `Vcpu` describes. On success the core
    /// continues as a guest whose EPT is `ept`. On failure the core is left
    /// outside VMX operation, unless the launch appeared to succeed but the
    /// hypervisor does not answer, in which case the core is marked
    /// [`CoreStatus::Corrupt`].
    pub(crate) fn enable<P>(
        &self,
        platform: &P,
        ept: &Ept,
        config: &HypervisorConfig,
        system_cr3: Cr3,
    ) -> Result<(), HvError>
    where
        P: HostMemory + Processor + VmxOperations,
    {
        tracing::debug!(core = self.index, "enabling core");

        check_vmx_support(platform)?;

        let capabilities = VmxCapabilities::read(|index| platform.read_msr(index));
        let registers = SpecialRegisters::capture(platform);
        let context = platform.capture_context();

        *self.restore.write() = RestoreState {
            gdtr: registers.gdtr,
            idtr: registers.idtr,
            capabilities,
            system_cr3,
        };

        let addresses = self.prepare_regions(platform, &capabilities)?;

        let (fixed0, fixed1) = capabilities.cr0_fixed();
        let cr0 = registers.cr0.with_vmx_fixed_bits(fixed0, fixed1);
        platform.write_cr0(cr0);

        let (fixed0, fixed1) = capabilities.cr4_fixed();
        let cr4 = registers.cr4.with_vmx_fixed_bits(fixed0, fixed1);
        platform.write_cr4(cr4);

        // No VMCS is current yet, so there is no error number to read.
        if platform.vmxon(addresses.vmxon).is_err() {
            self.release();
            return Err(HvError::vmx("vmxon"));
        }

        let result = platform
            .vmclear(addresses.vmcs)
            .map_err(|failure| vmx_error(platform, "vmclear", failure))
            .and_then(|()| {
                platform
                    .vmptrld(addresses.vmcs)
                    .map_err(|failure| vmx_error(platform, "vmptrld", failure))
            })
            .and_then(|()| {
                let launch = LaunchState {
                    capabilities,
                    registers: SpecialRegisters {
                        cr0,
                        cr4,
                        ..registers
                    },
                    addresses,
                    context,
                };
                self.setup_vmcs(platform, ept, config, &launch);
                platform
                    .vmlaunch()
                    .map_err(|failure| vmx_error(platform, "vmlaunch", failure))
            });

        if let Err(err) = result {
            platform.vmxoff();
            self.release();
            tracing::warn!(core = self.index, %err, "core failed to enter VMX operation");
            return Err(err);
        }

        self.set_status(CoreStatus::Running);

        if !is_hypervisor_present(platform) {
            self.set_status(CoreStatus::Corrupt);
            tracing::warn!(core = self.index, "hypervisor not present after launch");
            return Err(HvError::Other("hypervisor not present after launch"));
        }

        if config.syscall_hooks {
            platform.cpuid(CONTROL_LEAF, SYSCALL_HOOKS_SUBLEAF);
        }

        tracing::debug!(core = self.index, "core running as guest");
        Ok(())
    }

    /// Leaves VMX operation on the current core.
    ///
    /// Must run on the processor this `Vcpu` describes. A core that still
    /// answers as virtualized afterwards halts the system.
    pub(crate) fn disable(&self, platform: &impl Processor) {
        if self.status() == CoreStatus::Stopped && !is_hypervisor_present(platform) {
            self.release();
            return;
        }

        tracing::debug!(core = self.index, "disabling core");
        platform.cpuid(CONTROL_LEAF, SHUTDOWN_SUBLEAF);

        if is_hypervisor_present(platform) {
            let condition = FatalCondition::StuckCore { core: self.index };
            tracing::error!(core = self.index, %condition, "shutdown request ignored");
            platform.bugcheck(condition);
        }

        self.set_status(CoreStatus::Stopped);
        self.release();
    }

    /// Allocates the VMX regions and publishes their physical addresses.
    fn prepare_regions(
        &self,
        memory: &impl HostMemory,
        capabilities: &VmxCapabilities,
    ) -> Result<RegionAddresses, HvError> {
        let mut regions = VmxRegions::allocate()?;

        let revision = capabilities.basic().revision_id().to_le_bytes();
        regions.vmxon.0[..4].copy_from_slice(&revision);
        regions.vmcs.0[..4].copy_from_slice(&revision);

        let physical = |page: &[u8]| {
            memory
                .host_physical_address(Va(page.as_ptr() as u64))
                .ok_or(HvError::Other("VMX region has no physical address"))
        };

        let addresses = RegionAddresses {
            vmxon: physical(&regions.vmxon.0)?,
            vmcs: physical(&regions.vmcs.0)?,
            msr_bitmap: physical(&regions.msr_bitmap.0)?,
            host_rsp: (regions.stack.top() - GuestRegisters::FRAME_SIZE).0,
        };

        *self.regions.lock() = Some(regions);
        Ok(addresses)
    }

    /// Frees the VMX regions. The core must be outside VMX operation.
    fn release(&self) {
        self.regions.lock().take();
    }

    fn setup_vmcs<P>(&self, platform: &P, ept: &Ept, config: &HypervisorConfig, launch: &LaunchState)
    where
        P: HostMemory + Processor + VmxOperations,
    {
        let vmx = platform;
        let LaunchState {
            capabilities,
            registers,
            addresses,
            context,
        } = launch;

        vmx.vmwrite(VmcsField::VmcsLinkPointer, !0);

        let mut secondary = SecondaryControls::ENABLE_RDTSCP
            | SecondaryControls::ENABLE_INVPCID
            | SecondaryControls::ENABLE_XSAVES;

        if capabilities.ept_vpid().supports_ept() {
            vmx.vmwrite(VmcsField::EptPointer, ept.pointer().into());
            vmx.vmwrite(VmcsField::VirtualProcessorId, config.vpid as u64);
            secondary |= SecondaryControls::ENABLE_EPT | SecondaryControls::ENABLE_VPID;
        }
        else {
            tracing::warn!(core = self.index, "EPT not supported, hooks are inert");
        }

        vmx.vmwrite(VmcsField::MsrBitmap, addresses.msr_bitmap.0);

        let controls = [
            (
                VmcsField::SecondaryProcessorControls,
                secondary.bits(),
                msr::IA32_VMX_PROCBASED_CTLS2,
            ),
            (
                VmcsField::PinBasedControls,
                PinControls::empty().bits(),
                msr::IA32_VMX_TRUE_PINBASED_CTLS,
            ),
            (
                VmcsField::PrimaryProcessorControls,
                (PrimaryControls::ACTIVATE_SECONDARY_CONTROLS | PrimaryControls::USE_MSR_BITMAPS)
                    .bits(),
                msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            ),
            (
                VmcsField::ExitControls,
                ExitControls::HOST_ADDRESS_SPACE_SIZE.bits(),
                msr::IA32_VMX_TRUE_EXIT_CTLS,
            ),
            (
                VmcsField::EntryControls,
                EntryControls::IA32E_MODE_GUEST.bits(),
                msr::IA32_VMX_TRUE_ENTRY_CTLS,
            ),
        ];

        for (field, desired, capability) in controls {
            let value = adjust_controls(desired, capabilities.get(capability));
            vmx.vmwrite(field, value as u64);
        }

        self.setup_segments(platform, registers);

        vmx.vmwrite(VmcsField::GuestGdtrBase, registers.gdtr.base);
        vmx.vmwrite(VmcsField::GuestGdtrLimit, registers.gdtr.limit as u64);
        vmx.vmwrite(VmcsField::HostGdtrBase, registers.gdtr.base);

        vmx.vmwrite(VmcsField::GuestIdtrBase, registers.idtr.base);
        vmx.vmwrite(VmcsField::GuestIdtrLimit, registers.idtr.limit as u64);
        vmx.vmwrite(VmcsField::HostIdtrBase, registers.idtr.base);

        vmx.vmwrite(VmcsField::Cr0ReadShadow, registers.cr0.0);
        vmx.vmwrite(VmcsField::HostCr0, registers.cr0.0);
        vmx.vmwrite(VmcsField::GuestCr0, registers.cr0.0);

        vmx.vmwrite(VmcsField::HostCr3, self.restore_state().system_cr3.0);
        vmx.vmwrite(VmcsField::GuestCr3, registers.cr3.0);

        vmx.vmwrite(VmcsField::HostCr4, registers.cr4.0);
        vmx.vmwrite(VmcsField::GuestCr4, registers.cr4.0);
        vmx.vmwrite(VmcsField::Cr4ReadShadow, registers.cr4.0);

        vmx.vmwrite(VmcsField::GuestDebugCtl, registers.debug_control);
        vmx.vmwrite(VmcsField::GuestDr7, registers.dr7);

        vmx.vmwrite(VmcsField::GuestRsp, context.rsp);
        vmx.vmwrite(VmcsField::GuestRip, vmx.launch_trampoline().0);
        vmx.vmwrite(VmcsField::GuestRflags, context.rflags.0);

        vmx.vmwrite(VmcsField::HostRsp, addresses.host_rsp);
        vmx.vmwrite(VmcsField::HostRip, vmx.exit_trampoline().0);
    }

    /// Writes every guest segment register, converted from the live GDT,
    /// and the matching host selectors and bases.
    fn setup_segments<P>(&self, platform: &P, registers: &SpecialRegisters)
    where
        P: HostMemory + Processor + VmxOperations,
    {
        let vmx = platform;

        for fields in &SEGMENTS {
            let selector = platform.segment_selector(fields.register);
            let segment = self.read_descriptor(platform, &registers.gdtr, selector);

            let base = match fields.register {
                SegmentRegister::Gs => registers.gs_base,
                _ => segment.base,
            };

            vmx.vmwrite(fields.selector, selector.0 as u64);
            vmx.vmwrite(fields.limit, segment.limit as u64);
            vmx.vmwrite(fields.access, segment.access.0 as u64);
            vmx.vmwrite(fields.base, base);

            if let Some(host_selector) = fields.host_selector {
                vmx.vmwrite(host_selector, selector.host_selector().0 as u64);
            }

            match fields.register {
                SegmentRegister::Fs => vmx.vmwrite(VmcsField::HostFsBase, base),
                SegmentRegister::Gs => vmx.vmwrite(VmcsField::HostGsBase, base),
                SegmentRegister::Tr => vmx.vmwrite(VmcsField::HostTrBase, base),
                _ => {}
            }
        }
    }

    fn read_descriptor(
        &self,
        memory: &impl HostMemory,
        gdtr: &Gdtr,
        selector: Selector,
    ) -> SegmentDescriptor {
        if selector.is_null() {
            return SegmentDescriptor::unusable(selector);
        }

        let mut raw = [0u8; 16];
        let address = Va(gdtr.base + selector.descriptor_offset());
        if let Err(err) = memory.read_virtual(address, &mut raw) {
            tracing::warn!(core = self.index, ?selector, %err, "failed to read descriptor");
            return SegmentDescriptor::unusable(selector);
        }

        SegmentDescriptor::decode(selector, &raw)
    }
}

#[cfg(test)]
#[path = "vcpu_tests.rs"]
mod tests;
