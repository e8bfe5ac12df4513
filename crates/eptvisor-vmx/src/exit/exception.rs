use eptvisor_arch_amd64::{
    Cr3, ExceptionVector, InterruptionInfo, Rflags, SegmentAccess, Selector, VmcsField, msr,
};
use eptvisor_core::{PAGE_SIZE, Va};

use super::{ExitDispatcher, GuestContext};
use crate::platform::{AddressSpace, HostMemory, Processor, VmxOperations};

const SYSCALL: [u8; 2] = [0x0f, 0x05];
const SYSRET: [u8; 3] = [0x48, 0x0f, 0x07];

/// Limit of the flat segments loaded by SYSCALL and SYSRET.
const FLAT_LIMIT: u64 = 0xf_ffff;

/// #PF error code bit set for user-mode accesses.
const PAGE_FAULT_USER: u32 = 1 << 2;

/// #PF error code bit set for instruction fetches.
const PAGE_FAULT_FETCH: u32 = 1 << 4;

/// What the bytes at the faulting RIP turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Syscall,
    Sysret,
    Other,
}

impl<P> ExitDispatcher<'_, P>
where
    P: HostMemory + AddressSpace + Processor + VmxOperations,
{
    /// Handles an intercepted exception or NMI.
    ///
    /// None of the paths advance RIP: either the instruction is emulated
    /// and RIP redirected, or the event is delivered to the guest, which
    /// sees it as if it had never been intercepted.
    pub(super) fn handle_exception(&self, guest: &mut GuestContext) {
        guest.increment_rip = false;

        let interruption =
            InterruptionInfo(self.platform.vmread(VmcsField::ExitInterruptionInfo) as u32);

        if interruption.is_nmi() {
            return;
        }

        if interruption.vector() != ExceptionVector::InvalidOpcode {
            self.platform
                .vmwrite(VmcsField::EntryInterruptionInfo, interruption.0 as u64);

            if interruption.error_code_valid() {
                let error_code = self.platform.vmread(VmcsField::ExitInterruptionErrorCode);
                self.platform
                    .vmwrite(VmcsField::EntryExceptionErrorCode, error_code);
            }

            return;
        }

        match self.fetch_opcode(guest.rip) {
            Some(Opcode::Syscall) => self.emulate_syscall(guest),
            Some(Opcode::Sysret) => self.emulate_sysret(guest),
            Some(Opcode::Other) => self.inject(ExceptionVector::InvalidOpcode, None),

            // A page fault has been injected instead.
            None => {}
        }
    }

    /// Reads the instruction bytes at `rip` from guest memory.
    ///
    /// With PCID in use the guest CR3 may name a user-mode directory that
    /// lacks the kernel half, so the directory base of the current process
    /// is used instead. Reads are split at page boundaries. Returns `None`
    /// after injecting a page fault if any page is not present.
    fn fetch_opcode(&self, rip: Va) -> Option<Opcode> {
        let guest_cr3 = Cr3(self.platform.vmread(VmcsField::GuestCr3));
        let cr3 = if guest_cr3.pcid() & 0b11 != 0 {
            self.platform.current_process_cr3()
        }
        else {
            guest_cr3
        };

        let mut bytes = [0u8; SYSRET.len()];
        let mut offset = 0;
        while offset < bytes.len() {
            let va = rip + offset as u64;
            let chunk = usize::min(
                bytes.len() - offset,
                (PAGE_SIZE - va.page_offset()) as usize,
            );

            let pa = match self.platform.translate_with(cr3, va) {
                Some(pa) => pa,
                None => {
                    self.inject_page_fault(va);
                    return None;
                }
            };

            if let Err(err) = self
                .platform
                .read_physical(pa, &mut bytes[offset..offset + chunk])
            {
                tracing::warn!(%va, %pa, %err, "failed to read faulting instruction");
                self.inject(ExceptionVector::InvalidOpcode, None);
                return None;
            }

            offset += chunk;
        }

        if bytes.starts_with(&SYSCALL) {
            Some(Opcode::Syscall)
        }
        else if bytes == SYSRET {
            Some(Opcode::Sysret)
        }
        else {
            Some(Opcode::Other)
        }
    }

    /// Performs the architectural effects of SYSCALL.
    fn emulate_syscall(&self, guest: &mut GuestContext) {
        let star = self.platform.read_msr(msr::IA32_STAR);
        let lstar = self.platform.read_msr(msr::IA32_LSTAR);
        let fmask = self.platform.read_msr(msr::IA32_FMASK);

        guest.registers.rcx = (guest.rip + guest.instruction_length).0;
        guest.rip = Va(lstar);
        self.platform.vmwrite(VmcsField::GuestRip, guest.rip.0);

        guest.registers.r11 = guest.rflags.0;
        guest.rflags = Rflags(guest.rflags.0 & !(fmask | Rflags::RESUME));
        self.platform.vmwrite(VmcsField::GuestRflags, guest.rflags.0);

        let cs = Selector((star >> 32) as u16 & !0b11);
        let ss = Selector(cs.0 + 8);
        self.load_flat_segments(cs, SegmentAccess::SYSCALL_CODE, ss, SegmentAccess::SYSCALL_STACK);

        tracing::trace!(rcx = guest.registers.rcx, rip = %guest.rip, "emulated syscall");
    }

    /// Performs the architectural effects of a 64-bit SYSRET.
    fn emulate_sysret(&self, guest: &mut GuestContext) {
        let star = self.platform.read_msr(msr::IA32_STAR);

        guest.rip = Va(guest.registers.rcx);
        self.platform.vmwrite(VmcsField::GuestRip, guest.rip.0);

        guest.rflags = Rflags(guest.registers.r11 & Rflags::SYSRET_MASK | Rflags::FIXED);
        self.platform.vmwrite(VmcsField::GuestRflags, guest.rflags.0);

        let base = (star >> 48) as u16;
        let cs = Selector(base.wrapping_add(16) | 0b11);
        let ss = Selector(base.wrapping_add(8) | 0b11);
        self.load_flat_segments(cs, SegmentAccess::SYSRET_CODE, ss, SegmentAccess::SYSRET_STACK);

        tracing::trace!(rip = %guest.rip, "emulated sysret");
    }

    fn load_flat_segments(
        &self,
        cs: Selector,
        cs_access: SegmentAccess,
        ss: Selector,
        ss_access: SegmentAccess,
    ) {
        let vmx = self.platform;

        vmx.vmwrite(VmcsField::GuestCsSelector, cs.0 as u64);
        vmx.vmwrite(VmcsField::GuestCsLimit, FLAT_LIMIT);
        vmx.vmwrite(VmcsField::GuestCsAccessRights, cs_access.0 as u64);
        vmx.vmwrite(VmcsField::GuestCsBase, 0);

        vmx.vmwrite(VmcsField::GuestSsSelector, ss.0 as u64);
        vmx.vmwrite(VmcsField::GuestSsLimit, FLAT_LIMIT);
        vmx.vmwrite(VmcsField::GuestSsAccessRights, ss_access.0 as u64);
        vmx.vmwrite(VmcsField::GuestSsBase, 0);
    }

    fn inject_page_fault(&self, va: Va) {
        let cs = Selector(self.platform.vmread(VmcsField::GuestCsSelector) as u16);

        let mut error_code = PAGE_FAULT_FETCH;
        if cs.request_privilege_level() == 3 {
            error_code |= PAGE_FAULT_USER;
        }

        self.platform.write_cr2(va);
        self.inject(ExceptionVector::PageFault, Some(error_code));

        tracing::trace!(%va, error_code, "injected page fault");
    }

    /// Queues a hardware exception for delivery on the next VM entry.
    fn inject(&self, vector: ExceptionVector, error_code: Option<u32>) {
        let info = InterruptionInfo::hardware_exception(vector, error_code.is_some());
        self.platform
            .vmwrite(VmcsField::EntryInterruptionInfo, info.0 as u64);

        if let Some(error_code) = error_code {
            self.platform
                .vmwrite(VmcsField::EntryExceptionErrorCode, error_code as u64);
        }
    }
}
