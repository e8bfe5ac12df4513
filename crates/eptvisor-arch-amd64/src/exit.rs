use eptvisor_core::MemoryAccess;

/// Basic VM-exit reason (bits 0 to 15 of the exit reason field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// An exception or NMI was delivered while the exception bitmap
    /// requested an exit.
    ExceptionOrNmi,

    /// CPUID executed.
    Cpuid,

    /// INVD executed.
    Invd,

    /// One of VMCALL, VMCLEAR, VMLAUNCH, VMPTRLD, VMPTRST, VMREAD,
    /// VMRESUME, VMWRITE, VMXOFF or VMXON executed.
    VmxInstruction(u16),

    /// RDMSR executed.
    Rdmsr,

    /// WRMSR executed.
    Wrmsr,

    /// The monitor trap flag fired after one guest instruction.
    MonitorTrapFlag,

    /// A guest access was denied by the EPT entry rights.
    EptViolation,

    /// An EPT paging structure entry is malformed.
    EptMisconfiguration,

    /// XSETBV executed.
    Xsetbv,

    /// Any reason this hypervisor does not handle.
    Other(u16),
}

impl ExitReason {
    /// Decodes the VM-exit reason field.
    pub fn from_raw(value: u32) -> Self {
        let basic = (value & 0xffff) as u16;
        match basic {
            0 => Self::ExceptionOrNmi,
            10 => Self::Cpuid,
            13 => Self::Invd,
            18..=27 => Self::VmxInstruction(basic),
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            37 => Self::MonitorTrapFlag,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            55 => Self::Xsetbv,
            _ => Self::Other(basic),
        }
    }
}

/// Exit qualification of an EPT violation.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationQualification(pub u64);

impl EptViolationQualification {
    /// The access was a data read.
    pub fn read(self) -> bool {
        self.0 & 1 != 0
    }

    /// The access was a data write.
    pub fn write(self) -> bool {
        self.0 >> 1 & 1 != 0
    }

    /// The access was an instruction fetch.
    pub fn execute(self) -> bool {
        self.0 >> 2 & 1 != 0
    }

    /// The guest-physical address was readable.
    pub fn readable(self) -> bool {
        self.0 >> 3 & 1 != 0
    }

    /// The guest-physical address was writable.
    pub fn writable(self) -> bool {
        self.0 >> 4 & 1 != 0
    }

    /// The guest-physical address was executable.
    pub fn executable(self) -> bool {
        self.0 >> 5 & 1 != 0
    }

    /// Returns the kind of access that faulted.
    pub fn access(self) -> MemoryAccess {
        MemoryAccess::from_bits_truncate((self.0 & 0b111) as u8)
    }

    /// Returns the rights the faulting entry granted.
    pub fn granted(self) -> MemoryAccess {
        MemoryAccess::from_bits_truncate((self.0 >> 3 & 0b111) as u8)
    }
}

impl std::fmt::Debug for EptViolationQualification {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EptViolationQualification")
            .field("access", &format_args!("{}", self.access()))
            .field("granted", &format_args!("{}", self.granted()))
            .finish()
    }
}

impl From<u64> for EptViolationQualification {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// How a VMX instruction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFailure {
    /// `VMfailInvalid`: no current VMCS, nothing to report.
    Invalid,

    /// `VMfailValid`: the reason is in the VM-instruction error field.
    Valid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reasons() {
        assert_eq!(ExitReason::from_raw(0), ExitReason::ExceptionOrNmi);
        assert_eq!(ExitReason::from_raw(10), ExitReason::Cpuid);
        assert_eq!(ExitReason::from_raw(18), ExitReason::VmxInstruction(18));
        assert_eq!(ExitReason::from_raw(27), ExitReason::VmxInstruction(27));
        assert_eq!(ExitReason::from_raw(48), ExitReason::EptViolation);
        assert_eq!(ExitReason::from_raw(0x8000_0031), ExitReason::EptMisconfiguration);
        assert_eq!(ExitReason::from_raw(12), ExitReason::Other(12));
    }

    #[test]
    fn qualification_bits() {
        let qualification = EptViolationQualification(0b10_0100);
        assert!(qualification.execute());
        assert!(qualification.executable());
        assert!(!qualification.read());
        assert_eq!(qualification.access(), MemoryAccess::X);
        assert_eq!(qualification.granted(), MemoryAccess::X);

        let qualification = EptViolationQualification(0b10_0010);
        assert!(qualification.write());
        assert_eq!(qualification.access(), MemoryAccess::W);
    }
}
