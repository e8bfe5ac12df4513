mod exception;
pub use self::exception::ExceptionVector;

/// Type of an event carried by VM-exit or VM-entry interruption information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInterrupt = 0,

    /// NMI.
    Nmi = 2,

    /// Hardware exception.
    HardwareException = 3,

    /// Software interrupt (CD nn).
    SoftwareInterrupt = 4,

    /// ICEBP (F1).
    PrivilegedSoftwareException = 5,

    /// INT3 (CC), INTO (CE).
    SoftwareException = 6,

    /// Other event (MTF injection).
    Other = 7,
}

impl InterruptionType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::ExternalInterrupt),
            2 => Some(Self::Nmi),
            3 => Some(Self::HardwareException),
            4 => Some(Self::SoftwareInterrupt),
            5 => Some(Self::PrivilegedSoftwareException),
            6 => Some(Self::SoftwareException),
            7 => Some(Self::Other),
            _ => None,
        }
    }
}

/// VM-exit or VM-entry interruption-information field.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionInfo(pub u32);

impl InterruptionInfo {
    const ERROR_CODE_VALID: u32 = 1 << 11;
    const VALID: u32 = 1 << 31;

    /// Creates a valid hardware exception event.
    pub fn hardware_exception(vector: ExceptionVector, error_code_valid: bool) -> Self {
        let mut value = Self::VALID | (InterruptionType::HardwareException as u32) << 8;
        value |= vector.0 as u32;
        if error_code_valid {
            value |= Self::ERROR_CODE_VALID;
        }
        Self(value)
    }

    /// Returns the vector of the event.
    pub fn vector(self) -> ExceptionVector {
        ExceptionVector((self.0 & 0xff) as u8)
    }

    /// Returns the type of the event.
    pub fn typ(self) -> Option<InterruptionType> {
        InterruptionType::from_bits((self.0 >> 8 & 0b111) as u8)
    }

    /// Checks if an error code accompanies the event.
    pub fn error_code_valid(self) -> bool {
        self.0 & Self::ERROR_CODE_VALID != 0
    }

    /// Checks if the field holds an event at all.
    pub fn valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Checks if the event is a non-maskable interrupt.
    pub fn is_nmi(self) -> bool {
        self.typ() == Some(InterruptionType::Nmi) && self.vector() == ExceptionVector::Nmi
    }
}

impl std::fmt::Debug for InterruptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("InterruptionInfo")
            .field("vector", &self.vector())
            .field("type", &self.typ())
            .field("error_code_valid", &self.error_code_valid())
            .field("valid", &self.valid())
            .finish()
    }
}

impl From<u32> for InterruptionInfo {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<InterruptionInfo> for u32 {
    fn from(value: InterruptionInfo) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_injection() {
        let info = InterruptionInfo::hardware_exception(ExceptionVector::PageFault, true);
        assert_eq!(info.0, 0x8000_0b0e);
        assert_eq!(info.typ(), Some(InterruptionType::HardwareException));
        assert!(info.error_code_valid());
        assert!(info.valid());
    }

    #[test]
    fn invalid_opcode_injection() {
        let info = InterruptionInfo::hardware_exception(ExceptionVector::InvalidOpcode, false);
        assert_eq!(info.0, 0x8000_0306);
        assert!(!info.error_code_valid());
    }

    #[test]
    fn nmi() {
        assert!(InterruptionInfo(0x8000_0202).is_nmi());
        assert!(!InterruptionInfo(0x8000_0302).is_nmi());
    }
}
