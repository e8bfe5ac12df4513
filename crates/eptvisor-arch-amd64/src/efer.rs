/// Extended Feature Enable Register (EFER).
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrEfer(pub u64);

impl MsrEfer {
    const SYSCALL_ENABLE: u64 = 1;

    /// Checks if SYSCALL and SYSRET are enabled (SCE).
    ///
    /// With the bit clear both instructions raise #UD.
    pub fn syscall_enable(self) -> bool {
        self.0 & Self::SYSCALL_ENABLE != 0
    }

    /// Returns a copy with the SCE bit replaced.
    pub fn with_syscall_enable(self, value: bool) -> Self {
        if value {
            Self(self.0 | Self::SYSCALL_ENABLE)
        }
        else {
            Self(self.0 & !Self::SYSCALL_ENABLE)
        }
    }

    /// Checks if IA-32e mode is active (LMA).
    pub fn long_mode_active(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    /// Checks if execute-disable page protection is enabled (NXE).
    pub fn execute_disable(self) -> bool {
        (self.0 >> 11) & 1 != 0
    }
}

impl std::fmt::Debug for MsrEfer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MsrEfer")
            .field("syscall_enable", &self.syscall_enable())
            .field("long_mode_active", &self.long_mode_active())
            .field("execute_disable", &self.execute_disable())
            .finish()
    }
}

impl From<u64> for MsrEfer {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<MsrEfer> for u64 {
    fn from(value: MsrEfer) -> Self {
        value.0
    }
}
