use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Second-level memory access permissions.
    ///
    /// The bit layout matches bits 0 to 2 of an EPT entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();

        /// Combined Read and Execute permissions.
        const RX = Self::R.bits() | Self::X.bits();

        /// Full access: Read, Write, and Execute permissions.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl MemoryAccess {
    /// Checks if only the execute permission is granted.
    pub fn is_execute_only(self) -> bool {
        self == MemoryAccess::X
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 3];

        if self.contains(MemoryAccess::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryAccess::W) {
            result[1] = b'w';
        }
        if self.contains(MemoryAccess::X) {
            result[2] = b'x';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(MemoryAccess::X.to_string(), "--x");
        assert_eq!(MemoryAccess::RW.to_string(), "rw-");
        assert_eq!(MemoryAccess::RWX.to_string(), "rwx");
        assert_eq!(MemoryAccess::empty().to_string(), "---");
    }

    #[test]
    fn execute_only() {
        assert!(MemoryAccess::X.is_execute_only());
        assert!(!MemoryAccess::RX.is_execute_only());
    }
}
