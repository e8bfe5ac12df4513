use eptvisor_core::{PAGE_MASK, Pa};

/// `CR3` control register.
///
/// Holds the physical address of the top-level paging structure of the
/// current address space and, with `CR4.PCIDE`, its process-context
/// identifier.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Returns the process-context identifier (PCID).
    pub fn pcid(self) -> u16 {
        (self.0 & 0xfff) as _
    }

    /// Returns the physical address of the PML4 table.
    pub fn directory_base(self) -> Pa {
        Pa::new(self.0 & PAGE_MASK & 0x000f_ffff_ffff_ffff)
    }

    /// Checks if the no-flush bit (bit 63) is set.
    pub fn no_flush(self) -> bool {
        self.0 >> 63 & 1 != 0
    }
}

impl std::fmt::Debug for Cr3 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr3")
            .field("pcid", &self.pcid())
            .field("directory_base", &self.directory_base())
            .field("no_flush", &self.no_flush())
            .finish()
    }
}

impl From<u64> for Cr3 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr3> for u64 {
    fn from(value: Cr3) -> Self {
        value.0
    }
}
