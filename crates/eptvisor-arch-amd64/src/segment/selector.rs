use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A 16-bit segment selector.
#[repr(C)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Selector(pub u16);

/// A descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTable {
    /// The Global Descriptor Table.
    Gdt,

    /// The Local Descriptor Table.
    Ldt,
}

impl Selector {
    /// Returns the requested privilege level (RPL).
    pub fn request_privilege_level(self) -> u8 {
        (self.0 & 0b11) as _
    }

    /// Returns the table the selector indexes.
    pub fn table(self) -> DescriptorTable {
        if self.0 >> 2 & 1 == 0 {
            DescriptorTable::Gdt
        }
        else {
            DescriptorTable::Ldt
        }
    }

    /// Returns the descriptor index.
    pub fn index(self) -> u16 {
        self.0 >> 3 & 0x1fff
    }

    /// Checks if the selector references no descriptor.
    ///
    /// The RPL bits do not matter.
    pub fn is_null(self) -> bool {
        self.0 & !0b11 == 0
    }

    /// Returns the byte offset of the descriptor within its table.
    pub fn descriptor_offset(self) -> u64 {
        self.index() as u64 * 8
    }

    /// Returns the selector with the RPL and TI bits cleared, as required
    /// for the host-state selector fields.
    pub fn host_selector(self) -> Self {
        Self(self.0 & !0b111)
    }
}

impl From<u16> for Selector {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Selector> for u16 {
    fn from(value: Selector) -> Self {
        value.0
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("request_privilege_level", &self.request_privilege_level())
            .field("table", &self.table())
            .field("index", &self.index())
            .finish()
    }
}
